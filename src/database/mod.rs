//! Local change store: SQLite-backed entity tables with sync bookkeeping.
//!
//! Every mutable entity row carries sync bookkeeping fields alongside its
//! business data; all local writes go through this module so the pending
//! state and version counters stay consistent.

pub mod models;
pub mod records;
pub mod schema;

pub use models::{FieldMap, LocalRecord, NewRecord, SyncSource, SyncStatus};
pub use schema::{Database, SYNC_TABLES};

use thiserror::Error;

/// Errors from the local change store.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The table identifier is not in the known schema. Rejected before
    /// any SQL construction.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Database error: {0}")]
    Other(String),
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;
