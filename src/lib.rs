//! BetweenUs Sync Core Library
//!
//! Local-first, end-to-end encrypted synchronization engine for a paired
//! couple's shared dataset: envelope encryption with device and couple key
//! tiers, X25519 + HKDF couple key exchange, a SQLite change store with sync
//! bookkeeping, and a push/pull orchestrator against a remote relational
//! backend.

pub mod config;
pub mod crypto;
pub mod database;
pub mod sync;

pub use config::{SessionConfig, SyncTunables};
pub use crypto::envelope::{decrypt, encrypt, Envelope, EnvelopeKind};
pub use crypto::exchange::CoupleKeyExchange;
pub use crypto::keys::{KeyTier, Keystore, ResolvedKey, SymmetricKey};
pub use crypto::secrets::{CredentialStore, KeyringStore, MemoryStore};
pub use crypto::CryptoError;
pub use database::{Database, DatabaseError};
pub use sync::engine::SyncEngine;
pub use sync::models::{CycleOutcome, CycleReport, RemoteRecord, SkipReason};

use thiserror::Error;

/// Result type for sync core operations
pub type Result<T> = std::result::Result<T, BetweenUsError>;

/// General error type for sync core operations
#[derive(Error, Debug)]
pub enum BetweenUsError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] database::DatabaseError),

    /// A security policy or configuration violation. Never recovered
    /// locally and never substituted with a weaker key.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient remote I/O failure. Retried internally with backoff;
    /// surfaced only as aggregate failure counts once retries are exhausted.
    #[error("Network error: {0}")]
    Network(String),

    /// The couple key is unavailable at write time. The caller should
    /// prompt re-pairing instead of queuing data insecurely.
    #[error("Reconnect required: couple key unavailable")]
    ReconnectRequired,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
