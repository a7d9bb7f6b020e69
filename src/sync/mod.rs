//! E2E encrypted synchronization between the local change store and a
//! remote relational backend.
//!
//! - Push/pull cycles with per-table watermark cursors
//! - Last-write-wins conflict resolution on `updated_at`
//! - Tombstone propagation for soft deletes
//! - Bounded retries with exponential backoff
//! - Lifecycle events for observability

pub mod attachments;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod models;
pub mod remote;

pub use conflict::{ConflictResolver, Resolution};
pub use engine::SyncEngine;
pub use events::{EventBus, SyncEvent};
pub use models::{CycleOutcome, CycleReport, RemoteRecord, SkipReason, TableReport};
pub use remote::{RemoteBackend, RemoteFilter};
