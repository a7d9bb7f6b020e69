//! Remote relational backend collaborator.
//!
//! The engine only depends on this trait; transport, authentication, and
//! storage mechanics live behind it.

use crate::sync::models::RemoteRecord;
use crate::Result;
use async_trait::async_trait;

/// Selection filter for incremental pulls. Implementations must return
/// rows scoped to the couple, strictly newer than `updated_after`, ordered
/// by `updated_at` ascending.
#[derive(Debug, Clone)]
pub struct RemoteFilter {
    pub couple_id: String,
    /// Exclusive lower bound on `updated_at` (Unix milliseconds).
    pub updated_after: i64,
    pub limit: usize,
    pub offset: usize,
}

/// Handle to an active change-feed subscription; dropping or calling
/// [`Subscription::unsubscribe`] stops delivery.
pub trait Subscription: Send {
    fn unsubscribe(self: Box<Self>);
}

/// Remote relational store the engine reconciles against.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Fetch one page of rows matching the filter.
    async fn select(&self, table: &str, filter: &RemoteFilter) -> Result<Vec<RemoteRecord>>;

    /// Insert-or-update one row, keyed by `conflict_key` (the stable
    /// composite key). Last write wins on `updated_at`: implementations
    /// keep their existing row (tombstones included) when it is at least
    /// as new as the incoming one, and still return `Ok` — the caller's
    /// next pull reconciles the losing side. Must be idempotent for
    /// retries.
    async fn upsert(&self, table: &str, record: &RemoteRecord, conflict_key: &str) -> Result<()>;

    /// Subscribe to the backend's change feed for one table. The callback
    /// receives the affected table name.
    fn subscribe(
        &self,
        table: &str,
        couple_id: &str,
        callback: Box<dyn Fn(&str) + Send + Sync>,
    ) -> Result<Box<dyn Subscription>>;
}
