//! Wire format for remote rows and sync cycle reporting.

use crate::database::models::{FieldMap, LocalRecord, SyncSource, SyncStatus};
use crate::database::DatabaseError;
use serde::{Deserialize, Serialize};

/// One row in the remote relational store.
///
/// `metadata` holds only fields needed for remote sorting and filtering —
/// never sensitive content. `encrypted_payload` is a serialized map of
/// field name to sealed envelope, passed through verbatim by sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Stable composite of data type and local id; the idempotency key
    /// for upserts.
    pub key: String,
    pub data_type: String,
    /// Serialized plaintext field map.
    pub metadata: String,
    /// Serialized map of field name -> envelope. Absent for tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
    pub couple_id: String,
    pub created_by: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Unix milliseconds. The single source of truth for conflict
    /// resolution.
    pub updated_at: i64,
}

impl RemoteRecord {
    /// Stable composite key for a row.
    pub fn composite_key(data_type: &str, id: &str) -> String {
        format!("{}:{}", data_type, id)
    }

    /// Build the remote representation of a local row. Encrypted fields
    /// are forwarded as they are; a soft-deleted row becomes a tombstone.
    pub fn from_local(
        table: &str,
        record: &LocalRecord,
        couple_id: &str,
    ) -> Result<Self, DatabaseError> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let encrypted_payload = if record.is_deleted() || record.payload.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&record.payload)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )
        };

        Ok(Self {
            key: Self::composite_key(table, &record.id),
            data_type: table.to_string(),
            metadata,
            encrypted_payload,
            couple_id: couple_id.to_string(),
            created_by: record.created_by.clone(),
            is_private: false,
            is_deleted: record.is_deleted(),
            deleted_at: record.deleted_at,
            updated_at: record.updated_at,
        })
    }

    /// The local id portion of the composite key.
    pub fn local_id(&self) -> Result<&str, DatabaseError> {
        let prefix_len = self.data_type.len() + 1;
        if self.key.len() > prefix_len
            && self.key.starts_with(self.data_type.as_str())
            && self.key.as_bytes()[self.data_type.len()] == b':'
        {
            Ok(&self.key[prefix_len..])
        } else {
            Err(DatabaseError::Other(format!(
                "Malformed remote key '{}' for data type '{}'",
                self.key, self.data_type
            )))
        }
    }

    /// Reconstruct the local row shape from a live remote row.
    ///
    /// Fails with a serialization error when `metadata` or
    /// `encrypted_payload` cannot be parsed; such rows are skipped by the
    /// pull loop, not fatal to the page.
    pub fn to_local(&self) -> Result<LocalRecord, DatabaseError> {
        let id = self.local_id()?.to_string();
        let metadata: FieldMap = serde_json::from_str(&self.metadata)
            .map_err(|e| DatabaseError::Serialization(format!("metadata: {}", e)))?;
        let payload: FieldMap = match &self.encrypted_payload {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| DatabaseError::Serialization(format!("encrypted_payload: {}", e)))?,
            None => FieldMap::new(),
        };

        Ok(LocalRecord {
            id,
            metadata,
            payload,
            sync_status: SyncStatus::Synced,
            sync_version: 1,
            sync_source: SyncSource::Remote,
            deleted_at: self.deleted_at,
            created_by: self.created_by.clone(),
            updated_at: self.updated_at,
        })
    }

    /// Tombstone flag, honoring either representation on the wire.
    pub fn is_tombstone(&self) -> bool {
        self.is_deleted || self.deleted_at.is_some()
    }
}

/// Why a requested cycle did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The readiness predicate failed (no pairing, identity, or
    /// entitlement).
    NotReady(String),
    /// The previous cycle completed too recently.
    Throttled,
    /// A cycle is already in flight; never queued.
    AlreadyRunning,
}

/// Per-table counters from one cycle.
#[derive(Debug, Clone, Default)]
pub struct TableReport {
    pub table: String,
    pub pushed: usize,
    /// Rows that exhausted their retries and stayed pending.
    pub push_failures: usize,
    pub pulled: usize,
    pub tombstones: usize,
    /// Remote rows skipped because they could not be parsed.
    pub skipped_rows: usize,
}

impl TableReport {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub tables: Vec<TableReport>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl CycleReport {
    pub fn total_pushed(&self) -> usize {
        self.tables.iter().map(|t| t.pushed).sum()
    }

    pub fn total_pulled(&self) -> usize {
        self.tables.iter().map(|t| t.pulled).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.tables.iter().map(|t| t.push_failures).sum()
    }
}

/// Outcome of a sync request.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
}

impl CycleOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}
