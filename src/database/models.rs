//! Local row shapes and sync bookkeeping enums.

use serde::{Deserialize, Serialize};

/// Sync state of a local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            _ => Self::Pending,
        }
    }
}

/// Origin of the last write to a row. Pull-applied writes are marked
/// `remote` so they never re-trigger a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Local,
    Remote,
}

impl SyncSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "remote" => Self::Remote,
            _ => Self::Local,
        }
    }
}

/// A JSON map of field name to value. `metadata` maps hold plaintext
/// fields safe for remote sorting and filtering; `payload` maps hold
/// field name to sealed envelope.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// One mutable entity instance with its sync bookkeeping.
#[derive(Debug, Clone)]
pub struct LocalRecord {
    pub id: String,
    /// Plaintext fields. Never contains sensitive content.
    pub metadata: FieldMap,
    /// Already-encrypted fields: field name -> envelope. Forwarded to the
    /// remote store verbatim, never re-encrypted by sync.
    pub payload: FieldMap,
    pub sync_status: SyncStatus,
    /// Bumped on every local mutation.
    pub sync_version: i64,
    pub sync_source: SyncSource,
    /// Soft-delete tombstone marker; null while live.
    pub deleted_at: Option<i64>,
    pub created_by: Option<String>,
    /// Unix milliseconds. The single source of truth for conflicts.
    pub updated_at: i64,
}

impl LocalRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for a new local write; bookkeeping fields are filled in by the
/// store.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    pub id: String,
    pub metadata: FieldMap,
    pub payload: FieldMap,
    pub created_by: Option<String>,
}

impl NewRecord {
    /// Build a new record with a freshly generated id.
    pub fn new(metadata: FieldMap, payload: FieldMap, created_by: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata,
            payload,
            created_by,
        }
    }
}
