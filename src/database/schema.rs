//! Database handle, schema initialization, and the table allow-list.

use crate::database::{DatabaseError, Result};
use rusqlite::Connection;
use std::path::Path;

/// Entity tables known to the sync schema. Any other table identifier is
/// rejected before reaching SQL construction.
pub const SYNC_TABLES: &[&str] = &["journal_entries", "checkins", "attachments"];

const SCHEMA_VERSION: i64 = 1;

/// Handle to the local SQLite store.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (tests, previews).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Create all tables if absent. Idempotent.
    pub fn initialize_schema(&self) -> Result<()> {
        let current: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE((SELECT version FROM schema_version WHERE id = 1), 0)",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current >= SCHEMA_VERSION {
            return Ok(());
        }

        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_watermarks (
                table_name TEXT PRIMARY KEY,
                last_pulled_at INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        for table in SYNC_TABLES {
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id TEXT PRIMARY KEY,
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    payload TEXT NOT NULL DEFAULT '{{}}',
                    sync_status TEXT NOT NULL DEFAULT 'pending',
                    sync_version INTEGER NOT NULL DEFAULT 1,
                    sync_source TEXT NOT NULL DEFAULT 'local',
                    deleted_at INTEGER,
                    created_by TEXT,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{t}_sync_status ON {t} (sync_status);
                CREATE INDEX IF NOT EXISTS idx_{t}_updated_at ON {t} (updated_at);",
                t = table
            ))?;
        }

        self.conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            [SCHEMA_VERSION],
        )?;

        Ok(())
    }
}

/// Reject any table identifier not in the known schema.
pub fn check_table(table: &str) -> Result<()> {
    if SYNC_TABLES.contains(&table) {
        Ok(())
    } else {
        Err(DatabaseError::UnknownTable(table.to_string()))
    }
}
