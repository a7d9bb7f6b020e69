//! Row bookkeeping: every write path marks rows pending, bumps versions,
//! and keeps tombstones so deletions survive synchronization.

use crate::database::models::{FieldMap, LocalRecord, NewRecord, SyncSource, SyncStatus};
use crate::database::schema::check_table;
use crate::database::{DatabaseError, Result};
use rusqlite::{params, Connection, OptionalExtension};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn encode_map(map: &FieldMap) -> Result<String> {
    serde_json::to_string(map).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn decode_map(raw: &str) -> Result<FieldMap> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

type RawRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    Option<i64>,
    Option<String>,
    i64,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_record(raw: RawRow) -> Result<LocalRecord> {
    let (id, metadata, payload, status, version, source, deleted_at, created_by, updated_at) = raw;
    Ok(LocalRecord {
        id,
        metadata: decode_map(&metadata)?,
        payload: decode_map(&payload)?,
        sync_status: SyncStatus::parse(&status),
        sync_version: version,
        sync_source: SyncSource::parse(&source),
        deleted_at,
        created_by,
        updated_at,
    })
}

const SELECT_COLUMNS: &str =
    "id, metadata, payload, sync_status, sync_version, sync_source, deleted_at, created_by, updated_at";

/// Insert a new row. Marked pending at version 1.
pub fn insert(conn: &Connection, table: &str, new: &NewRecord) -> Result<LocalRecord> {
    check_table(table)?;
    let now = now_ms();

    conn.execute(
        &format!(
            "INSERT INTO {} (id, metadata, payload, sync_status, sync_version, sync_source,
                             deleted_at, created_by, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 1, 'local', NULL, ?4, ?5)",
            table
        ),
        params![
            new.id,
            encode_map(&new.metadata)?,
            encode_map(&new.payload)?,
            new.created_by,
            now,
        ],
    )?;

    Ok(LocalRecord {
        id: new.id.clone(),
        metadata: new.metadata.clone(),
        payload: new.payload.clone(),
        sync_status: SyncStatus::Pending,
        sync_version: 1,
        sync_source: SyncSource::Local,
        deleted_at: None,
        created_by: new.created_by.clone(),
        updated_at: now,
    })
}

/// Update a row's fields. Re-marks it pending and bumps the version.
pub fn update(
    conn: &Connection,
    table: &str,
    id: &str,
    metadata: &FieldMap,
    payload: &FieldMap,
) -> Result<bool> {
    check_table(table)?;
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET metadata = ?1, payload = ?2,
                sync_status = 'pending', sync_version = sync_version + 1,
                sync_source = 'local', updated_at = ?3
             WHERE id = ?4",
            table
        ),
        params![encode_map(metadata)?, encode_map(payload)?, now_ms(), id],
    )?;
    Ok(changed > 0)
}

/// Fetch one row by id.
pub fn get(conn: &Connection, table: &str, id: &str) -> Result<Option<LocalRecord>> {
    check_table(table)?;
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM {} WHERE id = ?1", SELECT_COLUMNS, table),
            [id],
            read_row,
        )
        .optional()?;
    raw.map(into_record).transpose()
}

/// Soft-delete a row: sets the tombstone marker and re-marks it pending so
/// the deletion itself synchronizes. The row is not physically removed.
pub fn soft_delete(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    check_table(table)?;
    let now = now_ms();
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET deleted_at = ?1,
                sync_status = 'pending', sync_version = sync_version + 1,
                sync_source = 'local', updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            table
        ),
        params![now, id],
    )?;
    Ok(changed > 0)
}

/// All rows awaiting push.
pub fn get_pending(conn: &Connection, table: &str) -> Result<Vec<LocalRecord>> {
    check_table(table)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE sync_status = 'pending' ORDER BY updated_at ASC",
        SELECT_COLUMNS, table
    ))?;
    let rows = stmt.query_map([], read_row)?;

    let mut records = Vec::new();
    for raw in rows {
        records.push(into_record(raw?)?);
    }
    Ok(records)
}

/// Mark rows synced after confirmed remote acceptance. Each entry carries
/// the `sync_version` captured when the row was collected for push; a row
/// mutated since then no longer matches and stays pending, so the newer
/// local change is never silently confirmed.
pub fn mark_synced(conn: &Connection, table: &str, rows: &[(String, i64)]) -> Result<()> {
    check_table(table)?;
    let mut stmt = conn.prepare(&format!(
        "UPDATE {} SET sync_status = 'synced' WHERE id = ?1 AND sync_version = ?2",
        table
    ))?;
    for (id, version) in rows {
        stmt.execute(params![id, version])?;
    }
    Ok(())
}

/// Apply a page of remote rows in one transaction: either all rows apply
/// or none do. Last-write-wins on `updated_at` — an existing local row is
/// only overwritten by a strictly newer remote one.
///
/// Returns `(inserted, updated)`.
pub fn batch_upsert_from_remote(
    conn: &Connection,
    table: &str,
    records: &[LocalRecord],
) -> Result<(usize, usize)> {
    check_table(table)?;

    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    let mut updated = 0;

    {
        let mut exists_stmt =
            tx.prepare(&format!("SELECT 1 FROM {} WHERE id = ?1", table))?;
        let mut upsert_stmt = tx.prepare(&format!(
            "INSERT INTO {t} (id, metadata, payload, sync_status, sync_version, sync_source,
                              deleted_at, created_by, updated_at)
             VALUES (?1, ?2, ?3, 'synced', ?4, 'remote', ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                metadata = excluded.metadata,
                payload = excluded.payload,
                sync_status = 'synced',
                sync_version = excluded.sync_version,
                sync_source = 'remote',
                deleted_at = excluded.deleted_at,
                created_by = excluded.created_by,
                updated_at = excluded.updated_at
             WHERE excluded.updated_at > updated_at",
            t = table
        ))?;

        for record in records {
            let existed = exists_stmt
                .query_row([&record.id], |_| Ok(()))
                .optional()?
                .is_some();

            let changed = upsert_stmt.execute(params![
                record.id,
                encode_map(&record.metadata)?,
                encode_map(&record.payload)?,
                record.sync_version,
                record.deleted_at,
                record.created_by,
                record.updated_at,
            ])?;

            if changed > 0 {
                if existed {
                    updated += 1;
                } else {
                    inserted += 1;
                }
            }
        }
    }

    tx.commit()?;
    Ok((inserted, updated))
}

/// Apply a remote tombstone: soft-deletes the matching local row if it is
/// still live. Idempotent; a tombstone for an unknown id is a no-op.
pub fn apply_tombstone(
    conn: &Connection,
    table: &str,
    id: &str,
    deleted_at: i64,
    updated_at: i64,
) -> Result<bool> {
    check_table(table)?;
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET deleted_at = ?1, updated_at = ?2,
                sync_status = 'synced', sync_source = 'remote'
             WHERE id = ?3 AND deleted_at IS NULL",
            table
        ),
        params![deleted_at, updated_at, id],
    )?;
    Ok(changed > 0)
}

/// Physically remove soft-deleted rows older than the cutoff. The only
/// path that destroys rows; sync itself never does.
pub fn purge_deleted(conn: &Connection, table: &str, older_than_ms: i64) -> Result<usize> {
    check_table(table)?;
    let removed = conn.execute(
        &format!(
            "DELETE FROM {} WHERE deleted_at IS NOT NULL AND deleted_at < ?1
               AND sync_status = 'synced'",
            table
        ),
        [older_than_ms],
    )?;
    Ok(removed)
}

/// The per-table pull cursor: greatest remote `updated_at` already
/// applied. Starts at the epoch.
pub fn watermark(conn: &Connection, table: &str) -> Result<i64> {
    check_table(table)?;
    let value = conn
        .query_row(
            "SELECT last_pulled_at FROM sync_watermarks WHERE table_name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0))
}

/// Persist the pull cursor. Called after every applied page so a crash
/// mid-pull does not re-fetch already-applied pages.
pub fn set_watermark(conn: &Connection, table: &str, last_pulled_at: i64) -> Result<()> {
    check_table(table)?;
    conn.execute(
        "INSERT INTO sync_watermarks (table_name, last_pulled_at) VALUES (?1, ?2)
         ON CONFLICT(table_name) DO UPDATE SET last_pulled_at = excluded.last_pulled_at",
        params![table, last_pulled_at],
    )?;
    Ok(())
}
