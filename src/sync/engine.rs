//! The push/pull sync orchestrator.
//!
//! A cycle pushes pending local rows, pulls remote changes per table
//! behind watermark cursors, then runs the attachment upload glue. Cycles
//! are single-flight (a request during a running cycle is skipped, never
//! queued) and throttled against the previous completion.

use crate::config::{SessionConfig, SyncTunables};
use crate::database::{records, schema, Database, DatabaseError};
use crate::sync::attachments::AttachmentUploader;
use crate::sync::conflict::{ConflictResolver, Resolution};
use crate::sync::events::{EventBus, SyncEvent};
use crate::sync::models::{
    CycleOutcome, CycleReport, RemoteRecord, SkipReason, TableReport,
};
use crate::sync::remote::{RemoteBackend, RemoteFilter, Subscription};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Resets the in-flight flag when a cycle exits, on any path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates synchronization between the local change store and the
/// remote backend.
pub struct SyncEngine {
    remote: Arc<dyn RemoteBackend>,
    db: Arc<Mutex<Database>>,
    session: Mutex<SessionConfig>,
    tunables: SyncTunables,
    events: EventBus,
    uploader: Option<Arc<dyn AttachmentUploader>>,
    in_flight: AtomicBool,
    last_completed: Mutex<Option<Instant>>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        db: Arc<Mutex<Database>>,
        session: SessionConfig,
        tunables: SyncTunables,
    ) -> Self {
        Self {
            remote,
            db,
            session: Mutex::new(session),
            tunables,
            events: EventBus::new(),
            uploader: None,
            in_flight: AtomicBool::new(false),
            last_completed: Mutex::new(None),
        }
    }

    /// Attach the attachment upload glue, run between pull and the
    /// follow-up attachments push.
    pub fn with_uploader(mut self, uploader: Arc<dyn AttachmentUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Lifecycle event bus for this engine.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Replace the session. Clearing it fails the next readiness check
    /// closed; a cycle already in flight runs to completion.
    pub fn set_session(&self, session: SessionConfig) {
        if let Ok(mut current) = self.session.lock() {
            *current = session;
        }
    }

    fn session_snapshot(&self) -> Result<SessionConfig> {
        Ok(self
            .session
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("session".to_string()))?
            .clone())
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> crate::database::Result<T>,
    ) -> Result<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("database".to_string()))?;
        Ok(f(db.conn())?)
    }

    fn throttled(&self) -> bool {
        match self.last_completed.lock() {
            Ok(last) => last
                .map(|at| at.elapsed() < self.tunables.min_sync_interval)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Run one full cycle: push every table, pull every table, then the
    /// attachment glue. Requests during a running cycle are skipped;
    /// completed cycles throttle the next one.
    pub async fn sync(&self) -> Result<CycleOutcome> {
        let session = self.session_snapshot()?;
        if let Err(reason) = session.ready() {
            debug!(%reason, "sync skipped: not ready");
            return Ok(CycleOutcome::Skipped(SkipReason::NotReady(reason)));
        }
        if self.throttled() {
            debug!("sync skipped: throttled");
            return Ok(CycleOutcome::Skipped(SkipReason::Throttled));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync skipped: already running");
            return Ok(CycleOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = FlightGuard(&self.in_flight);

        self.events.emit(&SyncEvent::Started);
        let couple_id = session.couple_id.clone().unwrap_or_default();

        match self.run_cycle(&couple_id).await {
            Ok(report) => {
                if let Ok(mut last) = self.last_completed.lock() {
                    *last = Some(Instant::now());
                }
                self.events.emit(&SyncEvent::Completed(report.clone()));
                Ok(CycleOutcome::Completed(report))
            }
            Err(e) => {
                self.events.emit(&SyncEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, couple_id: &str) -> Result<CycleReport> {
        let started_at = chrono::Utc::now().timestamp_millis();
        let mut reports: Vec<TableReport> = Vec::new();

        for table in schema::SYNC_TABLES {
            let mut report = TableReport::new(table);
            let (pushed, failures) = self.push_table(table, couple_id).await?;
            report.pushed = pushed;
            report.push_failures = failures;
            reports.push(report);
        }

        for report in reports.iter_mut() {
            let table = report.table.clone();
            let (pulled, tombstones, skipped) = self.pull_table_inner(&table, couple_id).await?;
            report.pulled = pulled;
            report.tombstones = tombstones;
            report.skipped_rows = skipped;
        }

        // Attachment blobs upload after pull so newly pulled rows can
        // resolve their storage paths; the rows they repend push now.
        if let Some(uploader) = &self.uploader {
            let uploaded = uploader.process_pending().await?;
            if uploaded > 0 {
                let (pushed, failures) = self.push_table("attachments", couple_id).await?;
                if let Some(report) = reports.iter_mut().find(|r| r.table == "attachments") {
                    report.pushed += pushed;
                    report.push_failures += failures;
                }
            }
        }

        let report = CycleReport {
            tables: reports,
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        };
        debug!(
            pushed = report.total_pushed(),
            pulled = report.total_pulled(),
            failures = report.total_failures(),
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Push every pending row of one table. Each row gets bounded retries
    /// with doubling backoff; a row that exhausts them stays pending for
    /// the next cycle and is counted, never dropped.
    ///
    /// An accepted upsert may have lost last-write-wins against a newer
    /// remote row; the row is still confirmed here and the following pull
    /// brings the winning value back. Confirmation carries the version
    /// captured at collection time, so a local edit landing during the
    /// network await keeps the row pending.
    async fn push_table(&self, table: &str, couple_id: &str) -> Result<(usize, usize)> {
        let pending = self.with_db(|conn| records::get_pending(conn, table))?;
        if pending.is_empty() {
            return Ok((0, 0));
        }

        let mut accepted = Vec::new();
        let mut failures = 0;

        for record in &pending {
            let remote = RemoteRecord::from_local(table, record, couple_id)?;
            if self.upsert_with_retries(table, &remote).await {
                accepted.push((record.id.clone(), record.sync_version));
            } else {
                failures += 1;
            }
        }

        if !accepted.is_empty() {
            self.with_db(|conn| records::mark_synced(conn, table, &accepted))?;
        }
        Ok((accepted.len(), failures))
    }

    async fn upsert_with_retries(&self, table: &str, remote: &RemoteRecord) -> bool {
        let mut delay = self.tunables.retry_base_delay;
        for attempt in 1..=self.tunables.max_push_attempts {
            match self.remote.upsert(table, remote, &remote.key).await {
                Ok(()) => return true,
                Err(e) if attempt < self.tunables.max_push_attempts => {
                    warn!(table, key = %remote.key, attempt, error = %e, "push attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(table, key = %remote.key, error = %e, "push exhausted retries; row stays pending");
                }
            }
        }
        false
    }

    /// Pull one table in pages behind its watermark cursor. The watermark
    /// advances past every row the page carried, including tombstones and
    /// rows skipped as unparseable, and persists after each page so a
    /// crash never re-applies finished pages.
    async fn pull_table_inner(
        &self,
        table: &str,
        couple_id: &str,
    ) -> Result<(usize, usize, usize)> {
        let mut pulled = 0;
        let mut tombstones = 0;
        let mut skipped = 0;

        loop {
            let updated_after = self.with_db(|conn| records::watermark(conn, table))?;
            let filter = RemoteFilter {
                couple_id: couple_id.to_string(),
                updated_after,
                limit: self.tunables.pull_page_size,
                offset: 0,
            };
            let page = self.remote.select(table, &filter).await?;
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let mut max_seen = updated_after;
            let mut live = Vec::new();
            let mut dead = Vec::new();

            for remote in page {
                max_seen = max_seen.max(remote.updated_at);
                if remote.is_tombstone() {
                    dead.push(remote);
                    continue;
                }
                match remote.to_local() {
                    Ok(local) => live.push(local),
                    Err(e) => {
                        warn!(table, key = %remote.key, error = %e, "skipping unparseable remote row");
                        skipped += 1;
                    }
                }
            }

            let (inserted, updated) =
                self.with_db(|conn| records::batch_upsert_from_remote(conn, table, &live))?;
            pulled += inserted + updated;

            // Tombstones apply after live rows so a delete and a stale
            // edit of the same id in one page resolve by timestamp, not
            // page order.
            for remote in &dead {
                tombstones += self.apply_remote_tombstone(table, remote)?;
            }

            self.with_db(|conn| records::set_watermark(conn, table, max_seen))?;

            if page_len < self.tunables.pull_page_size {
                break;
            }
        }

        Ok((pulled, tombstones, skipped))
    }

    fn apply_remote_tombstone(&self, table: &str, remote: &RemoteRecord) -> Result<usize> {
        let id = match remote.local_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(table, key = %remote.key, error = %e, "skipping malformed tombstone key");
                return Ok(0);
            }
        };
        let deleted_at = remote.deleted_at.unwrap_or(remote.updated_at);

        self.with_db(|conn| {
            let applied = match records::get(conn, table, &id)? {
                // Unknown id: nothing local to delete, but the watermark
                // still moves past it.
                None => false,
                Some(local) => {
                    match ConflictResolver::resolve(local.updated_at, remote.updated_at) {
                        Resolution::AcceptRemote => records::apply_tombstone(
                            conn,
                            table,
                            &id,
                            deleted_at,
                            remote.updated_at,
                        )?,
                        Resolution::KeepLocal => false,
                    }
                }
            };
            Ok(usize::from(applied))
        })
    }

    /// Targeted pull of one table, used by realtime invalidations. Skipped
    /// silently when a full cycle is in flight; the cycle's own pull will
    /// cover the change.
    pub async fn pull_table(&self, table: &str) -> Result<Option<TableReport>> {
        schema::check_table(table).map_err(crate::BetweenUsError::from)?;
        let session = self.session_snapshot()?;
        if session.ready().is_err() {
            return Ok(None);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = FlightGuard(&self.in_flight);

        self.events.emit(&SyncEvent::Realtime {
            table: table.to_string(),
        });
        let couple_id = session.couple_id.clone().unwrap_or_default();
        let (pulled, tombstones, skipped) = self.pull_table_inner(table, &couple_id).await?;

        let mut report = TableReport::new(table);
        report.pulled = pulled;
        report.tombstones = tombstones;
        report.skipped_rows = skipped;
        Ok(Some(report))
    }

    /// Subscribe to the backend change feed for every sync table and run
    /// targeted pulls as invalidations arrive. The returned handles keep
    /// the subscriptions alive; the pump task ends when they are dropped.
    pub fn spawn_realtime(self: &Arc<Self>) -> Result<Vec<Box<dyn Subscription>>> {
        let session = self.session_snapshot()?;
        let couple_id = match session.couple_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(crate::BetweenUsError::Configuration(
                    "realtime subscription requires a pairing".to_string(),
                ))
            }
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let mut handles = Vec::new();
        for table in schema::SYNC_TABLES {
            let tx = tx.clone();
            let handle = self.remote.subscribe(
                table,
                &couple_id,
                Box::new(move |changed| {
                    let _ = tx.send(changed.to_string());
                }),
            )?;
            handles.push(handle);
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(table) = rx.recv().await {
                if let Err(e) = engine.pull_table(&table).await {
                    warn!(%table, error = %e, "realtime pull failed");
                }
            }
        });

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{FieldMap, NewRecord, SyncStatus};
    use crate::BetweenUsError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type ChangeCallback = Box<dyn Fn(&str) + Send + Sync>;

    /// In-memory backend: rows per table, keyed by composite key, plus
    /// optional failure injection for the first N upserts.
    #[derive(Default)]
    struct MemoryBackend {
        rows: Mutex<HashMap<String, Vec<RemoteRecord>>>,
        fail_upserts: AtomicUsize,
        upsert_calls: AtomicUsize,
        select_delay: Option<Duration>,
        callbacks: Mutex<HashMap<String, ChangeCallback>>,
        /// Invoked inside each successful upsert, to model a local write
        /// landing during the network await.
        on_upsert: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    }

    impl MemoryBackend {
        fn new() -> Self {
            Self::default()
        }

        fn failing_first(n: usize) -> Self {
            let backend = Self::default();
            backend.fail_upserts.store(n, Ordering::SeqCst);
            backend
        }

        fn slow(delay: Duration) -> Self {
            Self {
                select_delay: Some(delay),
                ..Self::default()
            }
        }

        fn seed(&self, table: &str, record: RemoteRecord) {
            self.rows
                .lock()
                .unwrap()
                .entry(table.to_string())
                .or_default()
                .push(record);
        }

        fn stored(&self, table: &str) -> Vec<RemoteRecord> {
            self.rows
                .lock()
                .unwrap()
                .get(table)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RemoteBackend for MemoryBackend {
        async fn select(&self, table: &str, filter: &RemoteFilter) -> Result<Vec<RemoteRecord>> {
            if let Some(delay) = self.select_delay {
                tokio::time::sleep(delay).await;
            }
            let mut rows: Vec<RemoteRecord> = self
                .stored(table)
                .into_iter()
                .filter(|r| r.couple_id == filter.couple_id && r.updated_at > filter.updated_after)
                .collect();
            rows.sort_by_key(|r| r.updated_at);
            rows.truncate(filter.limit);
            Ok(rows)
        }

        async fn upsert(&self, table: &str, record: &RemoteRecord, conflict_key: &str) -> Result<()> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_upserts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_upserts.store(remaining - 1, Ordering::SeqCst);
                return Err(BetweenUsError::Network("injected failure".to_string()));
            }
            if let Some(hook) = self.on_upsert.lock().unwrap().as_ref() {
                hook();
            }

            let mut rows = self.rows.lock().unwrap();
            let table_rows = rows.entry(table.to_string()).or_default();
            match table_rows.iter_mut().find(|r| r.key == conflict_key) {
                // Last write wins: an existing row at least as new as the
                // incoming one is kept.
                Some(existing) if existing.updated_at >= record.updated_at => {}
                Some(existing) => *existing = record.clone(),
                None => table_rows.push(record.clone()),
            }
            Ok(())
        }

        fn subscribe(
            &self,
            table: &str,
            _couple_id: &str,
            callback: Box<dyn Fn(&str) + Send + Sync>,
        ) -> Result<Box<dyn Subscription>> {
            self.callbacks
                .lock()
                .unwrap()
                .insert(table.to_string(), callback);

            struct Noop;
            impl Subscription for Noop {
                fn unsubscribe(self: Box<Self>) {}
            }
            Ok(Box::new(Noop))
        }
    }

    fn test_tunables() -> SyncTunables {
        SyncTunables {
            pull_page_size: 10,
            min_sync_interval: Duration::ZERO,
            max_push_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn test_db() -> Arc<Mutex<Database>> {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        Arc::new(Mutex::new(db))
    }

    fn engine_with(backend: Arc<MemoryBackend>, db: Arc<Mutex<Database>>) -> SyncEngine {
        SyncEngine::new(
            backend,
            db,
            SessionConfig::new("couple-1", "user-a"),
            test_tunables(),
        )
    }

    fn meta(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    fn insert_local(db: &Arc<Mutex<Database>>, table: &str, id: &str) {
        let guard = db.lock().unwrap();
        records::insert(
            guard.conn(),
            table,
            &NewRecord {
                id: id.to_string(),
                metadata: meta(&[("mood", "happy")]),
                payload: meta(&[("body", "sealed")]),
                created_by: Some("user-a".to_string()),
            },
        )
        .unwrap();
    }

    fn local_status(db: &Arc<Mutex<Database>>, table: &str, id: &str) -> SyncStatus {
        let guard = db.lock().unwrap();
        records::get(guard.conn(), table, id)
            .unwrap()
            .unwrap()
            .sync_status
    }

    fn remote_row(table: &str, id: &str, couple_id: &str, updated_at: i64) -> RemoteRecord {
        RemoteRecord {
            key: RemoteRecord::composite_key(table, id),
            data_type: table.to_string(),
            metadata: serde_json::to_string(&meta(&[("mood", "remote")])).unwrap(),
            encrypted_payload: Some(
                serde_json::to_string(&meta(&[("body", "remote-envelope")])).unwrap(),
            ),
            couple_id: couple_id.to_string(),
            created_by: Some("user-b".to_string()),
            is_private: false,
            is_deleted: false,
            deleted_at: None,
            updated_at,
        }
    }

    #[tokio::test]
    async fn full_cycle_pushes_pending_and_marks_synced() {
        let backend = Arc::new(MemoryBackend::new());
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");
        insert_local(&db, "checkins", "c1");

        let engine = engine_with(backend.clone(), db.clone());
        let outcome = engine.sync().await.unwrap();

        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.total_pushed(), 2);
        assert_eq!(report.total_failures(), 0);
        assert_eq!(local_status(&db, "journal_entries", "e1"), SyncStatus::Synced);
        assert_eq!(local_status(&db, "checkins", "c1"), SyncStatus::Synced);

        let stored = backend.stored("journal_entries");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].key, "journal_entries:e1");
        assert_eq!(stored[0].couple_id, "couple-1");
    }

    #[tokio::test]
    async fn push_retries_then_succeeds_within_bound() {
        // Two injected failures, three attempts allowed.
        let backend = Arc::new(MemoryBackend::failing_first(2));
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");

        let engine = engine_with(backend.clone(), db.clone());
        let outcome = engine.sync().await.unwrap();

        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.total_pushed(), 1);
        assert_eq!(report.total_failures(), 0);
        assert_eq!(backend.upsert_calls.load(Ordering::SeqCst), 3);
        assert_eq!(local_status(&db, "journal_entries", "e1"), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn push_exhausting_retries_leaves_row_pending() {
        let backend = Arc::new(MemoryBackend::failing_first(100));
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");

        let engine = engine_with(backend.clone(), db.clone());
        let outcome = engine.sync().await.unwrap();

        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.total_pushed(), 0);
        assert_eq!(report.total_failures(), 1);
        assert_eq!(backend.upsert_calls.load(Ordering::SeqCst), 3);
        // The row is retried on the next cycle, never dropped.
        assert_eq!(local_status(&db, "journal_entries", "e1"), SyncStatus::Pending);
    }

    #[tokio::test]
    async fn pull_applies_newer_remote_rows() {
        let backend = Arc::new(MemoryBackend::new());
        let far_future = chrono::Utc::now().timestamp_millis() + 60_000;
        backend.seed(
            "journal_entries",
            remote_row("journal_entries", "r1", "couple-1", far_future),
        );

        let db = test_db();
        let engine = engine_with(backend, db.clone());
        let outcome = engine.sync().await.unwrap();

        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.total_pulled(), 1);

        let guard = db.lock().unwrap();
        let local = records::get(guard.conn(), "journal_entries", "r1")
            .unwrap()
            .unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(
            local.metadata.get("mood").and_then(|v| v.as_str()),
            Some("remote")
        );
        // Watermark advanced past the pulled row.
        assert_eq!(
            records::watermark(guard.conn(), "journal_entries").unwrap(),
            far_future
        );
    }

    #[tokio::test]
    async fn full_cycle_keeps_newer_remote_over_stale_pending_local() {
        let backend = Arc::new(MemoryBackend::new());
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");

        // The partner edited the same row after our pending write.
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        backend.seed(
            "journal_entries",
            remote_row("journal_entries", "e1", "couple-1", future),
        );

        let engine = engine_with(backend.clone(), db.clone());
        engine.sync().await.unwrap();

        // The stale push did not clobber the newer remote row.
        let stored = backend.stored("journal_entries");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].updated_at, future);
        assert!(stored[0].metadata.contains("remote"));

        // The pull reflected the newer value locally.
        let guard = db.lock().unwrap();
        let local = records::get(guard.conn(), "journal_entries", "e1")
            .unwrap()
            .unwrap();
        assert_eq!(
            local.metadata.get("mood").and_then(|v| v.as_str()),
            Some("remote")
        );
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn mutation_during_push_keeps_row_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");

        // A local edit lands while the upsert is on the wire.
        {
            let db = db.clone();
            *backend.on_upsert.lock().unwrap() = Some(Box::new(move || {
                let guard = db.lock().unwrap();
                records::update(
                    guard.conn(),
                    "journal_entries",
                    "e1",
                    &meta(&[("mood", "edited")]),
                    &meta(&[("body", "newer-envelope")]),
                )
                .unwrap();
            }));
        }

        let engine = engine_with(backend, db.clone());
        engine.sync().await.unwrap();

        // The confirmation for the pushed snapshot must not swallow the
        // edit; it pushes on the next cycle.
        let guard = db.lock().unwrap();
        let row = records::get(guard.conn(), "journal_entries", "e1")
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_status, SyncStatus::Pending);
        assert_eq!(row.sync_version, 2);
        assert_eq!(
            row.metadata.get("mood").and_then(|v| v.as_str()),
            Some("edited")
        );
    }

    #[tokio::test]
    async fn remote_tombstone_soft_deletes_local_row() {
        let backend = Arc::new(MemoryBackend::new());
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");

        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        let mut tombstone = remote_row("journal_entries", "e1", "couple-1", future);
        tombstone.encrypted_payload = None;
        tombstone.is_deleted = true;
        tombstone.deleted_at = Some(future);
        backend.seed("journal_entries", tombstone);

        let engine = engine_with(backend, db.clone());
        let outcome = engine.sync().await.unwrap();
        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.tables[0].tombstones, 1);

        let guard = db.lock().unwrap();
        let local = records::get(guard.conn(), "journal_entries", "e1")
            .unwrap()
            .unwrap();
        assert!(local.is_deleted());
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn tombstone_for_unknown_id_still_advances_watermark() {
        let backend = Arc::new(MemoryBackend::new());
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        let mut tombstone = remote_row("journal_entries", "ghost", "couple-1", future);
        tombstone.encrypted_payload = None;
        tombstone.is_deleted = true;
        tombstone.deleted_at = Some(future);
        backend.seed("journal_entries", tombstone);

        let db = test_db();
        let engine = engine_with(backend, db.clone());
        let outcome = engine.sync().await.unwrap();
        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.tables[0].tombstones, 0);

        let guard = db.lock().unwrap();
        assert_eq!(
            records::watermark(guard.conn(), "journal_entries").unwrap(),
            future
        );
    }

    #[tokio::test]
    async fn stale_remote_tombstone_keeps_newer_local_row() {
        let backend = Arc::new(MemoryBackend::new());
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");

        // Tombstone older than the local row: last write wins, row stays.
        let mut tombstone = remote_row("journal_entries", "e1", "couple-1", 1_000);
        tombstone.encrypted_payload = None;
        tombstone.is_deleted = true;
        tombstone.deleted_at = Some(1_000);
        backend.seed("journal_entries", tombstone);

        let engine = engine_with(backend, db.clone());
        engine.sync().await.unwrap();

        let guard = db.lock().unwrap();
        let local = records::get(guard.conn(), "journal_entries", "e1")
            .unwrap()
            .unwrap();
        assert!(!local.is_deleted());
    }

    #[tokio::test]
    async fn corrupted_remote_row_is_skipped_and_counted() {
        let backend = Arc::new(MemoryBackend::new());
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        let mut bad = remote_row("journal_entries", "bad", "couple-1", future);
        bad.metadata = "{not json".to_string();
        backend.seed("journal_entries", bad);
        backend.seed(
            "journal_entries",
            remote_row("journal_entries", "good", "couple-1", future + 1),
        );

        let db = test_db();
        let engine = engine_with(backend, db.clone());
        let outcome = engine.sync().await.unwrap();
        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.tables[0].skipped_rows, 1);
        assert_eq!(report.tables[0].pulled, 1);

        // The watermark still moved past the corrupted row.
        let guard = db.lock().unwrap();
        assert_eq!(
            records::watermark(guard.conn(), "journal_entries").unwrap(),
            future + 1
        );
    }

    #[tokio::test]
    async fn unready_session_skips_with_reason() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = SyncEngine::new(
            backend,
            test_db(),
            SessionConfig::default(),
            test_tunables(),
        );

        let outcome = engine.sync().await.unwrap();
        match outcome {
            CycleOutcome::Skipped(SkipReason::NotReady(reason)) => {
                assert_eq!(reason, "no pairing configured");
            }
            other => panic!("expected not-ready skip, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn completed_cycle_throttles_the_next_request() {
        let backend = Arc::new(MemoryBackend::new());
        let tunables = SyncTunables {
            min_sync_interval: Duration::from_secs(60),
            ..test_tunables()
        };
        let engine = SyncEngine::new(
            backend,
            test_db(),
            SessionConfig::new("couple-1", "user-a"),
            tunables,
        );

        assert!(!engine.sync().await.unwrap().is_skipped());
        match engine.sync().await.unwrap() {
            CycleOutcome::Skipped(SkipReason::Throttled) => {}
            other => panic!("expected throttled skip, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrent_request_is_skipped_not_queued() {
        let backend = Arc::new(MemoryBackend::slow(Duration::from_millis(50)));
        let engine = Arc::new(engine_with(backend, test_db()));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = engine.sync().await.unwrap();
        match second {
            CycleOutcome::Skipped(SkipReason::AlreadyRunning) => {}
            other => panic!("expected already-running skip, got {:?}", other),
        }
        assert!(!first.await.unwrap().unwrap().is_skipped());
    }

    #[tokio::test]
    async fn events_fire_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        let db = test_db();
        insert_local(&db, "journal_entries", "e1");
        let engine = engine_with(backend, db);

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        engine.events().subscribe(move |event| {
            let tag = match event {
                SyncEvent::Started => "started",
                SyncEvent::Completed(_) => "completed",
                SyncEvent::Error(_) => "error",
                SyncEvent::Realtime { .. } => "realtime",
            };
            sink.lock().unwrap().push(tag);
        });

        engine.sync().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["started", "completed"]);
    }

    #[tokio::test]
    async fn targeted_pull_fetches_one_table_and_emits_realtime() {
        let backend = Arc::new(MemoryBackend::new());
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        backend.seed("checkins", remote_row("checkins", "c1", "couple-1", future));

        let db = test_db();
        let engine = engine_with(backend, db.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.events().subscribe(move |event| {
            if let SyncEvent::Realtime { table } = event {
                sink.lock().unwrap().push(table.clone());
            }
        });

        let report = engine.pull_table("checkins").await.unwrap().unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["checkins".to_string()]);

        let guard = db.lock().unwrap();
        assert!(records::get(guard.conn(), "checkins", "c1")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn realtime_invalidation_triggers_targeted_pull() {
        let backend = Arc::new(MemoryBackend::new());
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        backend.seed("checkins", remote_row("checkins", "c1", "couple-1", future));

        let db = test_db();
        let engine = Arc::new(engine_with(backend.clone(), db.clone()));
        let _handles = engine.spawn_realtime().unwrap();

        // Simulate the backend signalling a change on one table.
        {
            let callbacks = backend.callbacks.lock().unwrap();
            callbacks["checkins"]("checkins");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let guard = db.lock().unwrap();
        assert!(records::get(guard.conn(), "checkins", "c1")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn targeted_pull_rejects_unknown_table() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine_with(backend, test_db());
        assert!(engine.pull_table("sqlite_master").await.is_err());
    }

    #[tokio::test]
    async fn uploader_runs_and_attachments_repush() {
        struct FakeUploader {
            db: Arc<Mutex<Database>>,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl AttachmentUploader for FakeUploader {
            async fn process_pending(&self) -> Result<usize> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                // Simulate an upload finishing: record the storage path,
                // which re-marks the attachment row pending.
                let guard = self.db.lock().unwrap();
                records::update(
                    guard.conn(),
                    "attachments",
                    "a1",
                    &meta(&[("storage_path", "couple-1/a1.bin")]),
                    &meta(&[("caption", "sealed")]),
                )
                .unwrap();
                Ok(1)
            }
        }

        let backend = Arc::new(MemoryBackend::new());
        let db = test_db();
        insert_local(&db, "attachments", "a1");

        let uploader = Arc::new(FakeUploader {
            db: db.clone(),
            calls: AtomicUsize::new(0),
        });
        let engine =
            engine_with(backend.clone(), db.clone()).with_uploader(uploader.clone());

        let outcome = engine.sync().await.unwrap();
        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };

        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
        // Pushed once in the main phase and once after the upload.
        let attachments = report
            .tables
            .iter()
            .find(|r| r.table == "attachments")
            .unwrap();
        assert_eq!(attachments.pushed, 2);
        assert_eq!(local_status(&db, "attachments", "a1"), SyncStatus::Synced);

        let stored = backend.stored("attachments");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].metadata.contains("couple-1/a1.bin"));
    }

    #[tokio::test]
    async fn pull_pages_until_short_page() {
        let backend = Arc::new(MemoryBackend::new());
        let base = chrono::Utc::now().timestamp_millis() + 60_000;
        for i in 0..25 {
            backend.seed(
                "journal_entries",
                remote_row(
                    "journal_entries",
                    &format!("r{}", i),
                    "couple-1",
                    base + i as i64,
                ),
            );
        }

        let db = test_db();
        let engine = engine_with(backend, db.clone());
        let outcome = engine.sync().await.unwrap();
        let report = match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        // Page size is 10: three pages (10, 10, 5).
        assert_eq!(report.total_pulled(), 25);

        let guard = db.lock().unwrap();
        assert_eq!(
            records::watermark(guard.conn(), "journal_entries").unwrap(),
            base + 24
        );
    }
}
