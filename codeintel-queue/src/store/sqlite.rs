//! SQLite-backed work store.
//!
//! A dequeue claims a row in a short write transaction: the row becomes
//! `processing` and `locked_by` records the claim token of the work
//! transaction that now owns it. Writes made through that transaction are
//! journaled and applied in a single SQLite transaction on commit, after
//! checking the claim is still held. Savepoints are marks in the journal.
//!
//! Claims do not survive the process. Opening the store releases every
//! claim left behind, so rows a crashed process was working on stay
//! `processing` without a lock and the resetter picks them up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::journal::{Change, Journal};
use super::{
    DequeueConditions, Finalize, IndexableRepositoryQuery, QueueStats, ResetOutcome, ResetStore,
    SavepointId, SchedulerStore, SchedulerTransaction, StoreConfig, WorkStore, WorkTransaction,
};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::models::{NewWorkItem, Package, PackageReference, RepositoryUsage, WorkItem, WorkState};

const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ITEM_COLUMNS: &str = "id, state, repository_id, commit_sha, root, indexer, indexer_args, \
     outfile, docker_steps, local_steps, failure_message, num_resets, num_failures, \
     queued_at_ns, started_at_ns, finished_at_ns, process_after_ns";

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
}

/// Durable implementation of every store contract.
///
/// One process owns a database file at a time; opening it releases the
/// claims of whoever had it before.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        info!("Opened work store at {}", path.display());
        Self::from_connection(conn, clock, config)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>, config: StoreConfig) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, clock, config)
    }

    fn from_connection(
        conn: Connection,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&conn)?;

        let released = conn.execute(
            "UPDATE work_items SET locked_by = NULL WHERE locked_by IS NOT NULL",
            [],
        )?;
        if released > 0 {
            info!("Released {} claim(s) left by a previous process", released);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            config,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        lock_conn(&self.conn)
    }

    /// Insert a queued item outside of any transaction (upload ingestion).
    pub fn insert_item(&self, descriptor: NewWorkItem) -> Result<i64, StoreError> {
        let queued_at = to_nanos(self.clock.now())?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = next_value(&tx, "work_item")?;
        insert_row(&tx, id, &descriptor, queued_at)?;
        tx.commit()?;
        Ok(id)
    }

    /// Skip ahead so the next inserted item gets `next_id`.
    pub fn reserve_ids_until(&self, next_id: i64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO counters (name, value) VALUES ('work_item', ?1)
             ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
            params![next_id - 1],
        )?;
        Ok(())
    }

    pub fn item(&self, id: i64) -> Result<Option<WorkItem>, StoreError> {
        select_item(&*self.conn()?, id)
    }

    pub fn items(&self) -> Result<Vec<WorkItem>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items ORDER BY id"
        ))?;
        let items = stmt
            .query_map([], read_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn is_locked(&self, id: i64) -> Result<bool, StoreError> {
        let locked_by: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT locked_by FROM work_items WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(locked_by.is_some())
    }

    /// 1-based position of a queued item, ordered by the time it became
    /// visible and then by id. `None` for items that are not queued.
    pub fn queued_rank(&self, id: i64) -> Result<Option<usize>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM work_items WHERE state = 'queued'
             ORDER BY MAX(queued_at_ns, COALESCE(process_after_ns, queued_at_ns)), id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.iter().position(|queued| *queued == id).map(|p| p + 1))
    }

    /// Insert or refresh usage counters. A stored `last_enqueued_at` is kept
    /// unless `usage` carries a newer stamp.
    pub fn upsert_repository(&self, usage: RepositoryUsage) -> Result<(), StoreError> {
        let last_enqueued_at = usage.last_enqueued_at.map(to_nanos).transpose()?;
        self.conn()?.execute(
            "INSERT INTO repositories (repository_id, search_count, precise_count, last_enqueued_at_ns)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repository_id) DO UPDATE SET
               search_count = excluded.search_count,
               precise_count = excluded.precise_count,
               last_enqueued_at_ns = COALESCE(excluded.last_enqueued_at_ns, last_enqueued_at_ns)",
            params![
                usage.repository_id,
                to_sql_count(usage.search_count),
                to_sql_count(usage.precise_count),
                last_enqueued_at
            ],
        )?;
        Ok(())
    }

    pub fn repository(&self, repository_id: i64) -> Result<Option<RepositoryUsage>, StoreError> {
        let usage = self
            .conn()?
            .query_row(
                "SELECT repository_id, search_count, precise_count, last_enqueued_at_ns
                 FROM repositories WHERE repository_id = ?1",
                params![repository_id],
                read_usage,
            )
            .optional()?;
        Ok(usage)
    }

    pub fn set_index_configuration(
        &self,
        repository_id: i64,
        configuration: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO index_configurations (repository_id, data) VALUES (?1, ?2)
             ON CONFLICT(repository_id) DO UPDATE SET data = excluded.data",
            params![repository_id, configuration.into()],
        )?;
        Ok(())
    }

    pub fn packages(&self, upload_id: i64) -> Result<Vec<Package>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT scheme, name, version FROM packages WHERE upload_id = ?1 ORDER BY rowid",
        )?;
        let packages = stmt
            .query_map(params![upload_id], read_package)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(packages)
    }

    pub fn references(&self, upload_id: i64) -> Result<Vec<PackageReference>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT scheme, name, version FROM package_references
             WHERE upload_id = ?1 ORDER BY rowid",
        )?;
        let references = stmt
            .query_map(params![upload_id], |row| {
                Ok(PackageReference {
                    package: read_package(row)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(references)
    }

    /// Completed uploads currently visible for the repository.
    pub fn visible_uploads(&self, repository_id: i64) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT upload_id FROM visible_uploads WHERE repository_id = ?1 ORDER BY upload_id",
        )?;
        let ids = stmt
            .query_map(params![repository_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

#[async_trait]
impl QueueStats for SqliteStore {
    async fn queue_size(&self) -> Result<u64, StoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM work_items WHERE state = 'queued'",
            [],
            |row| row.get(0),
        )?;
        Ok(from_sql_count(count))
    }
}

#[async_trait]
impl WorkStore for SqliteStore {
    async fn dequeue(
        &self,
        conditions: &DequeueConditions,
    ) -> Result<Option<(WorkItem, Box<dyn WorkTransaction>)>, StoreError> {
        let now = to_nanos(self.clock.now())?;

        let mut sql = String::from(
            "SELECT id FROM work_items
             WHERE state = 'queued' AND locked_by IS NULL
               AND (process_after_ns IS NULL OR process_after_ns <= ?)",
        );
        let mut values = vec![Value::Integer(now)];
        if !conditions.indexers.is_empty() {
            let placeholders = vec!["?"; conditions.indexers.len()].join(", ");
            sql.push_str(&format!(" AND indexer IN ({placeholders})"));
            values.extend(conditions.indexers.iter().cloned().map(Value::Text));
        }
        sql.push_str(
            " ORDER BY MAX(queued_at_ns, COALESCE(process_after_ns, queued_at_ns)), id LIMIT 1",
        );

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<i64> = tx
            .query_row(&sql, params_from_iter(values), |row| row.get(0))
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let original = select_item(&tx, id)?.ok_or(StoreError::ItemNotFound(id))?;
        let token = next_value(&tx, "claim")?;
        tx.execute(
            "UPDATE work_items SET state = 'processing', started_at_ns = ?2, locked_by = ?3
             WHERE id = ?1",
            params![id, now, token],
        )?;
        let claimed = select_item(&tx, id)?.ok_or(StoreError::ItemNotFound(id))?;
        tx.commit()?;
        drop(conn);

        debug!("Dequeued work item {} under claim {}", id, token);

        let tx = SqliteWorkTransaction {
            conn: self.conn.clone(),
            clock: self.clock.clone(),
            token,
            item_id: id,
            original,
            journal: Journal::default(),
            finished: false,
        };
        Ok(Some((claimed, Box::new(tx))))
    }
}

/// Transaction owning the claim on one dequeued row.
pub struct SqliteWorkTransaction {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    token: i64,
    item_id: i64,
    original: WorkItem,
    journal: Journal,
    finished: bool,
}

impl SqliteWorkTransaction {
    fn ensure_held(&self, id: i64) -> Result<(), StoreError> {
        if id == self.item_id {
            Ok(())
        } else {
            Err(StoreError::NotHeld(id))
        }
    }

    /// Apply `changes` and release the claim in one SQLite transaction.
    fn apply(&self, changes: Vec<Change>) -> Result<(), StoreError> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.ensure_claimed(&tx)?;
        for change in changes {
            apply_change(&tx, change)?;
        }
        tx.execute(
            "UPDATE work_items SET locked_by = NULL WHERE id = ?1",
            params![self.item_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn restore(&self) -> Result<(), StoreError> {
        let started_at = self.original.started_at.map(to_nanos).transpose()?;
        lock_conn(&self.conn)?.execute(
            "UPDATE work_items SET state = ?3, started_at_ns = ?4, locked_by = NULL
             WHERE id = ?1 AND locked_by = ?2",
            params![
                self.item_id,
                self.token,
                self.original.state.as_str(),
                started_at
            ],
        )?;
        Ok(())
    }

    fn ensure_claimed(&self, conn: &Connection) -> Result<(), StoreError> {
        let locked_by: Option<i64> = conn
            .query_row(
                "SELECT locked_by FROM work_items WHERE id = ?1",
                params![self.item_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if locked_by == Some(self.token) {
            Ok(())
        } else {
            Err(StoreError::Aborted(format!(
                "claim on work item {} was lost",
                self.item_id
            )))
        }
    }
}

#[async_trait]
impl Finalize for SqliteWorkTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        let changes = this.journal.take();
        // On failure the claim is released by `Drop`, leaving the row stalled.
        this.apply(changes)?;
        this.finished = true;
        debug!("Committed claim {} for item {}", this.token, this.item_id);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.journal.clear();
        this.restore()?;
        this.finished = true;
        debug!("Rolled back claim {} for item {}", this.token, this.item_id);
        Ok(())
    }
}

impl Drop for SqliteWorkTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(conn) = self.conn.lock() else {
            return;
        };
        if let Err(e) = conn.execute(
            "UPDATE work_items SET locked_by = NULL WHERE id = ?1 AND locked_by = ?2",
            params![self.item_id, self.token],
        ) {
            warn!("Failed to release claim on item {}: {}", self.item_id, e);
        }
    }
}

#[async_trait]
impl WorkTransaction for SqliteWorkTransaction {
    async fn mark_complete(&mut self, id: i64) -> Result<bool, StoreError> {
        self.ensure_held(id)?;
        if self.journal.pending_state() != WorkState::Processing {
            return Ok(false);
        }
        let at = self.clock.now();
        self.journal.push(Change::Complete { id, at });
        Ok(true)
    }

    async fn mark_errored(&mut self, id: i64, message: &str) -> Result<bool, StoreError> {
        self.ensure_held(id)?;
        if self.journal.pending_state() != WorkState::Processing {
            return Ok(false);
        }
        let at = self.clock.now();
        self.journal.push(Change::Errored {
            id,
            message: message.to_string(),
            at,
        });
        Ok(true)
    }

    async fn requeue(&mut self, id: i64, visible_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_held(id)?;
        // Reject unstorable times now rather than at commit.
        to_nanos(visible_at)?;
        self.journal.push(Change::Requeue { id, visible_at });
        Ok(())
    }

    async fn savepoint(&mut self) -> Result<SavepointId, StoreError> {
        Ok(self.journal.savepoint())
    }

    async fn rollback_to_savepoint(&mut self, savepoint: SavepointId) -> Result<(), StoreError> {
        self.journal.rollback_to(savepoint)
    }

    async fn update_packages(
        &mut self,
        upload_id: i64,
        packages: &[Package],
    ) -> Result<(), StoreError> {
        self.journal.push(Change::Packages {
            upload_id,
            packages: packages.to_vec(),
        });
        Ok(())
    }

    async fn update_references(
        &mut self,
        upload_id: i64,
        references: &[PackageReference],
    ) -> Result<(), StoreError> {
        self.journal.push(Change::References {
            upload_id,
            references: references.to_vec(),
        });
        Ok(())
    }

    async fn delete_overlapping(&mut self, item: &WorkItem) -> Result<usize, StoreError> {
        let count = overlapping_ids(&*lock_conn(&self.conn)?, item)?.len();
        self.journal.push(Change::DeleteOverlapping { keep: item.clone() });
        Ok(count)
    }

    async fn recompute_visibility(&mut self, repository_id: i64) -> Result<(), StoreError> {
        self.journal.push(Change::RecomputeVisibility { repository_id });
        Ok(())
    }
}

fn apply_change(conn: &Connection, change: Change) -> Result<(), StoreError> {
    match change {
        Change::Complete { id, at } => {
            conn.execute(
                "UPDATE work_items SET state = 'completed', finished_at_ns = ?2,
                   failure_message = NULL
                 WHERE id = ?1",
                params![id, to_nanos(at)?],
            )?;
        }
        Change::Errored { id, message, at } => {
            conn.execute(
                "UPDATE work_items SET state = 'errored', finished_at_ns = ?2,
                   failure_message = ?3, num_failures = MIN(num_failures + 1, ?4)
                 WHERE id = ?1",
                params![id, to_nanos(at)?, message, i64::from(u32::MAX)],
            )?;
        }
        Change::Requeue { id, visible_at } => {
            conn.execute(
                "UPDATE work_items SET state = 'queued', started_at_ns = NULL,
                   process_after_ns = ?2
                 WHERE id = ?1",
                params![id, to_nanos(visible_at)?],
            )?;
        }
        Change::Packages {
            upload_id,
            packages,
        } => {
            conn.execute("DELETE FROM packages WHERE upload_id = ?1", params![upload_id])?;
            let mut stmt = conn.prepare(
                "INSERT INTO packages (upload_id, scheme, name, version) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for package in &packages {
                stmt.execute(params![
                    upload_id,
                    package.scheme,
                    package.name,
                    package.version
                ])?;
            }
        }
        Change::References {
            upload_id,
            references,
        } => {
            conn.execute(
                "DELETE FROM package_references WHERE upload_id = ?1",
                params![upload_id],
            )?;
            let mut stmt = conn.prepare(
                "INSERT INTO package_references (upload_id, scheme, name, version)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for reference in &references {
                let package = &reference.package;
                stmt.execute(params![
                    upload_id,
                    package.scheme,
                    package.name,
                    package.version
                ])?;
            }
        }
        Change::DeleteOverlapping { keep } => {
            for id in overlapping_ids(conn, &keep)? {
                conn.execute("DELETE FROM work_items WHERE id = ?1", params![id])?;
                conn.execute("DELETE FROM packages WHERE upload_id = ?1", params![id])?;
                conn.execute(
                    "DELETE FROM package_references WHERE upload_id = ?1",
                    params![id],
                )?;
            }
        }
        Change::RecomputeVisibility { repository_id } => {
            recompute_visibility(conn, repository_id)?;
        }
    }
    Ok(())
}

/// Completed, unclaimed items sharing `keep`'s overlap key.
fn overlapping_ids(conn: &Connection, keep: &WorkItem) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM work_items
         WHERE repository_id = ?1 AND commit_sha = ?2 AND root = ?3 AND indexer = ?4
           AND state = 'completed' AND id != ?5 AND locked_by IS NULL",
    )?;
    let ids = stmt
        .query_map(
            params![keep.repository_id, keep.commit, keep.root, keep.indexer, keep.id],
            |row| row.get(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// The newest completed upload per (root, indexer) is the visible one.
fn recompute_visibility(conn: &Connection, repository_id: i64) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, root, indexer, COALESCE(finished_at_ns, queued_at_ns) FROM work_items
         WHERE repository_id = ?1 AND state = 'completed'",
    )?;
    let rows = stmt
        .query_map(params![repository_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut latest: BTreeMap<(String, String), (i64, i64)> = BTreeMap::new();
    for (id, root, indexer, finished) in rows {
        let entry = latest.entry((root, indexer)).or_insert((finished, id));
        if (finished, id) > *entry {
            *entry = (finished, id);
        }
    }

    conn.execute(
        "DELETE FROM visible_uploads WHERE repository_id = ?1",
        params![repository_id],
    )?;
    let mut insert = conn.prepare(
        "INSERT INTO visible_uploads (repository_id, upload_id) VALUES (?1, ?2)",
    )?;
    for (_, id) in latest.values() {
        insert.execute(params![repository_id, id])?;
    }
    Ok(())
}

#[async_trait]
impl SchedulerStore for SqliteStore {
    async fn repositories_with_index_configuration(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT repository_id FROM index_configurations ORDER BY repository_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    async fn indexable_repositories(
        &self,
        query: &IndexableRepositoryQuery,
    ) -> Result<Vec<RepositoryUsage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT repository_id, search_count, precise_count, last_enqueued_at_ns
             FROM repositories",
        )?;
        let mut matching: Vec<RepositoryUsage> = stmt
            .query_map([], read_usage)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|usage| query.matches(usage))
            .collect();
        // Never-enqueued repositories first, then the longest waiting.
        matching.sort_by_key(|usage| (usage.last_enqueued_at, usage.repository_id));
        matching.truncate(query.limit);
        Ok(matching)
    }

    async fn index_configuration(&self, repository_id: i64) -> Result<Option<String>, StoreError> {
        let data = self
            .conn()?
            .query_row(
                "SELECT data FROM index_configurations WHERE repository_id = ?1",
                params![repository_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    async fn is_queued(&self, repository_id: i64, commit: &str) -> Result<bool, StoreError> {
        let exists = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM work_items WHERE repository_id = ?1 AND commit_sha = ?2)",
            params![repository_id, commit],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    async fn transact(&self) -> Result<Box<dyn SchedulerTransaction>, StoreError> {
        Ok(Box::new(SqliteSchedulerTransaction {
            conn: self.conn.clone(),
            clock: self.clock.clone(),
            inserts: Vec::new(),
            enqueued: Vec::new(),
        }))
    }
}

/// Scheduler writes, applied in one SQLite transaction on commit.
pub struct SqliteSchedulerTransaction {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    inserts: Vec<(i64, NewWorkItem)>,
    enqueued: Vec<(i64, DateTime<Utc>)>,
}

#[async_trait]
impl Finalize for SqliteSchedulerTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let queued_at = to_nanos(self.clock.now())?;
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (id, descriptor) in &self.inserts {
            insert_row(&tx, *id, descriptor, queued_at)?;
        }
        for (repository_id, at) in &self.enqueued {
            tx.execute(
                "INSERT INTO repositories (repository_id, search_count, precise_count, last_enqueued_at_ns)
                 VALUES (?1, 0, 0, ?2)
                 ON CONFLICT(repository_id) DO UPDATE SET
                   last_enqueued_at_ns = excluded.last_enqueued_at_ns",
                params![repository_id, to_nanos(*at)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl SchedulerTransaction for SqliteSchedulerTransaction {
    async fn insert_item(&mut self, item: NewWorkItem) -> Result<i64, StoreError> {
        // Ids are consumed even if the transaction rolls back, like a sequence.
        let id = next_value(&*lock_conn(&self.conn)?, "work_item")?;
        self.inserts.push((id, item));
        Ok(id)
    }

    async fn mark_repository_enqueued(
        &mut self,
        repository_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        to_nanos(at)?;
        self.enqueued.push((repository_id, at));
        Ok(())
    }
}

#[async_trait]
impl ResetStore for SqliteStore {
    async fn reset_stalled(
        &self,
        stalled_before: DateTime<Utc>,
    ) -> Result<ResetOutcome, StoreError> {
        let now = to_nanos(self.clock.now())?;
        let cutoff = to_nanos(stalled_before)?;
        let max_num_resets = i64::from(self.config.max_num_resets);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stalled = {
            let mut stmt = tx.prepare(
                "SELECT id, num_resets FROM work_items
                 WHERE state = 'processing' AND locked_by IS NULL AND started_at_ns < ?1
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut outcome = ResetOutcome::default();
        for (id, num_resets) in stalled {
            if num_resets >= max_num_resets {
                tx.execute(
                    "UPDATE work_items SET state = 'errored', finished_at_ns = ?2,
                       failure_message = ?3, num_failures = MIN(num_failures + 1, ?4)
                     WHERE id = ?1",
                    params![
                        id,
                        now,
                        format!("failed to process after {num_resets} resets"),
                        i64::from(u32::MAX)
                    ],
                )?;
                outcome.errored_ids.push(id);
            } else {
                tx.execute(
                    "UPDATE work_items SET state = 'queued', started_at_ns = NULL,
                       num_resets = num_resets + 1
                     WHERE id = ?1",
                    params![id],
                )?;
                outcome.reset_ids.push(id);
            }
        }
        tx.commit()?;
        Ok(outcome)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ns INTEGER NOT NULL
        );
        "#,
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "work store schema version {} is newer than supported {}",
            current, SCHEMA_VERSION
        )));
    }
    if current < 1 {
        apply_migration_v1(conn)?;
        record_migration(conn, 1, "baseline_queue_tables")?;
    }
    Ok(())
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at_ns)
         VALUES (?1, ?2, ?3)",
        params![version, name, to_nanos(Utc::now())?],
    )?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS counters (
          name TEXT PRIMARY KEY,
          value INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS work_items (
          id INTEGER PRIMARY KEY,
          state TEXT NOT NULL,
          repository_id INTEGER NOT NULL,
          commit_sha TEXT NOT NULL,
          root TEXT NOT NULL,
          indexer TEXT NOT NULL,
          indexer_args TEXT NOT NULL,
          outfile TEXT NOT NULL,
          docker_steps TEXT NOT NULL,
          local_steps TEXT NOT NULL,
          failure_message TEXT NULL,
          num_resets INTEGER NOT NULL DEFAULT 0,
          num_failures INTEGER NOT NULL DEFAULT 0,
          queued_at_ns INTEGER NOT NULL,
          started_at_ns INTEGER NULL,
          finished_at_ns INTEGER NULL,
          process_after_ns INTEGER NULL,
          locked_by INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_work_items_state ON work_items(state, locked_by);
        CREATE INDEX IF NOT EXISTS idx_work_items_commit ON work_items(repository_id, commit_sha);
        CREATE TABLE IF NOT EXISTS repositories (
          repository_id INTEGER PRIMARY KEY,
          search_count INTEGER NOT NULL,
          precise_count INTEGER NOT NULL,
          last_enqueued_at_ns INTEGER NULL
        );
        CREATE TABLE IF NOT EXISTS index_configurations (
          repository_id INTEGER PRIMARY KEY,
          data TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS packages (
          upload_id INTEGER NOT NULL,
          scheme TEXT NOT NULL,
          name TEXT NOT NULL,
          version TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_packages_upload ON packages(upload_id);
        CREATE TABLE IF NOT EXISTS package_references (
          upload_id INTEGER NOT NULL,
          scheme TEXT NOT NULL,
          name TEXT NOT NULL,
          version TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_package_references_upload ON package_references(upload_id);
        CREATE TABLE IF NOT EXISTS visible_uploads (
          repository_id INTEGER NOT NULL,
          upload_id INTEGER NOT NULL,
          PRIMARY KEY (repository_id, upload_id)
        );
        "#,
    )?;
    Ok(())
}

/// Bump the named counter and return its new value.
fn next_value(conn: &Connection, name: &str) -> Result<i64, StoreError> {
    let value = conn.query_row(
        "INSERT INTO counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1
         RETURNING value",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value)
}

fn insert_row(
    conn: &Connection,
    id: i64,
    item: &NewWorkItem,
    queued_at: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO work_items (id, state, repository_id, commit_sha, root, indexer,
           indexer_args, outfile, docker_steps, local_steps, queued_at_ns)
         VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            item.repository_id,
            item.commit,
            item.root,
            item.indexer,
            serde_json::to_string(&item.indexer_args)?,
            item.outfile,
            serde_json::to_string(&item.docker_steps)?,
            serde_json::to_string(&item.local_steps)?,
            queued_at
        ],
    )?;
    Ok(())
}

fn select_item(conn: &Connection, id: i64) -> Result<Option<WorkItem>, StoreError> {
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
            params![id],
            read_item,
        )
        .optional()?;
    Ok(item)
}

fn read_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let state: String = row.get(1)?;
    let state = WorkState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown work state '{state}'").into(),
        )
    })?;

    Ok(WorkItem {
        id: row.get(0)?,
        state,
        repository_id: row.get(2)?,
        commit: row.get(3)?,
        root: row.get(4)?,
        indexer: row.get(5)?,
        indexer_args: json_column(row, 6)?,
        outfile: row.get(7)?,
        docker_steps: json_column(row, 8)?,
        local_steps: json_column(row, 9)?,
        failure_message: row.get(10)?,
        num_resets: u32::try_from(row.get::<_, i64>(11)?).unwrap_or(u32::MAX),
        num_failures: u32::try_from(row.get::<_, i64>(12)?).unwrap_or(u32::MAX),
        queued_at: from_nanos(row.get(13)?),
        started_at: row.get::<_, Option<i64>>(14)?.map(from_nanos),
        finished_at: row.get::<_, Option<i64>>(15)?.map(from_nanos),
        process_after: row.get::<_, Option<i64>>(16)?.map(from_nanos),
    })
}

fn read_usage(row: &Row<'_>) -> rusqlite::Result<RepositoryUsage> {
    Ok(RepositoryUsage {
        repository_id: row.get(0)?,
        search_count: from_sql_count(row.get(1)?),
        precise_count: from_sql_count(row.get(2)?),
        last_enqueued_at: row.get::<_, Option<i64>>(3)?.map(from_nanos),
    })
}

fn read_package(row: &Row<'_>) -> rusqlite::Result<Package> {
    Ok(Package {
        scheme: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_nanos(at: DateTime<Utc>) -> Result<i64, StoreError> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| StoreError::TimeOutOfRange(format!("{at} cannot be stored")))
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

fn to_sql_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn from_sql_count(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}
