//! Embedded in-memory work store.
//!
//! Emulates the row-locking behaviour of the relational store: a dequeue
//! claims the row (`processing`, `started_at = now`) and holds a lock on it
//! until the owning transaction is committed or rolled back. Changes made
//! through a transaction are journaled and only become visible on commit;
//! savepoints truncate the journal.
//!
//! Dropping an unfinished transaction releases the row lock but leaves the row
//! `processing`, which is exactly what a crashed worker looks like from the
//! outside. The resetter reclaims such rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::journal::{Change, Journal};
use super::{
    DequeueConditions, Finalize, IndexableRepositoryQuery, QueueStats, ResetOutcome, ResetStore,
    SavepointId, SchedulerStore, SchedulerTransaction, StoreConfig, WorkStore, WorkTransaction,
};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::models::{NewWorkItem, Package, PackageReference, RepositoryUsage, WorkItem, WorkState};

#[derive(Debug)]
struct Row {
    item: WorkItem,
    locked_by: Option<u64>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_item_id: i64,
    next_tx_id: u64,
    rows: BTreeMap<i64, Row>,
    repositories: BTreeMap<i64, RepositoryUsage>,
    configurations: BTreeMap<i64, String>,
    packages: HashMap<i64, Vec<Package>>,
    references: HashMap<i64, Vec<PackageReference>>,
    visible: HashMap<i64, Vec<i64>>,
}

impl StoreState {
    fn allocate_item_id(&mut self) -> i64 {
        self.next_item_id += 1;
        self.next_item_id
    }

    fn allocate_tx_id(&mut self) -> u64 {
        self.next_tx_id += 1;
        self.next_tx_id
    }

    fn insert(&mut self, id: i64, descriptor: NewWorkItem, now: DateTime<Utc>) {
        self.rows.insert(
            id,
            Row {
                item: WorkItem::queued(id, descriptor, now),
                locked_by: None,
            },
        );
    }
}

fn lock_state(state: &Mutex<StoreState>) -> Result<MutexGuard<'_, StoreState>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Unavailable("store state lock poisoned".to_string()))
}

/// In-process implementation of every store contract.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, StoreConfig::default())
    }

    pub fn with_config(clock: Arc<dyn Clock>, config: StoreConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
            config,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        lock_state(&self.state)
    }

    /// Insert a queued item outside of any transaction (upload ingestion).
    pub fn insert_item(&self, descriptor: NewWorkItem) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let id = state.allocate_item_id();
        state.insert(id, descriptor, now);
        Ok(id)
    }

    /// Skip ahead so the next inserted item gets `next_id`.
    pub fn reserve_ids_until(&self, next_id: i64) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.next_item_id < next_id - 1 {
            state.next_item_id = next_id - 1;
        }
        Ok(())
    }

    pub fn item(&self, id: i64) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.state()?.rows.get(&id).map(|row| row.item.clone()))
    }

    pub fn items(&self) -> Result<Vec<WorkItem>, StoreError> {
        Ok(self.state()?.rows.values().map(|row| row.item.clone()).collect())
    }

    pub fn is_locked(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self
            .state()?
            .rows
            .get(&id)
            .is_some_and(|row| row.locked_by.is_some()))
    }

    /// 1-based position of a queued item, ordered by the time it became
    /// visible and then by id. `None` for items that are not queued.
    pub fn queued_rank(&self, id: i64) -> Result<Option<usize>, StoreError> {
        let state = self.state()?;
        let mut queued: Vec<&WorkItem> = state
            .rows
            .values()
            .map(|row| &row.item)
            .filter(|item| item.state == WorkState::Queued)
            .collect();
        queued.sort_by_key(|item| (item.visible_from(), item.id));
        Ok(queued.iter().position(|item| item.id == id).map(|p| p + 1))
    }

    pub fn upsert_repository(&self, usage: RepositoryUsage) -> Result<(), StoreError> {
        self.state()?.repositories.insert(usage.repository_id, usage);
        Ok(())
    }

    pub fn repository(&self, repository_id: i64) -> Result<Option<RepositoryUsage>, StoreError> {
        Ok(self.state()?.repositories.get(&repository_id).cloned())
    }

    pub fn set_index_configuration(
        &self,
        repository_id: i64,
        configuration: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.state()?
            .configurations
            .insert(repository_id, configuration.into());
        Ok(())
    }

    pub fn packages(&self, upload_id: i64) -> Result<Vec<Package>, StoreError> {
        Ok(self
            .state()?
            .packages
            .get(&upload_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn references(&self, upload_id: i64) -> Result<Vec<PackageReference>, StoreError> {
        Ok(self
            .state()?
            .references
            .get(&upload_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Completed uploads currently visible for the repository.
    pub fn visible_uploads(&self, repository_id: i64) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .state()?
            .visible
            .get(&repository_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl QueueStats for MemoryStore {
    async fn queue_size(&self) -> Result<u64, StoreError> {
        let state = self.state()?;
        let queued = state
            .rows
            .values()
            .filter(|row| row.item.state == WorkState::Queued)
            .count();
        Ok(queued as u64)
    }
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn dequeue(
        &self,
        conditions: &DequeueConditions,
    ) -> Result<Option<(WorkItem, Box<dyn WorkTransaction>)>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state()?;

        let candidate = state
            .rows
            .values()
            .filter(|row| row.locked_by.is_none() && row.item.state == WorkState::Queued)
            .filter(|row| row.item.process_after.map_or(true, |after| after <= now))
            .filter(|row| conditions.accepts(&row.item))
            .min_by_key(|row| (row.item.visible_from(), row.item.id))
            .map(|row| row.item.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let tx_id = state.allocate_tx_id();
        let row = state.rows.get_mut(&id).ok_or(StoreError::ItemNotFound(id))?;
        let original = row.item.clone();
        row.item.state = WorkState::Processing;
        row.item.started_at = Some(now);
        row.locked_by = Some(tx_id);
        let claimed = row.item.clone();

        debug!("Dequeued work item {} under transaction {}", id, tx_id);

        let tx = MemoryWorkTransaction {
            state: self.state.clone(),
            clock: self.clock.clone(),
            tx_id,
            item_id: id,
            original,
            journal: Journal::default(),
            finished: false,
        };
        Ok(Some((claimed, Box::new(tx))))
    }
}

/// Transaction owning the lock on one dequeued row.
pub struct MemoryWorkTransaction {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    tx_id: u64,
    item_id: i64,
    original: WorkItem,
    journal: Journal,
    finished: bool,
}

impl MemoryWorkTransaction {
    fn ensure_held(&self, id: i64) -> Result<(), StoreError> {
        if id == self.item_id {
            Ok(())
        } else {
            Err(StoreError::NotHeld(id))
        }
    }

    fn apply(state: &mut StoreState, change: Change) {
        match change {
            Change::Complete { id, at } => {
                if let Some(row) = state.rows.get_mut(&id) {
                    row.item.state = WorkState::Completed;
                    row.item.finished_at = Some(at);
                    row.item.failure_message = None;
                }
            }
            Change::Errored { id, message, at } => {
                if let Some(row) = state.rows.get_mut(&id) {
                    row.item.state = WorkState::Errored;
                    row.item.finished_at = Some(at);
                    row.item.failure_message = Some(message);
                    row.item.num_failures = row.item.num_failures.saturating_add(1);
                }
            }
            Change::Requeue { id, visible_at } => {
                if let Some(row) = state.rows.get_mut(&id) {
                    row.item.state = WorkState::Queued;
                    row.item.started_at = None;
                    row.item.process_after = Some(visible_at);
                }
            }
            Change::Packages {
                upload_id,
                packages,
            } => {
                state.packages.insert(upload_id, packages);
            }
            Change::References {
                upload_id,
                references,
            } => {
                state.references.insert(upload_id, references);
            }
            Change::DeleteOverlapping { keep } => {
                let doomed: Vec<i64> = state
                    .rows
                    .values()
                    .filter(|row| overlaps(&row.item, &keep) && row.locked_by.is_none())
                    .map(|row| row.item.id)
                    .collect();
                for id in doomed {
                    state.rows.remove(&id);
                    state.packages.remove(&id);
                    state.references.remove(&id);
                }
            }
            Change::RecomputeVisibility { repository_id } => {
                let mut latest: BTreeMap<(String, String), (DateTime<Utc>, i64)> =
                    BTreeMap::new();
                for row in state.rows.values() {
                    let item = &row.item;
                    if item.repository_id != repository_id || item.state != WorkState::Completed
                    {
                        continue;
                    }
                    let finished = item.finished_at.unwrap_or(item.queued_at);
                    let key = (item.root.clone(), item.indexer.clone());
                    let replace = latest
                        .get(&key)
                        .map_or(true, |(at, id)| (finished, item.id) > (*at, *id));
                    if replace {
                        latest.insert(key, (finished, item.id));
                    }
                }
                let mut ids: Vec<i64> = latest.values().map(|(_, id)| *id).collect();
                ids.sort_unstable();
                state.visible.insert(repository_id, ids);
            }
        }
    }
}

fn overlaps(candidate: &WorkItem, keep: &WorkItem) -> bool {
    candidate.id != keep.id
        && candidate.state == WorkState::Completed
        && candidate.overlap_key() == keep.overlap_key()
}

#[async_trait]
impl Finalize for MemoryWorkTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.finished = true;
        let journal = this.journal.take();
        let mut state = lock_state(&this.state)?;
        for change in journal {
            Self::apply(&mut state, change);
        }
        if let Some(row) = state.rows.get_mut(&this.item_id) {
            if row.locked_by == Some(this.tx_id) {
                row.locked_by = None;
            }
        }
        debug!("Committed transaction {} for item {}", this.tx_id, this.item_id);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.finished = true;
        this.journal.clear();
        let mut state = lock_state(&this.state)?;
        if let Some(row) = state.rows.get_mut(&this.item_id) {
            if row.locked_by == Some(this.tx_id) {
                row.item = this.original.clone();
                row.locked_by = None;
            }
        }
        debug!("Rolled back transaction {} for item {}", this.tx_id, this.item_id);
        Ok(())
    }
}

impl Drop for MemoryWorkTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if let Some(row) = state.rows.get_mut(&self.item_id) {
                if row.locked_by == Some(self.tx_id) {
                    row.locked_by = None;
                }
            }
        }
    }
}

#[async_trait]
impl WorkTransaction for MemoryWorkTransaction {
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
        let count = {
            let state = lock_state(&self.state)?;
            state
                .rows
                .values()
                .filter(|row| overlaps(&row.item, item) && row.locked_by.is_none())
                .count()
        };
        self.journal.push(Change::DeleteOverlapping { keep: item.clone() });
        Ok(count)
    }

    async fn recompute_visibility(&mut self, repository_id: i64) -> Result<(), StoreError> {
        self.journal.push(Change::RecomputeVisibility { repository_id });
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn repositories_with_index_configuration(&self) -> Result<Vec<i64>, StoreError> {
        Ok(self.state()?.configurations.keys().copied().collect())
    }

    async fn indexable_repositories(
        &self,
        query: &IndexableRepositoryQuery,
    ) -> Result<Vec<RepositoryUsage>, StoreError> {
        let state = self.state()?;
        let mut matching: Vec<RepositoryUsage> = state
            .repositories
            .values()
            .filter(|usage| query.matches(usage))
            .cloned()
            .collect();
        // Never-enqueued repositories first, then the longest waiting.
        matching.sort_by_key(|usage| (usage.last_enqueued_at, usage.repository_id));
        matching.truncate(query.limit);
        Ok(matching)
    }

    async fn index_configuration(&self, repository_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self.state()?.configurations.get(&repository_id).cloned())
    }

    async fn is_queued(&self, repository_id: i64, commit: &str) -> Result<bool, StoreError> {
        Ok(self
            .state()?
            .rows
            .values()
            .any(|row| row.item.repository_id == repository_id && row.item.commit == commit))
    }

    async fn transact(&self) -> Result<Box<dyn SchedulerTransaction>, StoreError> {
        Ok(Box::new(MemorySchedulerTransaction {
            state: self.state.clone(),
            clock: self.clock.clone(),
            inserts: Vec::new(),
            enqueued: Vec::new(),
        }))
    }
}

/// Transaction used by the scheduler to insert items and stamp repositories
/// atomically. Nothing is visible until commit.
pub struct MemorySchedulerTransaction {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    inserts: Vec<(i64, NewWorkItem)>,
    enqueued: Vec<(i64, DateTime<Utc>)>,
}

#[async_trait]
impl Finalize for MemorySchedulerTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = lock_state(&self.state)?;
        for (id, descriptor) in self.inserts {
            state.insert(id, descriptor, now);
        }
        for (repository_id, at) in self.enqueued {
            state
                .repositories
                .entry(repository_id)
                .or_insert_with(|| RepositoryUsage::new(repository_id, 0, 0))
                .last_enqueued_at = Some(at);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl SchedulerTransaction for MemorySchedulerTransaction {
    async fn insert_item(&mut self, item: NewWorkItem) -> Result<i64, StoreError> {
        // Ids are consumed even if the transaction rolls back, like a sequence.
        let id = lock_state(&self.state)?.allocate_item_id();
        self.inserts.push((id, item));
        Ok(id)
    }

    async fn mark_repository_enqueued(
        &mut self,
        repository_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.enqueued.push((repository_id, at));
        Ok(())
    }
}

#[async_trait]
impl ResetStore for MemoryStore {
    async fn reset_stalled(
        &self,
        stalled_before: DateTime<Utc>,
    ) -> Result<ResetOutcome, StoreError> {
        let now = self.clock.now();
        let max_num_resets = self.config.max_num_resets;
        let mut state = self.state()?;
        let mut outcome = ResetOutcome::default();

        for row in state.rows.values_mut() {
            let item = &mut row.item;
            let stalled = row.locked_by.is_none()
                && item.state == WorkState::Processing
                && item.started_at.is_some_and(|started| started < stalled_before);
            if !stalled {
                continue;
            }

            if item.num_resets >= max_num_resets {
                item.state = WorkState::Errored;
                item.finished_at = Some(now);
                item.failure_message = Some(format!(
                    "failed to process after {} resets",
                    item.num_resets
                ));
                item.num_failures = item.num_failures.saturating_add(1);
                outcome.errored_ids.push(item.id);
            } else {
                item.state = WorkState::Queued;
                item.started_at = None;
                item.num_resets += 1;
                outcome.reset_ids.push(item.id);
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::done;
    use std::time::Duration;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    fn descriptor(repository_id: i64, commit: &str) -> NewWorkItem {
        NewWorkItem {
            repository_id,
            commit: commit.to_string(),
            indexer: "sourcegraph/lsif-go".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dequeue_claims_and_locks_row() {
        let (_, store) = store();
        let id = store.insert_item(descriptor(50, "deadbeef")).unwrap();

        let (item, tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .expect("item should be available");
        assert_eq!(item.id, id);
        assert_eq!(item.state, WorkState::Processing);
        assert!(store.is_locked(id).unwrap());

        // A locked row is not handed out twice.
        assert!(store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .is_none());

        tx.commit().await.unwrap();
        assert!(!store.is_locked(id).unwrap());
    }

    #[tokio::test]
    async fn test_rollback_restores_queued_row() {
        let (_, store) = store();
        let id = store.insert_item(descriptor(50, "deadbeef")).unwrap();

        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(tx.mark_complete(id).await.unwrap());
        tx.rollback().await.unwrap();

        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Queued);
        assert_eq!(item.started_at, None);
        assert!(!store.is_locked(id).unwrap());
    }

    #[tokio::test]
    async fn test_done_commits_or_rolls_back() {
        let (_, store) = store();
        let first = store.insert_item(descriptor(50, "a")).unwrap();
        let second = store.insert_item(descriptor(50, "b")).unwrap();

        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        tx.mark_complete(first).await.unwrap();
        done(tx, Ok(())).await.unwrap();
        assert_eq!(
            store.item(first).unwrap().unwrap().state,
            WorkState::Completed
        );

        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        tx.mark_complete(second).await.unwrap();
        let err = done(tx, Err(StoreError::Aborted("shutting down".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted(_)));
        assert_eq!(
            store.item(second).unwrap().unwrap().state,
            WorkState::Queued
        );
    }

    #[tokio::test]
    async fn test_requeue_hides_item_until_visible() {
        let (clock, store) = store();
        let id = store.insert_item(descriptor(50, "deadbeef")).unwrap();

        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let visible_at = clock.now() + chrono::Duration::seconds(30);
        tx.requeue(id, visible_at).await.unwrap();
        tx.commit().await.unwrap();

        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Queued);
        assert_eq!(item.process_after, Some(visible_at));

        assert!(store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .is_none());

        clock.advance(Duration::from_secs(30));
        let (again, tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, id);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_savepoint_discards_later_changes() {
        let (_, store) = store();
        let id = store.insert_item(descriptor(50, "deadbeef")).unwrap();
        let package = Package {
            scheme: "gomod".to_string(),
            name: "github.com/sourcegraph/sample".to_string(),
            version: "v1.0.0".to_string(),
        };

        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let savepoint = tx.savepoint().await.unwrap();
        tx.update_packages(id, &[package]).await.unwrap();
        tx.mark_complete(id).await.unwrap();
        tx.rollback_to_savepoint(savepoint).await.unwrap();
        assert!(tx.mark_errored(id, "bad upload").await.unwrap());
        tx.commit().await.unwrap();

        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Errored);
        assert_eq!(item.failure_message.as_deref(), Some("bad upload"));
        assert_eq!(item.num_failures, 1);
        assert!(store.packages(id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_savepoint_is_rejected() {
        let (_, store) = store();
        store.insert_item(descriptor(50, "deadbeef")).unwrap();
        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let err = tx.rollback_to_savepoint(SavepointId(42)).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownSavepoint(42)));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_cannot_touch_other_rows() {
        let (_, store) = store();
        store.insert_item(descriptor(50, "deadbeef")).unwrap();
        let other = store.insert_item(descriptor(51, "cafebabe")).unwrap();

        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            tx.mark_complete(other).await,
            Err(StoreError::NotHeld(_))
        ));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_transaction_leaves_stalled_row() {
        let (clock, store) = store();
        let id = store.insert_item(descriptor(50, "deadbeef")).unwrap();

        let (_, tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        drop(tx);

        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Processing);
        assert!(!store.is_locked(id).unwrap());

        clock.advance(Duration::from_secs(120));
        let outcome = store
            .reset_stalled(clock.now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(outcome.reset_ids, vec![id]);
        assert_eq!(store.item(id).unwrap().unwrap().num_resets, 1);
    }

    #[tokio::test]
    async fn test_reset_skips_locked_rows() {
        let (clock, store) = store();
        store.insert_item(descriptor(50, "deadbeef")).unwrap();

        let (_, tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        clock.advance(Duration::from_secs(3600));

        let outcome = store.reset_stalled(clock.now()).await.unwrap();
        assert_eq!(outcome, ResetOutcome::default());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_limit_marks_item_errored() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::with_config(clock.clone(), StoreConfig { max_num_resets: 1 });
        let id = store.insert_item(descriptor(50, "deadbeef")).unwrap();

        for _ in 0..2 {
            let (_, tx) = store
                .dequeue(&DequeueConditions::default())
                .await
                .unwrap()
                .unwrap();
            drop(tx);
            clock.advance(Duration::from_secs(60));
            store.reset_stalled(clock.now()).await.unwrap();
        }

        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Errored);
        assert_eq!(item.num_resets, 1);
        assert!(item.failure_message.unwrap().contains("1 resets"));
    }

    #[tokio::test]
    async fn test_queued_rank_orders_by_visibility() {
        let (clock, store) = store();
        let first = store.insert_item(descriptor(50, "a")).unwrap();
        clock.advance(Duration::from_secs(60));
        let second = store.insert_item(descriptor(50, "b")).unwrap();
        clock.advance(Duration::from_secs(60));
        let third = store.insert_item(descriptor(50, "c")).unwrap();

        // Requeue the oldest item far into the future; it drops to the back.
        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        tx.requeue(first, clock.now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.queued_rank(second).unwrap(), Some(1));
        assert_eq!(store.queued_rank(third).unwrap(), Some(2));
        assert_eq!(store.queued_rank(first).unwrap(), Some(3));

        let (_, tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.queued_rank(second).unwrap(), None);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_overlapping_and_visibility() {
        let (clock, store) = store();
        let old = store.insert_item(descriptor(50, "deadbeef")).unwrap();
        let (_, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        tx.mark_complete(old).await.unwrap();
        tx.commit().await.unwrap();

        clock.advance(Duration::from_secs(5));
        let new = store.insert_item(descriptor(50, "deadbeef")).unwrap();
        let (item, mut tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.id, new);
        assert_eq!(tx.delete_overlapping(&item).await.unwrap(), 1);
        tx.mark_complete(new).await.unwrap();
        tx.recompute_visibility(50).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.item(old).unwrap().is_none());
        assert_eq!(store.visible_uploads(50).unwrap(), vec![new]);
    }

    #[tokio::test]
    async fn test_scheduler_transaction_is_atomic() {
        let (clock, store) = store();

        let mut tx = store.transact().await.unwrap();
        tx.insert_item(descriptor(50, "deadbeef")).await.unwrap();
        tx.mark_repository_enqueued(50, clock.now()).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.items().unwrap().is_empty());
        assert!(store.repository(50).unwrap().is_none());

        let mut tx = store.transact().await.unwrap();
        let id = tx.insert_item(descriptor(50, "deadbeef")).await.unwrap();
        tx.mark_repository_enqueued(50, clock.now()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.item(id).unwrap().unwrap().state, WorkState::Queued);
        assert!(store.is_queued(50, "deadbeef").await.unwrap());
        assert_eq!(
            store.repository(50).unwrap().unwrap().last_enqueued_at,
            Some(clock.now())
        );
    }
}
