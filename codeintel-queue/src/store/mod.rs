//! Contracts for the transactional work store.
//!
//! A dequeue hands back the claimed [`WorkItem`] together with the open
//! transaction that holds its row lock. The transaction is finalized by
//! consuming it with [`Finalize::commit`] or [`Finalize::rollback`], so a
//! transaction can never be finished twice. [`done`] is the usual way to
//! finalize: commit on success, roll back and surface the error otherwise.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::StoreError;
use crate::models::{NewWorkItem, Package, PackageReference, RepositoryUsage, WorkItem};

mod journal;
pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store-level policy knobs shared by every backend.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of stalled resets after which an item is marked errored.
    pub max_num_resets: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_num_resets: 3 }
    }
}

/// Identifier of a savepoint opened inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SavepointId(pub u64);

/// Extra filters applied when choosing the next item to dequeue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DequeueConditions {
    /// Only hand out items for these indexers (empty = any).
    pub indexers: Vec<String>,
}

impl DequeueConditions {
    pub fn accepts(&self, item: &WorkItem) -> bool {
        self.indexers.is_empty() || self.indexers.iter().any(|i| i == &item.indexer)
    }
}

#[async_trait]
pub trait Finalize: Send {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Commit when `outcome` is `Ok`, otherwise roll back and return the original
/// error. A rollback failure is logged; the original error still wins.
pub async fn done<T>(tx: Box<T>, outcome: Result<(), StoreError>) -> Result<(), StoreError>
where
    T: Finalize + ?Sized,
{
    match outcome {
        Ok(()) => tx.commit().await,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Failed to roll back transaction after '{}': {}", err, rollback_err);
            }
            Err(err)
        }
    }
}

/// Read-only figures used to keep the queue gauges current.
#[async_trait]
pub trait QueueStats: Send + Sync {
    /// Number of items in the `queued` state, visible or not.
    async fn queue_size(&self) -> Result<u64, StoreError>;
}

/// Work-item side of the store.
#[async_trait]
pub trait WorkStore: QueueStats {
    /// Claim the next visible queued item under a new, independent
    /// transaction. `None` when nothing is available.
    async fn dequeue(
        &self,
        conditions: &DequeueConditions,
    ) -> Result<Option<(WorkItem, Box<dyn WorkTransaction>)>, StoreError>;
}

/// Operations performed inside the transaction owned by one dequeued item.
#[async_trait]
pub trait WorkTransaction: Finalize {
    /// Mark the item completed. `false` if the row is not processing.
    async fn mark_complete(&mut self, id: i64) -> Result<bool, StoreError>;

    /// Mark the item errored with a failure message.
    async fn mark_errored(&mut self, id: i64, message: &str) -> Result<bool, StoreError>;

    /// Put the item back in the queue, invisible until `visible_at`.
    async fn requeue(&mut self, id: i64, visible_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn savepoint(&mut self) -> Result<SavepointId, StoreError>;

    /// Discard every change made after `savepoint` while keeping the
    /// transaction (and its row lock) open.
    async fn rollback_to_savepoint(&mut self, savepoint: SavepointId) -> Result<(), StoreError>;

    async fn update_packages(&mut self, upload_id: i64, packages: &[Package])
        -> Result<(), StoreError>;

    async fn update_references(
        &mut self,
        upload_id: i64,
        references: &[PackageReference],
    ) -> Result<(), StoreError>;

    /// Delete completed items for the same (repository, commit, root,
    /// indexer) as `item`, other than `item` itself.
    async fn delete_overlapping(&mut self, item: &WorkItem) -> Result<usize, StoreError>;

    /// Recompute which completed items are visible for the repository.
    async fn recompute_visibility(&mut self, repository_id: i64) -> Result<(), StoreError>;
}

/// Query options for repositories that qualify for indexing by usage alone.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexableRepositoryQuery {
    pub limit: usize,
    pub now: DateTime<Utc>,
    pub minimum_time_since_last_enqueue: chrono::Duration,
    pub minimum_search_count: u64,
    pub minimum_precise_count: u64,
    pub minimum_search_ratio: f64,
}

impl IndexableRepositoryQuery {
    pub fn matches(&self, usage: &RepositoryUsage) -> bool {
        if let Some(last) = usage.last_enqueued_at {
            if self.now - last < self.minimum_time_since_last_enqueue {
                return false;
            }
        }

        if usage.precise_count >= self.minimum_precise_count && self.minimum_precise_count > 0 {
            return true;
        }

        usage.search_count >= self.minimum_search_count
            && usage.search_ratio() >= self.minimum_search_ratio
    }
}

/// Store operations the scheduler needs.
#[async_trait]
pub trait SchedulerStore: QueueStats {
    async fn repositories_with_index_configuration(&self) -> Result<Vec<i64>, StoreError>;

    async fn indexable_repositories(
        &self,
        query: &IndexableRepositoryQuery,
    ) -> Result<Vec<RepositoryUsage>, StoreError>;

    /// Raw configuration document for the repository, if any.
    async fn index_configuration(&self, repository_id: i64) -> Result<Option<String>, StoreError>;

    /// Whether any item already exists for this exact commit.
    async fn is_queued(&self, repository_id: i64, commit: &str) -> Result<bool, StoreError>;

    async fn transact(&self) -> Result<Box<dyn SchedulerTransaction>, StoreError>;
}

#[async_trait]
pub trait SchedulerTransaction: Finalize {
    async fn insert_item(&mut self, item: NewWorkItem) -> Result<i64, StoreError>;

    async fn mark_repository_enqueued(
        &mut self,
        repository_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Outcome of a stalled-item sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Items moved back to `queued`.
    pub reset_ids: Vec<i64>,
    /// Items that hit the reset limit and were marked `errored`.
    pub errored_ids: Vec<i64>,
}

/// Store operation the resetter needs.
#[async_trait]
pub trait ResetStore: QueueStats {
    /// Move every unlocked `processing` item started before `stalled_before`
    /// back to `queued`.
    async fn reset_stalled(&self, stalled_before: DateTime<Utc>)
        -> Result<ResetOutcome, StoreError>;
}
