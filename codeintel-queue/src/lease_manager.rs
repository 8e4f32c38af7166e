//! Lease manager
//!
//! Hands work items to agents and tracks every item an agent holds:
//! - Bounded issuance: at most `maximum_transactions` store transactions are
//!   open at once. A dequeue never waits for capacity; it returns `None`.
//! - Liveness: heartbeats reconcile the leases an agent reports against the
//!   leases it holds. Unreported leases older than the grace period are
//!   requeued.
//! - Reclamation: a periodic sweep removes agents that stopped heartbeating
//!   and requeues everything they held.
//! - Shutdown: every lease still open when the manager stops is rolled back.
//!
//! Remote agents report back through [`LeaseManager::complete`]. In-process
//! workers check a lease out with [`LeaseManager::checkout`] and process it
//! against the lease's own transaction through a [`LeaseHandler`].
//!
//! Each lease owns its open transaction and its concurrency permit. A lease is
//! always taken out of the table under the lock before its transaction is
//! finalized, so exactly one path (complete, process, heartbeat, cleanup or
//! shutdown) ever finalizes it, and the permit is released when the lease is
//! dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::{checked_after, to_chrono, Clock};
use crate::config::LeaseManagerConfig;
use crate::error::{MultiError, QueueError, Result, StoreError};
use crate::metrics::QueueMetrics;
use crate::models::WorkItem;
use crate::store::{done, WorkStore, WorkTransaction};

/// Slot holding a lease's transaction until one path finalizes it. The
/// mutex is held for as long as the lease is being processed in place.
type SharedTransaction = Arc<Mutex<Option<Box<dyn WorkTransaction>>>>;

/// A dequeued item held by an agent.
struct Lease {
    item: WorkItem,
    tx: SharedTransaction,
    started_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Waits for in-place processing of this lease to finish.
    async fn take_transaction(&self) -> Option<Box<dyn WorkTransaction>> {
        self.tx.lock().await.take()
    }
}

struct AgentRecord {
    last_update: DateTime<Utc>,
    leases: Vec<Lease>,
}

impl AgentRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_update: now,
            leases: Vec::new(),
        }
    }
}

#[derive(Default)]
struct LeaseTable {
    agents: HashMap<String, AgentRecord>,
    /// Set once shutdown has drained the table; nothing is admitted after.
    closed: bool,
}

impl LeaseTable {
    fn lease_count(&self) -> usize {
        self.agents.values().map(|record| record.leases.len()).sum()
    }

    fn remove_lease(&mut self, agent: &str, id: i64) -> Option<Lease> {
        let record = self.agents.get_mut(agent)?;
        let position = record.leases.iter().position(|lease| lease.item.id == id)?;
        Some(record.leases.swap_remove(position))
    }
}

/// Point-in-time view of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub name: String,
    pub last_update: DateTime<Utc>,
    pub lease_ids: Vec<i64>,
}

/// Point-in-time view of the lease manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseManagerStatus {
    pub agents: Vec<AgentStatus>,
    pub available_permits: usize,
    pub closed: bool,
}

impl LeaseManagerStatus {
    pub fn total_leases(&self) -> usize {
        self.agents.iter().map(|agent| agent.lease_ids.len()).sum()
    }
}

/// Processes a checked-out lease against its transaction.
#[async_trait]
pub trait LeaseHandler: Send + Sync {
    type Output: Send;
    type Error: From<QueueError> + std::fmt::Display + Send;

    /// `Ok` commits the lease's transaction, `Err` rolls it back.
    async fn handle(
        &self,
        item: &WorkItem,
        tx: &mut dyn WorkTransaction,
    ) -> std::result::Result<Self::Output, Self::Error>;
}

/// A lease checked out for processing in this process.
///
/// The lease stays in the table, counts against `maximum_transactions` and
/// can still be reclaimed. Reclamation waits until processing returns.
pub struct CheckedOutLease {
    agent: String,
    item: WorkItem,
    tx: OwnedMutexGuard<Option<Box<dyn WorkTransaction>>>,
}

impl CheckedOutLease {
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }
}

pub struct LeaseManager {
    store: Arc<dyn WorkStore>,
    clock: Arc<dyn Clock>,
    config: LeaseManagerConfig,
    metrics: Arc<QueueMetrics>,
    permits: Arc<Semaphore>,
    table: Mutex<LeaseTable>,
    shutdown: watch::Sender<bool>,
    drained: watch::Sender<bool>,
    running: AtomicBool,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn WorkStore>,
        clock: Arc<dyn Clock>,
        config: LeaseManagerConfig,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (drained, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(config.maximum_transactions)),
            store,
            clock,
            config,
            metrics,
            table: Mutex::new(LeaseTable::default()),
            shutdown,
            drained,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LeaseManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn record_leases(&self, table: &LeaseTable) {
        QueueMetrics::set(&self.metrics.outstanding_leases, table.lease_count() as u64);
    }

    async fn refresh_queue_size(&self) {
        match self.store.queue_size().await {
            Ok(size) => QueueMetrics::set(&self.metrics.queued_items, size),
            Err(e) => debug!("Failed to read queue size: {}", e),
        }
    }

    /// Claim the next available item for `agent`.
    ///
    /// Returns `Ok(None)` without waiting when every permit is in use, when
    /// the store has nothing to hand out, or once shutdown has begun.
    pub async fn dequeue(&self, agent: &str) -> Result<Option<WorkItem>> {
        Ok(self.checkout(agent).await?.map(|lease| lease.item))
    }

    /// Like [`LeaseManager::dequeue`], but keeps the lease's transaction
    /// checked out so the caller can process it with
    /// [`LeaseManager::process`].
    pub async fn checkout(&self, agent: &str) -> Result<Option<CheckedOutLease>> {
        if *self.shutdown.borrow() {
            return Ok(None);
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                QueueMetrics::incr(&self.metrics.dequeue_throttled);
                debug!("No transaction slots free, agent {} gets no work", agent);
                return Ok(None);
            }
        };

        // The permit goes back on every early return below.
        let Some((item, tx)) = self.store.dequeue(&self.config.conditions).await? else {
            self.refresh_queue_size().await;
            return Ok(None);
        };

        let now = self.clock.now();
        let mut table = self.table.lock().await;
        if table.closed {
            drop(table);
            debug!(
                "Rolling back item {} dequeued while shutting down",
                item.id
            );
            tx.rollback().await?;
            return Ok(None);
        }

        let shared: SharedTransaction = Arc::new(Mutex::new(Some(tx)));
        let guard = shared.clone().lock_owned().await;

        let record = table
            .agents
            .entry(agent.to_string())
            .or_insert_with(|| AgentRecord::new(now));
        record.last_update = now;
        record.leases.push(Lease {
            item: item.clone(),
            tx: shared,
            started_at: now,
            _permit: permit,
        });
        self.record_leases(&table);
        drop(table);

        QueueMetrics::incr(&self.metrics.dequeued);
        self.refresh_queue_size().await;
        debug!("Leased item {} to agent {}", item.id, agent);
        Ok(Some(CheckedOutLease {
            agent: agent.to_string(),
            item,
            tx: guard,
        }))
    }

    /// Run `handler` against a checked-out lease, then finalize it: commit
    /// when the handler succeeds, roll back when it fails.
    ///
    /// If the lease was reclaimed while the handler ran, the reclaiming path
    /// finalizes it and this returns a [`StoreError::Aborted`].
    pub async fn process<H>(
        &self,
        lease: CheckedOutLease,
        handler: &H,
    ) -> std::result::Result<H::Output, H::Error>
    where
        H: LeaseHandler + ?Sized,
    {
        let CheckedOutLease {
            agent,
            item,
            tx: mut guard,
        } = lease;

        // Handler writes are unwound to this mark if the lease is reclaimed.
        let mut start = None;
        let result = match &mut *guard {
            Some(tx) => match tx.savepoint().await {
                Ok(savepoint) => {
                    start = Some(savepoint);
                    handler.handle(&item, &mut **tx).await
                }
                Err(e) => Err(QueueError::from(e).into()),
            },
            None => Err(aborted(item.id).into()),
        };

        let owned = {
            let mut table = self.table.lock().await;
            let owned = table.remove_lease(&agent, item.id);
            self.record_leases(&table);
            owned
        };
        // Keep the lease (and its permit) until the transaction is finalized.
        let Some(_lease) = owned else {
            if let (Some(tx), Some(savepoint)) = (guard.as_mut(), start) {
                if let Err(e) = tx.rollback_to_savepoint(savepoint).await {
                    warn!("Failed to unwind item {}: {}", item.id, e);
                }
            }
            drop(guard);
            warn!("Lease on item {} was reclaimed while processing", item.id);
            return Err(aborted(item.id).into());
        };
        let Some(tx) = guard.take() else {
            return Err(aborted(item.id).into());
        };
        drop(guard);

        let finalized = match &result {
            Ok(_) => tx.commit().await,
            Err(e) => {
                debug!("Rolling back item {}: {}", item.id, e);
                tx.rollback().await
            }
        };
        self.refresh_queue_size().await;

        match (result, finalized) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(e)) => Err(QueueError::from(e).into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(rollback_err)) => {
                warn!("Failed to roll back item {}: {}", item.id, rollback_err);
                Err(e)
            }
        }
    }

    /// [`LeaseManager::checkout`] followed by [`LeaseManager::process`].
    pub async fn process_next<H>(
        &self,
        agent: &str,
        handler: &H,
    ) -> std::result::Result<Option<H::Output>, H::Error>
    where
        H: LeaseHandler + ?Sized,
    {
        let Some(lease) = self.checkout(agent).await? else {
            return Ok(None);
        };
        self.process(lease, handler).await.map(Some)
    }

    /// Mark `agent` as alive without reconciling its leases.
    pub async fn touch(&self, agent: &str) {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        if table.closed {
            return;
        }
        table
            .agents
            .entry(agent.to_string())
            .or_insert_with(|| AgentRecord::new(now))
            .last_update = now;
    }

    /// Finish the lease for `id` held by `agent`.
    ///
    /// An empty `error_message` marks the item completed, anything else marks
    /// it errored. Returns `false` when the agent holds no such lease, which
    /// also covers leases that were already reclaimed.
    pub async fn complete(&self, agent: &str, id: i64, error_message: &str) -> Result<bool> {
        let lease = {
            let mut table = self.table.lock().await;
            let Some(lease) = table.remove_lease(agent, id) else {
                return Ok(false);
            };
            self.record_leases(&table);
            lease
        };

        let Some(mut tx) = lease.take_transaction().await else {
            return Ok(false);
        };
        let outcome = if error_message.is_empty() {
            tx.mark_complete(id).await.map(|_| ())
        } else {
            tx.mark_errored(id, error_message).await.map(|_| ())
        };
        let finalized = done(tx, outcome).await;
        drop(lease);
        self.refresh_queue_size().await;
        finalized?;

        QueueMetrics::incr(&self.metrics.completed);
        if !error_message.is_empty() {
            QueueMetrics::incr(&self.metrics.completed_with_error);
        }

        debug!("Agent {} completed item {}", agent, id);
        Ok(true)
    }

    /// Reconcile the leases held by `agent` with the ids it reports as live.
    ///
    /// Leases that are not reported and are older than the unreported grace
    /// period are requeued. Every requeue is attempted; failures are returned
    /// together.
    pub async fn heartbeat(&self, agent: &str, live_ids: &[i64]) -> Result<()> {
        let now = self.clock.now();
        let grace = to_chrono(self.config.unreported_max_age);
        let visible_at = checked_after(now, self.config.requeue_delay)?;

        let dead = {
            let mut table = self.table.lock().await;
            if table.closed {
                return Ok(());
            }
            let record = table
                .agents
                .entry(agent.to_string())
                .or_insert_with(|| AgentRecord::new(now));
            record.last_update = now;

            let (live, dead): (Vec<Lease>, Vec<Lease>) = std::mem::take(&mut record.leases)
                .into_iter()
                .partition(|lease| {
                    live_ids.contains(&lease.item.id) || now - lease.started_at < grace
                });
            record.leases = live;
            self.record_leases(&table);
            dead
        };

        if dead.is_empty() {
            return Ok(());
        }

        info!(
            "Agent {} no longer reports {} lease(s), requeueing",
            agent,
            dead.len()
        );
        QueueMetrics::add(&self.metrics.heartbeat_reclaimed, dead.len() as u64);
        self.requeue_leases(dead, visible_at).await
    }

    /// One reclamation sweep: drop agents silent for longer than the death
    /// threshold and requeue their leases.
    pub async fn cleanup(&self) -> Result<()> {
        let now = self.clock.now();
        let threshold = to_chrono(self.config.death_threshold);
        let visible_at = checked_after(now, self.config.requeue_delay)?;

        let dead_agents: Vec<(String, AgentRecord)> = {
            let mut table = self.table.lock().await;
            let names: Vec<String> = table
                .agents
                .iter()
                .filter(|(_, record)| now - record.last_update > threshold)
                .map(|(name, _)| name.clone())
                .collect();
            let removed = names
                .into_iter()
                .filter_map(|name| table.agents.remove(&name).map(|record| (name, record)))
                .collect();
            self.record_leases(&table);
            removed
        };

        if dead_agents.is_empty() {
            return Ok(());
        }

        let mut leases = Vec::new();
        for (name, record) in dead_agents {
            info!(
                "Agent {} last seen at {}, reclaiming {} lease(s)",
                name,
                record.last_update,
                record.leases.len()
            );
            QueueMetrics::incr(&self.metrics.agents_pruned);
            leases.extend(record.leases);
        }

        QueueMetrics::add(&self.metrics.cleanup_reclaimed, leases.len() as u64);
        self.requeue_leases(leases, visible_at).await
    }

    async fn requeue_leases(&self, leases: Vec<Lease>, visible_at: DateTime<Utc>) -> Result<()> {
        let mut errors = MultiError::new();

        for lease in leases {
            let Some(mut tx) = lease.take_transaction().await else {
                continue;
            };
            let id = lease.item.id;
            let outcome = tx.requeue(id, visible_at).await;
            if let Err(err) = done(tx, outcome).await {
                warn!("Failed to requeue item {}: {}", id, err);
                QueueMetrics::incr(&self.metrics.reclaim_errors);
                errors.push(err);
            }
        }

        self.refresh_queue_size().await;
        errors.into_result()?;
        Ok(())
    }

    /// Run the cleanup loop until [`LeaseManager::stop`] is called, then roll
    /// back every lease that is still open.
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Lease manager started (max transactions: {}, cleanup every {:?})",
            self.config.maximum_transactions, self.config.cleanup_interval
        );

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = self.clock.sleep(self.config.cleanup_interval) => {
                    if let Err(e) = self.cleanup().await {
                        error!("Lease cleanup failed: {}", e);
                    }
                }
            }
        }

        let result = self.drain().await;
        self.drained.send_replace(true);
        info!("Lease manager stopped");
        result
    }

    /// Signal shutdown and wait until every open lease has been rolled back.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);

        if self.running.load(Ordering::SeqCst) {
            let mut drained = self.drained.subscribe();
            // The sender lives in `self`, so this only ends once drained.
            if drained.wait_for(|drained| *drained).await.is_err() {
                warn!("Lease manager dropped before draining");
            }
            Ok(())
        } else {
            self.drain().await
        }
    }

    async fn drain(&self) -> Result<()> {
        let leases: Vec<Lease> = {
            let mut table = self.table.lock().await;
            table.closed = true;
            let leases = table
                .agents
                .drain()
                .flat_map(|(_, record)| record.leases)
                .collect();
            self.record_leases(&table);
            leases
        };

        if !leases.is_empty() {
            info!("Rolling back {} open lease(s)", leases.len());
        }

        let mut errors = MultiError::new();
        for lease in leases {
            let Some(tx) = lease.take_transaction().await else {
                continue;
            };
            QueueMetrics::incr(&self.metrics.shutdown_rolled_back);
            if let Err(err) = tx.rollback().await {
                warn!("Failed to roll back item {}: {}", lease.item.id, err);
                errors.push(err);
            }
        }

        self.refresh_queue_size().await;
        errors.into_result()?;
        Ok(())
    }

    pub async fn status(&self) -> LeaseManagerStatus {
        let table = self.table.lock().await;
        let mut agents: Vec<AgentStatus> = table
            .agents
            .iter()
            .map(|(name, record)| AgentStatus {
                name: name.clone(),
                last_update: record.last_update,
                lease_ids: record.leases.iter().map(|lease| lease.item.id).collect(),
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));

        LeaseManagerStatus {
            agents,
            available_permits: self.permits.available_permits(),
            closed: table.closed,
        }
    }
}

fn aborted(id: i64) -> QueueError {
    QueueError::Store(StoreError::Aborted(format!(
        "lease on item {id} was reclaimed"
    )))
}
