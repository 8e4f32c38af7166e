//! Scheduler
//!
//! Decides which repositories get new index jobs. Each tick gathers the
//! repositories with explicit configuration plus those whose usage passes the
//! indexability thresholds, resolves each one's head commit and enqueues jobs
//! for commits that have none yet. Missing and still-cloning repositories are
//! skipped; any other failure ends the tick and the next tick starts over.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::{to_chrono, Clock};
use crate::config::SchedulerConfig;
use crate::error::{QueueError, Result, StoreError};
use crate::gitserver::Gitserver;
use crate::index_configuration::{IndexConfiguration, IndexJobDefaults};
use crate::metrics::QueueMetrics;
use crate::models::NewWorkItem;
use crate::store::{done, IndexableRepositoryQuery, SchedulerStore, SchedulerTransaction};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub candidates: usize,
    pub enqueued_repositories: usize,
    pub inserted_items: usize,
    pub already_queued: usize,
    pub skipped: usize,
}

enum RepositoryOutcome {
    Enqueued(usize),
    AlreadyQueued,
    NoJobs,
}

pub struct Scheduler {
    store: Arc<dyn SchedulerStore>,
    gitserver: Arc<dyn Gitserver>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    defaults: IndexJobDefaults,
    metrics: Arc<QueueMetrics>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        gitserver: Arc<dyn Gitserver>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        defaults: IndexJobDefaults,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            store,
            gitserver,
            clock,
            config,
            defaults,
            metrics,
        }
    }

    /// Tick every `interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started (interval: {:?})", self.config.interval);
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = self.clock.sleep(self.config.interval) => {
                    if let Err(e) = self.tick().await {
                        QueueMetrics::incr(&self.metrics.scheduler_errors);
                        error!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    pub async fn tick(&self) -> Result<TickSummary> {
        let now = self.clock.now();
        let candidates = self.candidates(now).await?;
        let mut summary = TickSummary {
            candidates: candidates.len(),
            ..Default::default()
        };

        for repository_id in candidates {
            match self.enqueue_repository(repository_id, now).await {
                Ok(RepositoryOutcome::Enqueued(count)) => {
                    summary.enqueued_repositories += 1;
                    summary.inserted_items += count;
                }
                Ok(RepositoryOutcome::AlreadyQueued) => summary.already_queued += 1,
                Ok(RepositoryOutcome::NoJobs) => {}
                Err(QueueError::Gitserver(e)) if e.is_transient() => {
                    debug!("Skipping repository {}: {}", repository_id, e);
                    QueueMetrics::incr(&self.metrics.scheduler_skipped);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        QueueMetrics::add(&self.metrics.scheduled, summary.inserted_items as u64);
        if summary.inserted_items > 0 {
            info!(
                "Scheduled {} index job(s) for {} repositories",
                summary.inserted_items, summary.enqueued_repositories
            );
            match self.store.queue_size().await {
                Ok(size) => QueueMetrics::set(&self.metrics.queued_items, size),
                Err(e) => debug!("Failed to read queue size: {}", e),
            }
        }
        Ok(summary)
    }

    /// Configured repositories first, then heuristic matches; deduplicated and
    /// capped at the batch size.
    async fn candidates(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<i64>> {
        let query = IndexableRepositoryQuery {
            limit: self.config.batch_size,
            now,
            minimum_time_since_last_enqueue: to_chrono(
                self.config.minimum_time_since_last_enqueue,
            ),
            minimum_search_count: self.config.minimum_search_count,
            minimum_precise_count: self.config.minimum_precise_count,
            minimum_search_ratio: self.config.minimum_search_ratio,
        };

        let configured = self.store.repositories_with_index_configuration().await?;
        let indexable = self.store.indexable_repositories(&query).await?;

        let mut seen = HashSet::new();
        let candidates = configured
            .into_iter()
            .chain(indexable.into_iter().map(|usage| usage.repository_id))
            .filter(|id| seen.insert(*id))
            .take(self.config.batch_size)
            .collect();
        Ok(candidates)
    }

    async fn enqueue_repository(
        &self,
        repository_id: i64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<RepositoryOutcome> {
        let commit = self.gitserver.head(repository_id).await?;

        if self.store.is_queued(repository_id, &commit).await? {
            debug!(
                "Repository {} already has work for {}",
                repository_id, commit
            );
            return Ok(RepositoryOutcome::AlreadyQueued);
        }

        let descriptors = self.infer_descriptors(repository_id, &commit).await?;
        if descriptors.is_empty() {
            debug!("Repository {} configures no index jobs", repository_id);
            return Ok(RepositoryOutcome::NoJobs);
        }

        let count = descriptors.len();
        let mut tx = self.store.transact().await?;
        let outcome = insert_all(tx.as_mut(), repository_id, descriptors, now).await;
        done(tx, outcome).await?;

        debug!(
            "Enqueued {} job(s) for repository {} at {}",
            count, repository_id, commit
        );
        Ok(RepositoryOutcome::Enqueued(count))
    }

    async fn infer_descriptors(&self, repository_id: i64, commit: &str) -> Result<Vec<NewWorkItem>> {
        let Some(raw) = self.store.index_configuration(repository_id).await? else {
            return Ok(vec![self.defaults.descriptor(repository_id, commit)]);
        };

        match IndexConfiguration::parse(&raw) {
            Ok(configuration) => Ok(configuration.descriptors(repository_id, commit)),
            Err(e) => {
                warn!(
                    "Invalid index configuration for repository {}, using defaults: {}",
                    repository_id, e
                );
                QueueMetrics::incr(&self.metrics.invalid_configurations);
                Ok(vec![self.defaults.descriptor(repository_id, commit)])
            }
        }
    }
}

async fn insert_all(
    tx: &mut dyn SchedulerTransaction,
    repository_id: i64,
    descriptors: Vec<NewWorkItem>,
    now: chrono::DateTime<chrono::Utc>,
) -> std::result::Result<(), StoreError> {
    for descriptor in descriptors {
        tx.insert_item(descriptor).await?;
    }
    tx.mark_repository_enqueued(repository_id, now).await
}
