//! In-process worker: checks leases out of the [`LeaseManager`], processes
//! them with up to `num_handlers` concurrent handlers and finalizes each
//! lease according to the processing outcome.
//!
//! The worker's leases live in the same table as remote agents' leases, so
//! they count against `maximum_transactions` and are reclaimed the same way.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::lease_manager::{CheckedOutLease, LeaseHandler, LeaseManager};
use crate::metrics::QueueMetrics;
use crate::models::WorkItem;
use crate::processor::{ProcessError, ProcessOutcome, Processor};
use crate::store::WorkTransaction;

pub struct Worker {
    lease_manager: Arc<LeaseManager>,
    processor: Arc<Processor>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    metrics: Arc<QueueMetrics>,
    handlers: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        lease_manager: Arc<LeaseManager>,
        processor: Arc<Processor>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            handlers: Arc::new(Semaphore::new(config.num_handlers)),
            metrics: lease_manager.metrics().clone(),
            lease_manager,
            processor,
            clock,
            config,
        }
    }

    /// Poll until `shutdown` flips, then wait for in-flight handlers.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Worker {} started with {} handler(s)",
            self.config.agent, self.config.num_handlers
        );
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            // Keeps the cleanup sweep off this worker's leases while every
            // handler is busy.
            self.lease_manager.touch(&self.config.agent).await;

            let permit = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                permit = self.handlers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.clock.sleep(self.config.poll_interval) => continue,
            };

            in_flight.retain(|handle| !handle.is_finished());

            match self.lease_manager.checkout(&self.config.agent).await {
                Ok(Some(lease)) => {
                    let worker = self.clone();
                    in_flight.push(tokio::spawn(async move {
                        let id = lease.item().id;
                        match worker.finish(lease).await {
                            Ok(outcome) => debug!("Item {} finished: {:?}", id, outcome),
                            Err(e) => warn!("Processing item {} failed: {}", id, e),
                        }
                        drop(permit);
                    }));
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!("Failed to dequeue work: {}", e);
                    self.idle(&mut shutdown).await;
                }
            }
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight handler(s)", in_flight.len());
        }
        for joined in join_all(in_flight).await {
            if let Err(e) = joined {
                warn!("Worker handler task failed: {}", e);
            }
        }
        info!("Worker stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {}
            _ = self.clock.sleep(self.config.poll_interval) => {}
        }
    }

    /// Check out and handle a single item inline. `None` when nothing is
    /// queued or no transaction slot is free.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>, ProcessError> {
        let Some(lease) = self.lease_manager.checkout(&self.config.agent).await? else {
            return Ok(None);
        };
        self.finish(lease).await.map(Some)
    }

    /// Process a checked-out lease and finalize it.
    ///
    /// Completed and requeued items commit. Errored items record the message
    /// and commit. Infrastructure failures roll the whole transaction back.
    pub async fn finish(&self, lease: CheckedOutLease) -> Result<ProcessOutcome, ProcessError> {
        let result = self.lease_manager.process(lease, self).await;

        let counter = match &result {
            Ok(ProcessOutcome::Completed) => &self.metrics.processed,
            Ok(ProcessOutcome::Requeued) => &self.metrics.process_requeued,
            Ok(ProcessOutcome::Errored(_)) => &self.metrics.process_errored,
            Err(_) => &self.metrics.process_failed,
        };
        QueueMetrics::incr(counter);
        result
    }
}

#[async_trait]
impl LeaseHandler for Worker {
    type Output = ProcessOutcome;
    type Error = ProcessError;

    async fn handle(
        &self,
        item: &WorkItem,
        tx: &mut dyn WorkTransaction,
    ) -> Result<ProcessOutcome, ProcessError> {
        let outcome = self.processor.process(item, tx).await?;
        if let ProcessOutcome::Errored(message) = &outcome {
            warn!("Item {} failed: {}", item.id, message);
            tx.mark_errored(item.id, message).await?;
        }
        Ok(outcome)
    }
}
