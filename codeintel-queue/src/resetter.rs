//! Periodic sweep that returns stalled `processing` items to the queue.
//!
//! This is the backstop for work whose holder vanished without the lease
//! manager noticing, e.g. because the lease manager itself restarted. Rows
//! still locked by a live transaction are never touched, so it is safe to run
//! alongside the lease manager.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::{checked_before, Clock};
use crate::config::ResetterConfig;
use crate::error::Result;
use crate::metrics::QueueMetrics;
use crate::store::{ResetOutcome, ResetStore};

pub struct Resetter {
    store: Arc<dyn ResetStore>,
    clock: Arc<dyn Clock>,
    config: ResetterConfig,
    metrics: Arc<QueueMetrics>,
}

impl Resetter {
    pub fn new(
        store: Arc<dyn ResetStore>,
        clock: Arc<dyn Clock>,
        config: ResetterConfig,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            metrics,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Resetter started (interval: {:?}, stalled after {:?})",
            self.config.interval, self.config.stalled_threshold
        );
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = self.clock.sleep(self.config.interval) => {
                    if let Err(e) = self.reset().await {
                        QueueMetrics::incr(&self.metrics.resetter_errors);
                        error!("Failed to reset stalled items: {}", e);
                    }
                }
            }
        }
        info!("Resetter stopped");
    }

    /// One sweep.
    pub async fn reset(&self) -> Result<ResetOutcome> {
        let cutoff = checked_before(self.clock.now(), self.config.stalled_threshold)?;
        let outcome = self.store.reset_stalled(cutoff).await?;

        for id in &outcome.reset_ids {
            debug!("Reset stalled item {}", id);
        }
        for id in &outcome.errored_ids {
            warn!("Item {} stalled too many times, marked errored", id);
        }

        QueueMetrics::add(&self.metrics.reset, outcome.reset_ids.len() as u64);
        QueueMetrics::add(&self.metrics.reset_errored, outcome.errored_ids.len() as u64);
        if !outcome.reset_ids.is_empty() {
            info!("Reset {} stalled item(s)", outcome.reset_ids.len());
        }

        match self.store.queue_size().await {
            Ok(size) => QueueMetrics::set(&self.metrics.queued_items, size),
            Err(e) => debug!("Failed to read queue size: {}", e),
        }
        Ok(outcome)
    }
}
