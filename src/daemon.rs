//! Wiring for the long-running services hosted by the binary.

use anyhow::{Context, Result};
use codeintel_queue::{
    Clock, Gitserver, LeaseManager, QueueMetrics, QueueMetricsSnapshot, Resetter, Scheduler,
    SqliteStore,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;

/// Lease manager, scheduler and resetter sharing one SQLite store.
pub struct Daemon {
    store: SqliteStore,
    lease_manager: Arc<LeaseManager>,
    scheduler: Option<Arc<Scheduler>>,
    resetter: Option<Arc<Resetter>>,
    metrics: Arc<QueueMetrics>,
}

impl Daemon {
    /// Build the services from `config` and seed the configured repositories.
    pub fn new(
        config: &DaemonConfig,
        clock: Arc<dyn Clock>,
        gitserver: Arc<dyn Gitserver>,
    ) -> Result<Self> {
        let metrics = Arc::new(QueueMetrics::default());
        let store = SqliteStore::open(&config.store.path, clock.clone(), config.store_config())
            .with_context(|| format!("Failed to open store at {:?}", config.store.path))?;

        for seed in &config.repositories {
            store
                .upsert_repository(seed.usage())
                .with_context(|| format!("Failed to seed repository {}", seed.id))?;
            if let Some(raw) = &seed.index_configuration {
                store.set_index_configuration(seed.id, raw.clone())?;
            }
        }
        if !config.repositories.is_empty() {
            info!("Seeded {} repositories", config.repositories.len());
        }

        let lease_manager = Arc::new(LeaseManager::new(
            Arc::new(store.clone()),
            clock.clone(),
            config.lease_manager_config(),
            metrics.clone(),
        ));

        let scheduler = config.scheduler.enabled.then(|| {
            Arc::new(Scheduler::new(
                Arc::new(store.clone()),
                gitserver,
                clock.clone(),
                config.scheduler_config(),
                config.index_job_defaults(),
                metrics.clone(),
            ))
        });

        let resetter = config.resetter.enabled.then(|| {
            Arc::new(Resetter::new(
                Arc::new(store.clone()),
                clock,
                config.resetter_config(),
                metrics.clone(),
            ))
        });

        Ok(Self {
            store,
            lease_manager,
            scheduler,
            resetter,
            metrics,
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.lease_manager
    }

    /// Run every service until `signal` resolves, then stop them and return
    /// the final counters.
    pub async fn run<F>(self, signal: F) -> Result<QueueMetricsSnapshot>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let lease_task = {
            let manager = self.lease_manager.clone();
            tokio::spawn(async move { manager.run().await })
        };

        let mut loops: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        if let Some(scheduler) = self.scheduler.clone() {
            let rx = shutdown_rx.clone();
            loops.push((
                "scheduler",
                tokio::spawn(async move { scheduler.run(rx).await }),
            ));
        }
        if let Some(resetter) = self.resetter.clone() {
            let rx = shutdown_rx.clone();
            loops.push(("resetter", tokio::spawn(async move { resetter.run(rx).await })));
        }

        signal.await;
        info!("Shutdown requested");

        shutdown_tx.send_replace(true);
        let stop_result = self.lease_manager.stop().await;

        for (name, handle) in loops {
            if let Err(e) = handle.await {
                error!("The {} task panicked: {}", name, e);
            }
        }

        match lease_task.await {
            Ok(Err(e)) => warn!("Lease manager stopped with errors: {}", e),
            Err(e) => error!("The lease manager task panicked: {}", e),
            Ok(Ok(())) => {}
        }

        stop_result.context("Failed to roll back open leases")?;
        Ok(self.metrics.snapshot())
    }
}
