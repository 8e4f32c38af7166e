use anyhow::{Context, Result};
use clap::Parser;
use codeintel_queue::{LocalGitserver, SystemClock};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use codeintel_worker::cli::{Args, Command};
use codeintel_worker::{Daemon, DaemonConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::load(args.config.as_deref())?;

    match args.command() {
        Command::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    info!("Starting codeintel worker v{}", env!("CARGO_PKG_VERSION"));
    info!("Repositories are read from {}", config.repos_dir.display());
    info!("Queue is stored in {}", config.store.path.display());

    let gitserver = LocalGitserver::new(config.repos_dir.clone());
    let daemon = Daemon::new(&config, Arc::new(SystemClock), Arc::new(gitserver))?;

    let snapshot = daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    info!(
        "Shutdown complete: dequeued={} completed={} reclaimed={} rolled_back={} scheduled={} reset={} queued={}",
        snapshot.dequeued,
        snapshot.completed,
        snapshot.heartbeat_reclaimed + snapshot.cleanup_reclaimed,
        snapshot.shutdown_rolled_back,
        snapshot.scheduled,
        snapshot.reset,
        snapshot.queued_items
    );
    Ok(())
}
