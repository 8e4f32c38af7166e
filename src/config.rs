//! Daemon configuration.
//!
//! Values are layered with priority environment -> file -> defaults and then
//! mapped onto the per-service configs of `codeintel_queue`.

use anyhow::{anyhow, Context, Result};
use codeintel_queue::{
    DequeueConditions, IndexJobDefaults, LeaseManagerConfig, RepositoryUsage, ResetterConfig,
    SchedulerConfig, StoreConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Name of the environment variable pointing at a config file
pub const CONFIG_ENV: &str = "CODEINTEL_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding one git repository per repository id
    pub repos_dir: PathBuf,

    pub lease_manager: LeaseManagerSection,
    pub scheduler: SchedulerSection,
    pub resetter: ResetterSection,
    pub store: StoreSection,

    /// Repositories seeded into the store at startup
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositorySeed>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseManagerSection {
    pub maximum_transactions: usize,
    pub requeue_delay_secs: u64,
    pub unreported_max_age_secs: u64,
    pub death_threshold_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Indexers handed out to agents (empty = any)
    pub indexers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub minimum_time_since_last_enqueue_secs: u64,
    pub minimum_search_count: u64,
    pub minimum_precise_count: u64,
    pub minimum_search_ratio: f64,
    pub default_indexer: String,
    pub default_indexer_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetterSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub stalled_threshold_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database holding the queue
    pub path: PathBuf,
    pub max_num_resets: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySeed {
    pub id: i64,
    #[serde(default)]
    pub search_count: u64,
    #[serde(default)]
    pub precise_count: u64,
    /// Raw JSON index configuration document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_configuration: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            repos_dir: dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("codeintel")
                .join("repos"),
            lease_manager: LeaseManagerSection::default(),
            scheduler: SchedulerSection::default(),
            resetter: ResetterSection::default(),
            store: StoreSection::default(),
            repositories: Vec::new(),
        }
    }
}

impl Default for LeaseManagerSection {
    fn default() -> Self {
        let defaults = LeaseManagerConfig::default();
        Self {
            maximum_transactions: defaults.maximum_transactions,
            requeue_delay_secs: defaults.requeue_delay.as_secs(),
            unreported_max_age_secs: defaults.unreported_max_age.as_secs(),
            death_threshold_secs: defaults.death_threshold.as_secs(),
            cleanup_interval_secs: defaults.cleanup_interval.as_secs(),
            indexers: Vec::new(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        let job = IndexJobDefaults::default();
        Self {
            enabled: true,
            interval_secs: defaults.interval.as_secs(),
            batch_size: defaults.batch_size,
            minimum_time_since_last_enqueue_secs: defaults
                .minimum_time_since_last_enqueue
                .as_secs(),
            minimum_search_count: defaults.minimum_search_count,
            minimum_precise_count: defaults.minimum_precise_count,
            minimum_search_ratio: defaults.minimum_search_ratio,
            default_indexer: job.indexer,
            default_indexer_args: job.indexer_args,
        }
    }
}

impl Default for ResetterSection {
    fn default() -> Self {
        let defaults = ResetterConfig::default();
        Self {
            enabled: true,
            interval_secs: defaults.interval.as_secs(),
            stalled_threshold_secs: defaults.stalled_threshold.as_secs(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("codeintel")
                .join("queue.db"),
            max_num_resets: StoreConfig::default().max_num_resets,
        }
    }
}

impl DaemonConfig {
    /// Load configuration with priority: env -> file -> defaults.
    ///
    /// An explicit path must exist. Otherwise the first existing file among
    /// `$CODEINTEL_CONFIG`, `<config_dir>/codeintel/worker.toml` and
    /// `./codeintel-worker.toml` is used.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = explicit {
            info!("Loading configuration from {:?}", path);
            config = Self::from_file(path)?;
        } else {
            let config_paths = [
                std::env::var(CONFIG_ENV).ok().map(PathBuf::from),
                dirs::config_dir().map(|d| d.join("codeintel").join("worker.toml")),
                Some(PathBuf::from("codeintel-worker.toml")),
            ];

            for config_path in config_paths.into_iter().flatten() {
                if config_path.exists() {
                    info!("Loading configuration from {:?}", config_path);
                    config = Self::from_file(&config_path)
                        .with_context(|| format!("Failed to load config from {config_path:?}"))?;
                    break;
                }
            }
        }

        let env_config = Self::from_env()?;
        config.merge_with(env_config);

        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Self =
            toml::from_str(&content).context("Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CODEINTEL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("CODEINTEL_REPOS_DIR") {
            config.repos_dir = PathBuf::from(value);
        }

        // Lease manager
        let lease = &mut config.lease_manager;
        if let Some(value) = parse_env("CODEINTEL_MAX_TRANSACTIONS")? {
            lease.maximum_transactions = value;
        }
        if let Some(value) = parse_env("CODEINTEL_REQUEUE_DELAY_SECS")? {
            lease.requeue_delay_secs = value;
        }
        if let Some(value) = parse_env("CODEINTEL_UNREPORTED_MAX_AGE_SECS")? {
            lease.unreported_max_age_secs = value;
        }
        if let Some(value) = parse_env("CODEINTEL_DEATH_THRESHOLD_SECS")? {
            lease.death_threshold_secs = value;
        }
        if let Some(value) = parse_env("CODEINTEL_CLEANUP_INTERVAL_SECS")? {
            lease.cleanup_interval_secs = value;
        }
        if let Ok(value) = std::env::var("CODEINTEL_INDEXERS") {
            lease.indexers = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Scheduler
        let scheduler = &mut config.scheduler;
        if let Ok(value) = std::env::var("CODEINTEL_SCHEDULER_ENABLED") {
            scheduler.enabled = parse_bool_env(&value, "CODEINTEL_SCHEDULER_ENABLED")?;
        }
        if let Some(value) = parse_env("CODEINTEL_SCHEDULER_INTERVAL_SECS")? {
            scheduler.interval_secs = value;
        }
        if let Some(value) = parse_env("CODEINTEL_SCHEDULER_BATCH_SIZE")? {
            scheduler.batch_size = value;
        }
        if let Some(value) = parse_env("CODEINTEL_MINIMUM_TIME_SINCE_LAST_ENQUEUE_SECS")? {
            scheduler.minimum_time_since_last_enqueue_secs = value;
        }
        if let Some(value) = parse_env("CODEINTEL_MINIMUM_SEARCH_COUNT")? {
            scheduler.minimum_search_count = value;
        }
        if let Some(value) = parse_env("CODEINTEL_MINIMUM_PRECISE_COUNT")? {
            scheduler.minimum_precise_count = value;
        }
        if let Some(value) = parse_env("CODEINTEL_MINIMUM_SEARCH_RATIO")? {
            scheduler.minimum_search_ratio = value;
        }
        if let Ok(value) = std::env::var("CODEINTEL_DEFAULT_INDEXER") {
            scheduler.default_indexer = value;
        }

        // Resetter
        let resetter = &mut config.resetter;
        if let Ok(value) = std::env::var("CODEINTEL_RESETTER_ENABLED") {
            resetter.enabled = parse_bool_env(&value, "CODEINTEL_RESETTER_ENABLED")?;
        }
        if let Some(value) = parse_env("CODEINTEL_RESETTER_INTERVAL_SECS")? {
            resetter.interval_secs = value;
        }
        if let Some(value) = parse_env("CODEINTEL_STALLED_THRESHOLD_SECS")? {
            resetter.stalled_threshold_secs = value;
        }

        if let Ok(value) = std::env::var("CODEINTEL_STORE_PATH") {
            config.store.path = PathBuf::from(value);
        }
        if let Some(value) = parse_env("CODEINTEL_MAX_NUM_RESETS")? {
            config.store.max_num_resets = value;
        }

        Ok(config)
    }

    /// Merge configuration with another, giving priority to the other's
    /// non-default values.
    pub fn merge_with(&mut self, other: Self) {
        macro_rules! merge_field {
            ($section:ident, $field:ident) => {
                if other.$section.$field != Self::default().$section.$field {
                    self.$section.$field = other.$section.$field;
                }
            };
        }

        if other.repos_dir != Self::default().repos_dir {
            self.repos_dir = other.repos_dir;
        }

        merge_field!(lease_manager, maximum_transactions);
        merge_field!(lease_manager, requeue_delay_secs);
        merge_field!(lease_manager, unreported_max_age_secs);
        merge_field!(lease_manager, death_threshold_secs);
        merge_field!(lease_manager, cleanup_interval_secs);
        merge_field!(lease_manager, indexers);

        merge_field!(scheduler, enabled);
        merge_field!(scheduler, interval_secs);
        merge_field!(scheduler, batch_size);
        merge_field!(scheduler, minimum_time_since_last_enqueue_secs);
        merge_field!(scheduler, minimum_search_count);
        merge_field!(scheduler, minimum_precise_count);
        merge_field!(scheduler, minimum_search_ratio);
        merge_field!(scheduler, default_indexer);
        merge_field!(scheduler, default_indexer_args);

        merge_field!(resetter, enabled);
        merge_field!(resetter, interval_secs);
        merge_field!(resetter, stalled_threshold_secs);

        merge_field!(store, path);
        merge_field!(store, max_num_resets);

        if !other.repositories.is_empty() {
            self.repositories = other.repositories;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.lease_manager_config()
            .validate()
            .context("Invalid [lease_manager] section")?;
        self.scheduler_config()
            .validate()
            .context("Invalid [scheduler] section")?;
        self.resetter_config()
            .validate()
            .context("Invalid [resetter] section")?;

        if self.scheduler.default_indexer.trim().is_empty() {
            return Err(anyhow!("scheduler.default_indexer must not be empty"));
        }

        if self.store.path.as_os_str().is_empty() {
            return Err(anyhow!("store.path must not be empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for repository in &self.repositories {
            if !seen.insert(repository.id) {
                return Err(anyhow!("Repository {} is listed more than once", repository.id));
            }
        }

        Ok(())
    }

    pub fn lease_manager_config(&self) -> LeaseManagerConfig {
        let section = &self.lease_manager;
        LeaseManagerConfig {
            maximum_transactions: section.maximum_transactions,
            requeue_delay: Duration::from_secs(section.requeue_delay_secs),
            unreported_max_age: Duration::from_secs(section.unreported_max_age_secs),
            death_threshold: Duration::from_secs(section.death_threshold_secs),
            cleanup_interval: Duration::from_secs(section.cleanup_interval_secs),
            conditions: DequeueConditions {
                indexers: section.indexers.clone(),
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let section = &self.scheduler;
        SchedulerConfig {
            interval: Duration::from_secs(section.interval_secs),
            batch_size: section.batch_size,
            minimum_time_since_last_enqueue: Duration::from_secs(
                section.minimum_time_since_last_enqueue_secs,
            ),
            minimum_search_count: section.minimum_search_count,
            minimum_precise_count: section.minimum_precise_count,
            minimum_search_ratio: section.minimum_search_ratio,
        }
    }

    pub fn index_job_defaults(&self) -> IndexJobDefaults {
        IndexJobDefaults {
            indexer: self.scheduler.default_indexer.clone(),
            indexer_args: self.scheduler.default_indexer_args.clone(),
            ..Default::default()
        }
    }

    pub fn resetter_config(&self) -> ResetterConfig {
        ResetterConfig {
            interval: Duration::from_secs(self.resetter.interval_secs),
            stalled_threshold: Duration::from_secs(self.resetter.stalled_threshold_secs),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_num_resets: self.store.max_num_resets,
        }
    }
}

impl RepositorySeed {
    pub fn usage(&self) -> RepositoryUsage {
        RepositoryUsage::new(self.id, self.search_count, self.precise_count)
    }
}

fn parse_env<T>(var_name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {var_name}: {value}")),
        Err(_) => Ok(None),
    }
}

/// Parse boolean value from environment variable
fn parse_bool_env(value: &str, var_name: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "enabled" => Ok(true),
        "false" | "0" | "no" | "off" | "disabled" => Ok(false),
        _ => Err(anyhow!("Invalid boolean value for {}: {} (use true/false, 1/0, yes/no, on/off, enabled/disabled)", var_name, value)),
    }
}
