//! Runtime settings for the queue services.
//!
//! These are plain structs; the daemon maps its file/env layers onto them.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing::warn;

use crate::store::DequeueConditions;

/// Upper bound for every configured duration. Larger values would push
/// timestamps derived from them out of the representable range.
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

fn ensure_bounded(name: &str, value: Duration) -> Result<()> {
    if value > MAX_DURATION {
        return Err(anyhow!(
            "{} must not exceed {}s (got {}s)",
            name,
            MAX_DURATION.as_secs(),
            value.as_secs()
        ));
    }
    Ok(())
}

/// Configuration for the lease manager
#[derive(Debug, Clone)]
pub struct LeaseManagerConfig {
    /// Maximum number of concurrently open store transactions
    pub maximum_transactions: usize,
    /// How long a reclaimed item stays invisible before it can be dequeued again
    pub requeue_delay: Duration,
    /// Grace period for leases an agent has not reported yet
    pub unreported_max_age: Duration,
    /// Silence after which an agent is considered dead
    pub death_threshold: Duration,
    /// Interval between cleanup sweeps
    pub cleanup_interval: Duration,
    /// Filters applied to every dequeue
    pub conditions: DequeueConditions,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            maximum_transactions: 10,
            requeue_delay: Duration::from_secs(60),
            unreported_max_age: Duration::from_secs(30),
            death_threshold: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(10),
            conditions: DequeueConditions::default(),
        }
    }
}

impl LeaseManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.maximum_transactions == 0 {
            return Err(anyhow!("maximum_transactions must be greater than 0"));
        }

        if self.cleanup_interval.is_zero() {
            return Err(anyhow!("cleanup_interval must be greater than 0"));
        }

        if self.death_threshold.is_zero() {
            return Err(anyhow!("death_threshold must be greater than 0"));
        }

        ensure_bounded("requeue_delay", self.requeue_delay)?;
        ensure_bounded("unreported_max_age", self.unreported_max_age)?;
        ensure_bounded("death_threshold", self.death_threshold)?;
        ensure_bounded("cleanup_interval", self.cleanup_interval)?;

        if self.unreported_max_age > self.death_threshold {
            warn!(
                "unreported_max_age ({:?}) exceeds death_threshold ({:?}), unreported leases will only be reclaimed by cleanup",
                self.unreported_max_age, self.death_threshold
            );
        }

        Ok(())
    }
}

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Maximum number of candidate repositories per tick
    pub batch_size: usize,
    pub minimum_time_since_last_enqueue: Duration,
    pub minimum_search_count: u64,
    pub minimum_precise_count: u64,
    pub minimum_search_ratio: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            batch_size: 100,
            minimum_time_since_last_enqueue: Duration::from_secs(24 * 60 * 60),
            minimum_search_count: 50,
            minimum_precise_count: 1,
            minimum_search_ratio: 0.5,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("scheduler interval must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.minimum_search_ratio) {
            return Err(anyhow!("minimum_search_ratio must be between 0.0 and 1.0"));
        }

        ensure_bounded("scheduler interval", self.interval)?;
        ensure_bounded(
            "minimum_time_since_last_enqueue",
            self.minimum_time_since_last_enqueue,
        )?;

        Ok(())
    }
}

/// Configuration for the stalled-item resetter
#[derive(Debug, Clone)]
pub struct ResetterConfig {
    pub interval: Duration,
    /// Items processing for longer than this are considered stalled
    pub stalled_threshold: Duration,
}

impl Default for ResetterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stalled_threshold: Duration::from_secs(5 * 60),
        }
    }
}

impl ResetterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("resetter interval must be greater than 0"));
        }

        if self.stalled_threshold.is_zero() {
            return Err(anyhow!("stalled_threshold must be greater than 0"));
        }

        ensure_bounded("resetter interval", self.interval)?;
        ensure_bounded("stalled_threshold", self.stalled_threshold)?;

        Ok(())
    }
}

/// Configuration for the in-process worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of items processed concurrently
    pub num_handlers: usize,
    /// Delay between polls when the queue is empty
    pub poll_interval: Duration,
    /// Requeue delay used while a repository is still cloning
    pub clone_requeue_delay: Duration,
    /// Agent name the worker's leases are held under
    pub agent: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_handlers: 1,
            poll_interval: Duration::from_secs(1),
            clone_requeue_delay: Duration::from_secs(10),
            agent: "local-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_handlers == 0 {
            return Err(anyhow!("num_handlers must be greater than 0"));
        }

        if self.num_handlers > 64 {
            return Err(anyhow!("num_handlers should not exceed 64"));
        }

        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval must be greater than 0"));
        }

        if self.agent.is_empty() {
            return Err(anyhow!("agent must not be empty"));
        }

        ensure_bounded("poll_interval", self.poll_interval)?;
        ensure_bounded("clone_requeue_delay", self.clone_requeue_delay)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LeaseManagerConfig::default().validate().is_ok());
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(ResetterConfig::default().validate().is_ok());
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = LeaseManagerConfig {
            maximum_transactions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            minimum_search_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ResetterConfig {
            stalled_threshold: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            num_handlers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_durations_rejected() {
        let config = LeaseManagerConfig {
            requeue_delay: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("requeue_delay"));

        let config = ResetterConfig {
            stalled_threshold: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            clone_requeue_delay: MAX_DURATION + Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LeaseManagerConfig {
            requeue_delay: MAX_DURATION,
            unreported_max_age: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
