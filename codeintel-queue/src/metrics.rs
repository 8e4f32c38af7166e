//! Counters and gauges shared by the queue services.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the lease manager, scheduler, resetter and
/// worker. One instance is shared through an `Arc`.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Items handed out by the lease manager
    pub dequeued: AtomicU64,
    /// Dequeue attempts rejected because no permit was free
    pub dequeue_throttled: AtomicU64,
    /// Leases finalized through complete
    pub completed: AtomicU64,
    /// Leases completed with an error message
    pub completed_with_error: AtomicU64,
    /// Leases requeued by heartbeat reconciliation
    pub heartbeat_reclaimed: AtomicU64,
    /// Leases requeued because their agent went silent
    pub cleanup_reclaimed: AtomicU64,
    /// Agents removed by the cleanup sweep
    pub agents_pruned: AtomicU64,
    /// Leases rolled back during shutdown
    pub shutdown_rolled_back: AtomicU64,
    /// Store failures seen while reclaiming leases
    pub reclaim_errors: AtomicU64,
    /// Items inserted by the scheduler
    pub scheduled: AtomicU64,
    /// Candidates skipped because the repository is missing or cloning
    pub scheduler_skipped: AtomicU64,
    /// Repositories whose index configuration could not be parsed
    pub invalid_configurations: AtomicU64,
    /// Scheduler ticks aborted by an error
    pub scheduler_errors: AtomicU64,
    /// Stalled items moved back to queued
    pub reset: AtomicU64,
    /// Stalled items that hit the reset limit
    pub reset_errored: AtomicU64,
    /// Resetter sweeps that failed
    pub resetter_errors: AtomicU64,
    /// Items the worker finished successfully
    pub processed: AtomicU64,
    /// Items the worker requeued (clone in progress)
    pub process_requeued: AtomicU64,
    /// Items the worker recorded as errored
    pub process_errored: AtomicU64,
    /// Items whose transaction the worker rolled back
    pub process_failed: AtomicU64,

    /// Gauge: leases currently held by agents
    pub outstanding_leases: AtomicU64,
    /// Gauge: items in the `queued` state, visible or not
    pub queued_items: AtomicU64,
}

impl QueueMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Get snapshot of current counters
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            dequeued: self.dequeued.load(Ordering::Relaxed),
            dequeue_throttled: self.dequeue_throttled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            completed_with_error: self.completed_with_error.load(Ordering::Relaxed),
            heartbeat_reclaimed: self.heartbeat_reclaimed.load(Ordering::Relaxed),
            cleanup_reclaimed: self.cleanup_reclaimed.load(Ordering::Relaxed),
            agents_pruned: self.agents_pruned.load(Ordering::Relaxed),
            shutdown_rolled_back: self.shutdown_rolled_back.load(Ordering::Relaxed),
            reclaim_errors: self.reclaim_errors.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            scheduler_skipped: self.scheduler_skipped.load(Ordering::Relaxed),
            invalid_configurations: self.invalid_configurations.load(Ordering::Relaxed),
            scheduler_errors: self.scheduler_errors.load(Ordering::Relaxed),
            reset: self.reset.load(Ordering::Relaxed),
            reset_errored: self.reset_errored.load(Ordering::Relaxed),
            resetter_errors: self.resetter_errors.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            process_requeued: self.process_requeued.load(Ordering::Relaxed),
            process_errored: self.process_errored.load(Ordering::Relaxed),
            process_failed: self.process_failed.load(Ordering::Relaxed),
            outstanding_leases: self.outstanding_leases.load(Ordering::Relaxed),
            queued_items: self.queued_items.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub dequeued: u64,
    pub dequeue_throttled: u64,
    pub completed: u64,
    pub completed_with_error: u64,
    pub heartbeat_reclaimed: u64,
    pub cleanup_reclaimed: u64,
    pub agents_pruned: u64,
    pub shutdown_rolled_back: u64,
    pub reclaim_errors: u64,
    pub scheduled: u64,
    pub scheduler_skipped: u64,
    pub invalid_configurations: u64,
    pub scheduler_errors: u64,
    pub reset: u64,
    pub reset_errored: u64,
    pub resetter_errors: u64,
    pub processed: u64,
    pub process_requeued: u64,
    pub process_errored: u64,
    pub process_failed: u64,
    pub outstanding_leases: u64,
    pub queued_items: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = QueueMetrics::default();
        QueueMetrics::incr(&metrics.dequeued);
        QueueMetrics::incr(&metrics.dequeued);
        QueueMetrics::add(&metrics.reset, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dequeued, 2);
        assert_eq!(snapshot.reset, 3);
        assert_eq!(snapshot.completed, 0);
    }

    #[test]
    fn test_gauges_are_overwritten() {
        let metrics = QueueMetrics::default();
        QueueMetrics::set(&metrics.queued_items, 5);
        QueueMetrics::set(&metrics.queued_items, 2);
        QueueMetrics::set(&metrics.outstanding_leases, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queued_items, 2);
        assert_eq!(snapshot.outstanding_leases, 1);
    }
}
