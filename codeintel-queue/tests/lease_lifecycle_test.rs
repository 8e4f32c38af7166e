use codeintel_queue::{
    Clock, DequeueConditions, Finalize, Gitserver, IndexJobDefaults, LeaseManager,
    LeaseManagerConfig, ManualClock, MemoryStore, NewWorkItem, QueueMetrics, RepositoryUsage,
    Resetter, ResetterConfig, Scheduler, SchedulerConfig, SqliteStore, StaticGitserver,
    StoreConfig, WorkState, WorkStore,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const UNREPORTED_MAX_AGE: Duration = Duration::from_secs(10);

fn lease_config(maximum_transactions: usize) -> LeaseManagerConfig {
    LeaseManagerConfig {
        maximum_transactions,
        requeue_delay: Duration::from_secs(30),
        unreported_max_age: UNREPORTED_MAX_AGE,
        death_threshold: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(5),
        conditions: DequeueConditions::default(),
    }
}

fn new_item(commit: String) -> NewWorkItem {
    NewWorkItem {
        repository_id: 50,
        commit,
        indexer: "sourcegraph/lsif-go".to_string(),
        ..Default::default()
    }
}

/// Store whose item ids start at 11.
fn seeded_store(clock: Arc<ManualClock>, count: usize) -> MemoryStore {
    let store = MemoryStore::new(clock);
    store.reserve_ids_until(11).unwrap();
    for i in 0..count {
        store.insert_item(new_item(format!("{i:040x}"))).unwrap();
    }
    store
}

fn manager(
    clock: Arc<ManualClock>,
    store: &MemoryStore,
    config: LeaseManagerConfig,
) -> LeaseManager {
    LeaseManager::new(
        Arc::new(store.clone()),
        clock,
        config,
        Arc::new(QueueMetrics::default()),
    )
}

/// Permits are recycled once a lease completes
#[tokio::test]
async fn test_permit_recycling() {
    let clock = Arc::new(ManualClock::default());
    let store = seeded_store(clock.clone(), 11);
    let manager = manager(clock.clone(), &store, lease_config(10));

    let mut ids = Vec::new();
    for _ in 0..10 {
        let item = manager.dequeue("agent").await.unwrap().expect("item");
        ids.push(item.id);
    }
    assert_eq!(ids, (11..=20).collect::<Vec<i64>>());

    assert!(manager.dequeue("agent").await.unwrap().is_none());

    assert!(manager.complete("agent", 15, "").await.unwrap());
    let next = manager.dequeue("agent").await.unwrap().expect("item");
    assert_eq!(next.id, 21);

    assert!(manager.dequeue("agent").await.unwrap().is_none());
}

/// Heartbeat requeues only unreported leases past the grace period
#[tokio::test]
async fn test_heartbeat_reconciliation() {
    let clock = Arc::new(ManualClock::default());
    let store = seeded_store(clock.clone(), 5);
    let manager = manager(clock.clone(), &store, lease_config(10));

    for _ in 0..5 {
        manager.dequeue("deadbeef").await.unwrap().expect("item");
    }

    clock.advance(UNREPORTED_MAX_AGE);
    manager.heartbeat("deadbeef", &[12, 14, 15]).await.unwrap();

    assert_eq!(manager.metrics().snapshot().heartbeat_reclaimed, 2);
    for id in [11, 13] {
        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Queued);
        assert!(!manager.complete("deadbeef", id, "").await.unwrap());
    }
    for id in [12, 14, 15] {
        assert!(manager.complete("deadbeef", id, "").await.unwrap());
        assert_eq!(store.item(id).unwrap().unwrap().state, WorkState::Completed);
    }
    assert_eq!(manager.available_permits(), 10);
}

/// Complete for an unknown pair is a no-op
#[tokio::test]
async fn test_complete_unknown_lease() {
    let clock = Arc::new(ManualClock::default());
    let store = seeded_store(clock.clone(), 1);
    let manager = manager(clock, &store, lease_config(10));

    assert!(!manager.complete("nobody", 11, "").await.unwrap());
    assert!(!manager.complete("nobody", 9999, "boom").await.unwrap());
    assert_eq!(store.item(11).unwrap().unwrap().state, WorkState::Queued);
}

/// Agents just under the death threshold survive a sweep; agents over it do not
#[tokio::test]
async fn test_cleanup_death_threshold() {
    let clock = Arc::new(ManualClock::default());
    let store = seeded_store(clock.clone(), 3);
    let manager = manager(clock.clone(), &store, lease_config(10));

    manager.dequeue("quiet").await.unwrap();
    manager.dequeue("quiet").await.unwrap();
    clock.advance(Duration::from_secs(2));
    manager.dequeue("chatty").await.unwrap();

    clock.advance(Duration::from_secs(59));
    manager.cleanup().await.unwrap();

    let status = manager.status().await;
    let names: Vec<&str> = status.agents.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["chatty"]);
    assert_eq!(status.total_leases(), 1);
    assert_eq!(status.available_permits, 9);

    for id in [11, 12] {
        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Queued);
        assert_eq!(
            item.process_after,
            Some(clock.now() + chrono::Duration::seconds(30))
        );
    }
    assert_eq!(store.item(13).unwrap().unwrap().state, WorkState::Processing);
}

/// Stop rolls back open leases and waits for the cleanup loop
#[tokio::test]
async fn test_stop_rolls_back_open_leases() {
    let clock = Arc::new(ManualClock::default());
    let store = seeded_store(clock.clone(), 4);
    let manager = Arc::new(manager(clock.clone(), &store, lease_config(10)));

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    for agent in ["a", "b", "c"] {
        manager.dequeue(agent).await.unwrap().expect("item");
    }
    assert!(manager.complete("a", 11, "").await.unwrap());

    manager.stop().await.unwrap();
    runner.await.unwrap().unwrap();

    assert_eq!(store.item(11).unwrap().unwrap().state, WorkState::Completed);
    for id in [12, 13, 14] {
        let item = store.item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkState::Queued);
        assert!(!store.is_locked(id).unwrap());
    }
    assert_eq!(manager.available_permits(), 10);
    assert_eq!(manager.metrics().snapshot().shutdown_rolled_back, 2);
    assert!(manager.dequeue("a").await.unwrap().is_none());
}

/// Every dequeued lease is finalized exactly once under randomized
/// concurrent traffic
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_randomized_lease_accounting() {
    const AGENTS: usize = 6;
    const OPS_PER_AGENT: usize = 200;
    const MAX_TRANSACTIONS: usize = 5;

    let clock = Arc::new(ManualClock::default());
    let store = seeded_store(clock.clone(), 300);
    let manager = Arc::new(manager(
        clock.clone(),
        &store,
        lease_config(MAX_TRANSACTIONS),
    ));

    let mut tasks = Vec::new();
    for agent_index in 0..AGENTS {
        let manager = manager.clone();
        let clock = clock.clone();
        tasks.push(tokio::spawn(async move {
            let agent = format!("agent-{agent_index}");
            let mut rng = StdRng::seed_from_u64(agent_index as u64);
            let mut held: Vec<i64> = Vec::new();

            for _ in 0..OPS_PER_AGENT {
                match rng.gen_range(0..10) {
                    0..=3 => {
                        if let Some(item) = manager.dequeue(&agent).await.unwrap() {
                            held.push(item.id);
                        }
                    }
                    4..=5 if !held.is_empty() => {
                        let id = held.swap_remove(rng.gen_range(0..held.len()));
                        let message = if rng.gen_bool(0.2) { "failed" } else { "" };
                        // The lease may already have been reclaimed.
                        manager.complete(&agent, id, message).await.unwrap();
                    }
                    6..=7 => {
                        let reported: Vec<i64> =
                            held.iter().copied().filter(|_| rng.gen_bool(0.7)).collect();
                        manager.heartbeat(&agent, &reported).await.unwrap();
                    }
                    8 => manager.cleanup().await.unwrap(),
                    _ => clock.advance(Duration::from_secs(rng.gen_range(1..20))),
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    manager.stop().await.unwrap();

    assert_eq!(manager.available_permits(), MAX_TRANSACTIONS);

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.outstanding_leases, 0);
    assert_eq!(
        snapshot.dequeued,
        snapshot.completed
            + snapshot.heartbeat_reclaimed
            + snapshot.cleanup_reclaimed
            + snapshot.shutdown_rolled_back
    );

    for item in store.items().unwrap() {
        assert!(!store.is_locked(item.id).unwrap());
        assert_ne!(item.state, WorkState::Processing);
    }
}

/// A missing repository does not stop the rest of the batch
#[tokio::test]
async fn test_scheduler_skips_missing_repository() {
    let clock = Arc::new(ManualClock::default());
    let store = MemoryStore::new(clock.clone());
    let gitserver = StaticGitserver::new();

    for id in 1..=3 {
        store
            .upsert_repository(RepositoryUsage::new(id, 100, 0))
            .unwrap();
    }
    gitserver.set_head(1, "c1");
    gitserver.set_head(3, "c3");

    let scheduler = Scheduler::new(
        Arc::new(store.clone()),
        Arc::new(gitserver.clone()),
        clock.clone(),
        SchedulerConfig::default(),
        IndexJobDefaults::default(),
        Arc::new(QueueMetrics::default()),
    );

    let summary = scheduler.tick().await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.inserted_items, 2);

    let commits: Vec<(i64, String)> = store
        .items()
        .unwrap()
        .into_iter()
        .map(|item| (item.repository_id, item.commit))
        .collect();
    assert_eq!(commits, vec![(1, "c1".to_string()), (3, "c3".to_string())]);
    assert_eq!(gitserver.head(3).await.unwrap(), "c3");
}

/// Two sweeps in a row reset nothing the second time
#[tokio::test]
async fn test_resetter_idempotence() {
    let clock = Arc::new(ManualClock::default());
    let store = seeded_store(clock.clone(), 3);

    // Two workers vanish without finalizing; one is still alive.
    for _ in 0..2 {
        let (_, tx) = store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        drop(tx);
    }
    let (_, live) = store
        .dequeue(&DequeueConditions::default())
        .await
        .unwrap()
        .unwrap();

    let metrics = Arc::new(QueueMetrics::default());
    let resetter = Resetter::new(
        Arc::new(store.clone()),
        clock.clone(),
        ResetterConfig {
            interval: Duration::from_secs(60),
            stalled_threshold: Duration::from_secs(120),
        },
        metrics.clone(),
    );

    clock.advance(Duration::from_secs(600));
    let first = resetter.reset().await.unwrap();
    assert_eq!(first.reset_ids, vec![11, 12]);

    let second = resetter.reset().await.unwrap();
    assert!(second.reset_ids.is_empty());
    assert!(second.errored_ids.is_empty());
    assert_eq!(metrics.snapshot().reset, 2);

    assert_eq!(store.item(13).unwrap().unwrap().state, WorkState::Processing);
    live.rollback().await.unwrap();
}

/// Leases over the SQLite store: outcomes and shutdown rollbacks survive a
/// reopen
#[tokio::test]
async fn test_sqlite_lease_lifecycle_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let clock = Arc::new(ManualClock::default());

    {
        let store = SqliteStore::open(&path, clock.clone(), StoreConfig::default()).unwrap();
        store.reserve_ids_until(11).unwrap();
        for i in 0..3 {
            store.insert_item(new_item(format!("{i:040x}"))).unwrap();
        }

        let manager = LeaseManager::new(
            Arc::new(store.clone()),
            clock.clone(),
            lease_config(2),
            Arc::new(QueueMetrics::default()),
        );
        assert_eq!(manager.dequeue("agent").await.unwrap().map(|i| i.id), Some(11));
        assert_eq!(manager.dequeue("agent").await.unwrap().map(|i| i.id), Some(12));
        assert!(manager.dequeue("agent").await.unwrap().is_none());

        assert!(manager.complete("agent", 11, "indexer crashed").await.unwrap());
        manager.stop().await.unwrap();

        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot.shutdown_rolled_back, 1);
        assert_eq!(snapshot.queued_items, 2);
    }

    let store = SqliteStore::open(&path, clock, StoreConfig::default()).unwrap();
    let states: Vec<(i64, WorkState)> = store
        .items()
        .unwrap()
        .into_iter()
        .map(|item| (item.id, item.state))
        .collect();
    assert_eq!(
        states,
        vec![
            (11, WorkState::Errored),
            (12, WorkState::Queued),
            (13, WorkState::Queued)
        ]
    );
    let errored = store.item(11).unwrap().unwrap();
    assert_eq!(errored.failure_message.as_deref(), Some("indexer crashed"));
    assert!(!store.is_locked(12).unwrap());
}
