//! End-to-end cycle tests
//!
//! These tests drive full cycles through the coordinator against simulated
//! relays, with redb-backed storage as sink, watermark store and directory.
//!
//! ## What These Tests Verify
//!
//! - A capped relay is drained completely
//! - Re-running cycles stores nothing twice
//! - Watermarks move only for drained relays, and never backward
//! - Budget expiry mid-stack leaves a stored watermark untouched
//! - Per-relay pacing holds across a whole cycle
//! - Open connections stay under workers × sessions per worker
//! - A stuck relay does not hold up the others
//! - Sink failures and an unreadable directory leave watermarks alone

use std::sync::Arc;
use std::time::Duration;

use relaysync_core::memory::{
    spread_events, MemoryConnector, MemoryDirectory, MemoryRelay, MemorySink, MemorySinkFactory,
    MemoryWatermarks,
};
use relaysync_core::{
    AbandonReason, CycleState, Relay, RelayId, SessionOutcome, SharedSink, Storage, SyncConfig,
    SyncCoordinator, SyncError, Timestamp, WatermarkStore,
};
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

fn base_config() -> SyncConfig {
    SyncConfig {
        workers: 2,
        sessions_per_worker: 3,
        stagger_min_ms: 0,
        stagger_max_ms: 20,
        min_request_interval_ms: 0,
        default_lookback_secs: 10_000,
        ..SyncConfig::default()
    }
}

/// Start of a block of events that lies inside the default lookback
fn recent_start() -> u64 {
    Timestamp::now().0 - 5_000
}

fn storage_coordinator(
    config: SyncConfig,
    storage: &Storage,
    connector: &MemoryConnector,
) -> SyncCoordinator {
    let store = Arc::new(storage.clone());
    SyncCoordinator::new(
        config,
        store.clone(),
        store.clone(),
        store,
        Arc::new(connector.clone()),
    )
    .unwrap()
}

fn create_storage() -> (Storage, TempDir) {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(temp.path().join("relaysync.redb")).unwrap();
    (storage, temp)
}

// ============================================================================
// Completeness and idempotence
// ============================================================================

/// 200 items behind a cap of 10 all reach the sink
#[tokio::test(start_paused = true)]
async fn test_capped_relay_drained_completely() {
    let (storage, _temp) = create_storage();
    let connector = MemoryConnector::new();
    let events = spread_events(200, recent_start());
    connector.add("dense:7447", MemoryRelay::new(events.clone()).with_cap(10));
    storage
        .save_relay(&Relay::new("dense:7447").with_result_cap(10))
        .unwrap();

    let coordinator = storage_coordinator(base_config(), &storage, &connector);
    let report = coordinator.run_cycle().await.unwrap();

    assert_eq!(report.state, CycleState::Completed);
    assert_eq!(storage.count_events().unwrap(), 200);
    for event in &events {
        assert!(storage.load_event(&event.id).unwrap().is_some());
    }
    let session = report.session(&RelayId::new("dense:7447")).unwrap();
    assert!(session.stats.queries >= 20);
    assert!(session.stats.possibly_incomplete.is_empty());
}

/// A burst larger than the cap in one second is flagged, the rest is complete
#[tokio::test(start_paused = true)]
async fn test_overfull_second_is_flagged() {
    let (storage, _temp) = create_storage();
    let connector = MemoryConnector::new();
    let start = recent_start();
    let mut events = spread_events(30, start);
    for i in 0..15 {
        events.push(relaysync_core::Event::build(
            "b2".repeat(32),
            start + 100,
            1,
            vec![],
            format!("burst {}", i),
        ));
    }
    connector.add("burst:7447", MemoryRelay::new(events).with_cap(10));
    storage
        .save_relay(&Relay::new("burst:7447").with_result_cap(10))
        .unwrap();

    let coordinator = storage_coordinator(base_config(), &storage, &connector);
    let report = coordinator.run_cycle().await.unwrap();

    let session = report.session(&RelayId::new("burst:7447")).unwrap();
    assert!(session.outcome.is_drained());
    assert_eq!(session.stats.possibly_incomplete.len(), 1);
    assert_eq!(session.stats.possibly_incomplete[0].since, Timestamp(start + 100));
    assert_eq!(storage.count_events().unwrap(), 40);
}

/// Overlapping relays and repeated cycles never store an event twice
#[tokio::test(start_paused = true)]
async fn test_repeated_cycles_are_idempotent() {
    let (storage, _temp) = create_storage();
    let connector = MemoryConnector::new();
    let events = spread_events(60, recent_start());
    connector.add("a:7447", MemoryRelay::new(events.clone()).with_cap(7));
    connector.add("b:7447", MemoryRelay::new(events[20..].to_vec()).with_cap(7));
    storage.save_relay(&Relay::new("a:7447").with_result_cap(7)).unwrap();
    storage.save_relay(&Relay::new("b:7447").with_result_cap(7)).unwrap();

    let coordinator = storage_coordinator(base_config(), &storage, &connector);
    let first = coordinator.run_cycle().await.unwrap();
    assert_eq!(first.stored(), 60);

    // Forget coverage so the next cycle re-harvests everything.
    let fresh = Arc::new(storage.clone());
    let coordinator = SyncCoordinator::new(
        base_config(),
        fresh.clone(),
        MemoryWatermarks::new(),
        fresh,
        Arc::new(connector.clone()),
    )
    .unwrap();
    let second = coordinator.run_cycle().await.unwrap();

    assert_eq!(second.drained(), 2);
    assert_eq!(second.stored(), 0);
    assert_eq!(storage.count_events().unwrap(), 60);
    let shared = &events[30].id;
    assert_eq!(storage.event_sources(shared).unwrap().len(), 2);
}

// ============================================================================
// Watermarks
// ============================================================================

/// A relay that fails keeps its watermark; the next cycle re-covers the gap
#[tokio::test(start_paused = true)]
async fn test_failed_relay_recovered_next_cycle() {
    let (storage, _temp) = create_storage();
    let connector = MemoryConnector::new();
    let events = spread_events(40, recent_start());
    connector.add(
        "flaky:7447",
        MemoryRelay::new(events.clone()).failing_connects(3),
    );
    storage.save_relay(&Relay::new("flaky:7447")).unwrap();
    let id = RelayId::new("flaky:7447");

    let coordinator = storage_coordinator(base_config(), &storage, &connector);
    let first = coordinator.run_cycle().await.unwrap();

    assert!(matches!(
        first.session(&id).unwrap().outcome,
        SessionOutcome::Abandoned(_)
    ));
    assert_eq!(storage.get(&id).unwrap(), None);
    assert_eq!(storage.count_events().unwrap(), 0);

    let second = coordinator.run_cycle().await.unwrap();
    assert!(second.session(&id).unwrap().outcome.is_drained());
    assert_eq!(storage.get(&id).unwrap(), Some(second.cycle_end));
    assert_eq!(storage.count_events().unwrap(), 40);
}

/// The next cycle starts exactly at the committed watermark
#[tokio::test(start_paused = true)]
async fn test_next_cycle_starts_at_watermark() {
    let (storage, _temp) = create_storage();
    let connector = MemoryConnector::new();
    connector.add("a:7447", MemoryRelay::new(spread_events(5, recent_start())));
    storage.save_relay(&Relay::new("a:7447")).unwrap();

    let coordinator = storage_coordinator(base_config(), &storage, &connector);
    let first = coordinator.run_cycle().await.unwrap();
    let committed = first.committed[&RelayId::new("a:7447")];

    let second = coordinator.run_cycle().await.unwrap();
    let session = second.session(&RelayId::new("a:7447")).unwrap();
    assert_eq!(session.target.since, committed);
    assert!(storage.get(&RelayId::new("a:7447")).unwrap().unwrap() >= committed);
}

/// A budget that runs out after the first window leaves a stored watermark
/// exactly where it was
#[tokio::test(start_paused = true)]
async fn test_budget_expiry_mid_stack_keeps_prior_watermark() {
    let (storage, _temp) = create_storage();
    let connector = MemoryConnector::new();
    let before = Timestamp(recent_start());
    connector.add(
        "slow:7447",
        MemoryRelay::new(spread_events(50, before.0 + 10))
            .with_cap(10)
            .with_latency(Duration::from_secs(1)),
    );
    storage
        .save_relay(
            &Relay::new("slow:7447")
                .with_result_cap(10)
                .with_budget(Duration::from_millis(1_500)),
        )
        .unwrap();
    let id = RelayId::new("slow:7447");
    storage.set(&id, before).unwrap();

    let coordinator = storage_coordinator(base_config(), &storage, &connector);
    let report = coordinator.run_cycle().await.unwrap();

    let session = report.session(&id).unwrap();
    assert_eq!(session.target.since, before);
    assert_eq!(
        session.outcome,
        SessionOutcome::Abandoned(AbandonReason::BudgetExceeded)
    );
    assert_eq!(session.stats.windows_resolved, 1);
    assert!(report.committed.is_empty());
    assert_eq!(storage.get(&id).unwrap(), Some(before));
}

/// Sink rejecting writes keeps the watermark where it was
#[tokio::test(start_paused = true)]
async fn test_sink_failure_blocks_watermark() {
    let connector = MemoryConnector::new();
    connector.add("a:7447", MemoryRelay::new(spread_events(5, recent_start())));
    let sink = MemorySink::new();
    sink.fail_always(true);
    let watermarks = MemoryWatermarks::new();

    let coordinator = SyncCoordinator::new(
        base_config(),
        MemoryDirectory::new(vec![Relay::new("a:7447")]),
        watermarks.clone(),
        Arc::new(SharedSink(sink.clone())),
        Arc::new(connector.clone()),
    )
    .unwrap();
    let report = coordinator.run_cycle().await.unwrap();

    assert!(matches!(
        report.sessions[0].outcome,
        SessionOutcome::SinkFailed(_)
    ));
    assert!(report.committed.is_empty());
    assert_eq!(watermarks.get(&RelayId::new("a:7447")).unwrap(), None);
}

/// An unreadable directory aborts the cycle before any relay is contacted
#[tokio::test]
async fn test_unreadable_directory_aborts_cycle() {
    let connector = MemoryConnector::new();
    let directory = MemoryDirectory::new(vec![Relay::new("a:7447")]);
    directory.set_unreadable(true);
    let watermarks = MemoryWatermarks::new();
    watermarks.set(&RelayId::new("a:7447"), Timestamp(42)).unwrap();

    let coordinator = SyncCoordinator::new(
        base_config(),
        directory,
        watermarks.clone(),
        Arc::new(MemorySinkFactory::new(MemorySink::new())),
        Arc::new(connector.clone()),
    )
    .unwrap();

    let result = coordinator.run_cycle().await;
    assert!(matches!(result, Err(SyncError::Directory(_))));
    assert_eq!(connector.connect_attempts(), 0);
    assert_eq!(
        watermarks.get(&RelayId::new("a:7447")).unwrap(),
        Some(Timestamp(42))
    );
}

/// Proxied relays without a proxy address are a configuration error
#[tokio::test]
async fn test_proxied_relay_without_proxy_is_fatal() {
    let (storage, _temp) = create_storage();
    storage
        .save_relay(
            &Relay::new("hidden.onion:7447")
                .with_transport(relaysync_core::TransportClass::Proxied),
        )
        .unwrap();
    let connector = MemoryConnector::new();

    let coordinator = storage_coordinator(base_config(), &storage, &connector);
    let result = coordinator.run_cycle().await;

    assert!(matches!(result, Err(SyncError::Config(_))));
    assert_eq!(coordinator.state(), CycleState::Idle);
}

// ============================================================================
// Pacing, concurrency and isolation
// ============================================================================

/// Consecutive queries to one relay are at least the minimum interval apart
#[tokio::test(start_paused = true)]
async fn test_min_interval_holds_per_relay() {
    let connector = MemoryConnector::new();
    let start = recent_start();
    for name in ["a:7447", "b:7447"] {
        connector.add(name, MemoryRelay::new(spread_events(50, start)).with_cap(5));
    }
    let relays = vec![
        Relay::new("a:7447").with_result_cap(5),
        Relay::new("b:7447").with_result_cap(5),
    ];
    let config = SyncConfig {
        min_request_interval_ms: 250,
        ..base_config()
    };

    let coordinator = SyncCoordinator::new(
        config,
        MemoryDirectory::new(relays),
        MemoryWatermarks::new(),
        Arc::new(MemorySinkFactory::new(MemorySink::new())),
        Arc::new(connector.clone()),
    )
    .unwrap();
    let report = coordinator.run_cycle().await.unwrap();
    assert_eq!(report.drained(), 2);

    for name in ["a:7447", "b:7447"] {
        let queries = connector.queries_for(&RelayId::new(name));
        assert!(queries.len() >= 10);
        for pair in queries.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(250));
        }
    }
}

/// Open connections never exceed workers × sessions per worker
#[tokio::test(start_paused = true)]
async fn test_connection_ceiling() {
    let connector = MemoryConnector::new();
    let start = recent_start();
    let mut relays = Vec::new();
    for i in 0..25 {
        let name = format!("relay{}:7447", i);
        connector.add(
            name.as_str(),
            MemoryRelay::new(spread_events(10, start)).with_latency(Duration::from_millis(300)),
        );
        relays.push(Relay::new(name));
    }
    let config = base_config();
    let ceiling = config.connection_ceiling();

    let coordinator = SyncCoordinator::new(
        config,
        MemoryDirectory::new(relays),
        MemoryWatermarks::new(),
        Arc::new(MemorySinkFactory::new(MemorySink::new())),
        Arc::new(connector.clone()),
    )
    .unwrap();
    let report = coordinator.run_cycle().await.unwrap();

    assert_eq!(report.drained(), 25);
    assert!(connector.peak_connections() <= ceiling);
    assert!(connector.peak_connections() > 1);
    assert_eq!(connector.live_connections(), 0);
}

/// A relay that never answers is cut off by its budget; the rest finish
#[tokio::test(start_paused = true)]
async fn test_stuck_relay_is_isolated() {
    let connector = MemoryConnector::new();
    let start = recent_start();
    connector.add("stuck:7447", MemoryRelay::new(spread_events(5, start)).hanging());
    let mut relays = vec![Relay::new("stuck:7447")
        .with_budget(Duration::from_secs(20))
        .with_request_timeout(Duration::from_secs(60))];
    for i in 0..4 {
        let name = format!("ok{}:7447", i);
        connector.add(name.as_str(), MemoryRelay::new(spread_events(5, start)));
        relays.push(Relay::new(name));
    }
    let config = SyncConfig {
        workers: 1,
        sessions_per_worker: 2,
        ..base_config()
    };

    let coordinator = SyncCoordinator::new(
        config,
        MemoryDirectory::new(relays),
        MemoryWatermarks::new(),
        Arc::new(MemorySinkFactory::new(MemorySink::new())),
        Arc::new(connector.clone()),
    )
    .unwrap();
    let report = coordinator.run_cycle().await.unwrap();

    assert_eq!(report.state, CycleState::Completed);
    assert_eq!(report.drained(), 4);
    let stuck = report.session(&RelayId::new("stuck:7447")).unwrap();
    assert_eq!(
        stuck.outcome,
        SessionOutcome::Abandoned(relaysync_core::AbandonReason::BudgetExceeded)
    );
    for i in 0..4 {
        let ok = report.session(&RelayId::new(format!("ok{}:7447", i))).unwrap();
        assert!(ok.elapsed < Duration::from_secs(1));
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Shutdown mid-cycle stops sessions and advances nothing still in flight
#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_cycle() {
    let (storage, _temp) = create_storage();
    let connector = MemoryConnector::new();
    let start = recent_start();
    connector.add(
        "slow:7447",
        MemoryRelay::new(spread_events(100, start))
            .with_cap(5)
            .with_latency(Duration::from_millis(200)),
    );
    storage
        .save_relay(&Relay::new("slow:7447").with_result_cap(5))
        .unwrap();

    let coordinator = Arc::new(storage_coordinator(base_config(), &storage, &connector));
    let stop = coordinator.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.cancel();
    });

    let report = coordinator.run_cycle().await.unwrap();

    assert_eq!(report.state, CycleState::Stopped);
    assert!(report.committed.is_empty());
    assert_eq!(storage.get(&RelayId::new("slow:7447")).unwrap(), None);
    let stored = storage.count_events().unwrap();
    assert!(stored > 0 && stored < 100);
}
