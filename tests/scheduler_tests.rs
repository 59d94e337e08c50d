/// Scheduler tests
///
/// Tick fan-out, leadership transitions and virtual clock behaviour.
/// Run with: cargo test --test scheduler_tests

mod common;

use chrono::{NaiveDateTime, TimeDelta};
use common::{FaultyStore, provision_zone};
use edgelease::core::now_minute;
use edgelease::{
    AllocationEngine, DeviceId, LeaseError, LocalLeaderGate, MemoryStore, PeriodicScheduler,
    SchedulerConfig, SchedulerState, SiteId, Store, UsageRecorder, ZoneDirectory, ZoneId,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn site(name: &str) -> SiteId {
    SiteId::parse(name).unwrap()
}

fn fast() -> SchedulerConfig {
    // One simulated minute per real millisecond.
    SchedulerConfig::new(NonZeroU32::new(60_000).unwrap())
}

fn scheduler_for(store: Arc<dyn Store>, config: SchedulerConfig) -> PeriodicScheduler {
    PeriodicScheduler::new(
        ZoneDirectory::new(store.clone()),
        UsageRecorder::new(store),
        config,
    )
}

async fn latest(store: &Arc<MemoryStore>, zone: &ZoneId) -> Option<NaiveDateTime> {
    UsageRecorder::new(store.clone())
        .latest_timestamp([zone])
        .await
        .unwrap()
}

async fn wait_until_after(store: &Arc<MemoryStore>, zone: &ZoneId, mark: Option<NaiveDateTime>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while latest(store, zone).await <= mark {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scheduler did not record anything new");
}

#[tokio::test]
async fn test_tick_records_every_site() {
    let store = Arc::new(MemoryStore::new());
    let z1 = provision_zone(store.as_ref(), "z1", &["s1", "s2"], 2, 1).await;
    let z2 = provision_zone(store.as_ref(), "z2", &["s9"], 1, 0).await;

    let engine = AllocationEngine::new(store.clone());
    engine.claim(&z1, &site("s1"), &DeviceId::parse("d1").unwrap()).await.unwrap();
    engine.claim(&z1, &site("s1"), &DeviceId::parse("d2").unwrap()).await.unwrap();
    // No pinned capacity at s5, so this binds the elastic instance there.
    engine.claim(&z1, &site("s5"), &DeviceId::parse("d3").unwrap()).await.unwrap();

    let scheduler = scheduler_for(store.clone(), fast());
    let ts = now_minute();
    let report = scheduler.run_tick(ts, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.timestamp, ts);
    assert_eq!(report.sites, 4);
    assert_eq!(report.recorded, 4);
    assert_eq!(report.failed, 0);

    let recorder = UsageRecorder::new(store.clone());
    let using = |zone: &ZoneId, name: &str| {
        let recorder = recorder.clone();
        let zone = zone.clone();
        let site = site(name);
        async move { recorder.history(&zone, &site).await.unwrap()[0].instances }
    };
    assert_eq!(using(&z1, "s1").await, 2);
    assert_eq!(using(&z1, "s2").await, 0);
    assert_eq!(using(&z1, "s5").await, 1);
    assert_eq!(using(&z2, "s9").await, 0);
}

#[tokio::test]
async fn test_repeated_tick_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let zone = provision_zone(store.as_ref(), "z1", &["s1", "s2"], 1, 0).await;
    let scheduler = scheduler_for(store.clone(), fast());

    let ts = now_minute();
    scheduler.run_tick(ts, &CancellationToken::new()).await.unwrap();
    let again = scheduler.run_tick(ts, &CancellationToken::new()).await.unwrap();

    assert_eq!(again.recorded, 0);
    assert_eq!(again.already_recorded, 2);
    let history = UsageRecorder::new(store.clone()).history(&zone, &site("s1")).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_cancelled_tick_starts_no_site_work() {
    let store = Arc::new(MemoryStore::new());
    let zone = provision_zone(store.as_ref(), "z1", &["s1", "s2", "s3"], 1, 0).await;
    let scheduler = scheduler_for(store.clone(), fast());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = scheduler.run_tick(now_minute(), &cancel).await.unwrap();

    assert_eq!(report.sites, 3);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.recorded, 0);
    assert_eq!(latest(&store, &zone).await, None);
}

#[tokio::test]
async fn test_broken_zone_is_skipped_and_failures_are_counted() {
    let inner = MemoryStore::new();
    let (store, faults) = FaultyStore::new(inner);
    provision_zone(store.as_ref(), "z1", &["s1", "s2"], 1, 0).await;
    let z2 = provision_zone(store.as_ref(), "z2", &["s9"], 1, 0).await;
    faults.break_zone(&z2);

    let scheduler = scheduler_for(store.clone(), fast());
    let report = scheduler.run_tick(now_minute(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.sites, 2);
    assert_eq!(report.recorded, 2);

    faults.fail_record_inserts(true);
    let report = scheduler
        .run_tick(now_minute() + TimeDelta::minutes(1), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.sites, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(report.recorded, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leadership_loss_stops_recording() {
    let store = Arc::new(MemoryStore::new());
    let zone = provision_zone(store.as_ref(), "z1", &["s1"], 1, 0).await;
    let scheduler = Arc::new(scheduler_for(store.clone(), fast()));
    let gate = Arc::new(LocalLeaderGate::new());
    let shutdown = CancellationToken::new();
    let mut states = scheduler.subscribe();

    let task = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let gate = Arc::clone(&gate);
        let shutdown = shutdown.clone();
        async move { scheduler.run(gate.as_ref(), shutdown).await }
    });

    gate.acquire();
    states.wait_for(|s| *s == SchedulerState::Leading).await.unwrap();
    wait_until_after(&store, &zone, None).await;

    gate.relinquish();
    states.wait_for(|s| *s == SchedulerState::Idle).await.unwrap();
    let frozen = latest(&store, &zone).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(latest(&store, &zone).await, frozen, "appended after reporting Idle");

    // A new term continues past the old history.
    gate.acquire();
    states.wait_for(|s| *s == SchedulerState::Leading).await.unwrap();
    wait_until_after(&store, &zone, frozen).await;

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let history = UsageRecorder::new(store.clone()).history(&zone, &site("s1")).await.unwrap();
    assert!(history.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
}

#[tokio::test]
async fn test_cancel_mid_tick_finishes_started_sites_and_skips_the_rest() {
    let (store, faults) = FaultyStore::new(MemoryStore::new());
    let zone = provision_zone(store.as_ref(), "z1", &["s1", "s2", "s3", "s4"], 1, 0).await;
    let held = faults.hold_record_insert(&site("s1"));
    let scheduler = Arc::new(scheduler_for(store.clone(), fast().with_max_concurrency(1)));

    let cancel = CancellationToken::new();
    let ts = now_minute();
    let tick = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run_tick(ts, &cancel).await }
    });

    held.reached().await;
    cancel.cancel();
    held.release();
    let report = tick.await.unwrap().unwrap();

    assert_eq!(report.sites, 4);
    assert_eq!(report.recorded, 1);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.failed, 0);

    let recorder = UsageRecorder::new(store.clone());
    assert_eq!(recorder.history(&zone, &site("s1")).await.unwrap().len(), 1);
    for name in ["s2", "s3", "s4"] {
        assert!(recorder.history(&zone, &site(name)).await.unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leadership_lost_mid_tick() {
    let (store, faults) = FaultyStore::new(MemoryStore::new());
    let zone = provision_zone(store.as_ref(), "z1", &["s1", "s2", "s3"], 1, 0).await;
    let held = faults.hold_record_insert(&site("s1"));
    let scheduler = Arc::new(scheduler_for(store.clone(), fast().with_max_concurrency(1)));
    let gate = Arc::new(LocalLeaderGate::new());
    let shutdown = CancellationToken::new();
    let mut states = scheduler.subscribe();

    let task = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let gate = Arc::clone(&gate);
        let shutdown = shutdown.clone();
        async move { scheduler.run(gate.as_ref(), shutdown).await }
    });

    gate.acquire();
    held.reached().await;
    gate.relinquish();
    // The term is cancelled while s1's insert is still parked.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.state(), SchedulerState::Leading);
    held.release();

    states.wait_for(|s| *s == SchedulerState::Idle).await.unwrap();
    let recorder = UsageRecorder::new(store.clone());
    let first = recorder.history(&zone, &site("s1")).await.unwrap();
    assert_eq!(first.len(), 1);
    for name in ["s2", "s3"] {
        assert!(recorder.history(&zone, &site(name)).await.unwrap().is_empty());
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        recorder.latest_timestamp([&zone]).await.unwrap(),
        Some(first[0].timestamp),
        "a tick ran after leadership was lost"
    );

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_clock_resumes_after_future_history() {
    let store = Arc::new(MemoryStore::new());
    let zone = provision_zone(store.as_ref(), "z1", &["s1"], 1, 0).await;
    let ahead = now_minute() + TimeDelta::days(1);
    UsageRecorder::new(store.clone())
        .append_record(&zone, &site("s1"), ahead, 0)
        .await
        .unwrap();

    let scheduler = Arc::new(scheduler_for(store.clone(), fast()));
    let cancel = CancellationToken::new();
    let lead = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.lead(cancel).await }
    });

    wait_until_after(&store, &zone, Some(ahead)).await;
    cancel.cancel();
    lead.await.unwrap();

    let history = UsageRecorder::new(store.clone()).history(&zone, &site("s1")).await.unwrap();
    assert_eq!(history[0].timestamp, ahead);
    assert_eq!(history[1].timestamp, ahead + TimeDelta::minutes(1));
}

#[tokio::test]
async fn test_second_run_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_for(store, fast());
    let gate = LocalLeaderGate::new();
    let shutdown = CancellationToken::new();

    let first = scheduler.run(&gate, shutdown.clone());
    tokio::pin!(first);
    tokio::select! {
        biased;
        _ = &mut first => panic!("idle run loop returned early"),
        _ = tokio::task::yield_now() => {}
    }

    assert!(matches!(
        scheduler.run(&gate, shutdown.clone()).await,
        Err(LeaseError::AlreadyRunning)
    ));

    shutdown.cancel();
    first.await.unwrap();
}

#[tokio::test]
async fn test_run_can_restart_after_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_for(store, fast());
    let gate = LocalLeaderGate::new();

    for _ in 0..2 {
        let shutdown = CancellationToken::new();
        let run = scheduler.run(&gate, shutdown.clone());
        tokio::pin!(run);
        tokio::select! {
            biased;
            _ = &mut run => panic!("idle run loop returned early"),
            _ = tokio::task::yield_now() => {}
        }
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        shutdown.cancel();
        run.await.unwrap();
    }
}
