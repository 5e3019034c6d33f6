// Scheduler lifecycle: ticker, drain lane and shutdown.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use tessel_core::SchedulerConfig;
use tessel_scheduler::{FixedClock, SchedulerError, TaskScheduler, Trigger};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        owner: Some("node-a".to_string()),
        tick_interval_ms: 10,
        rediscovery_backoff_ms: 5,
        ..SchedulerConfig::default()
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn ticker_drains_due_slices() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(FixedClock::new(at(0, 0)));
    let probe = Probe::default();

    let mut scheduler = TaskScheduler::new(&config(), store.clone(), store.clone())
        .unwrap()
        .with_clock(clock.clone());
    scheduler
        .register_task_type("rollup", 4, 2, probe.factory())
        .unwrap();

    let first = scheduler
        .schedule_task(
            "rollup",
            "tenant-A",
            BTreeSet::new(),
            minutes(5),
            Trigger::repeating(minutes(5)).with_delay(minutes(5)),
        )
        .await
        .unwrap();
    assert_eq!(first, slice(0, 5));

    clock.set(at(0, 5));
    scheduler.start().unwrap();
    assert!(scheduler.is_running());

    wait_for(|| probe.calls() == 1).await;
    wait_for(|| {
        store
            .events()
            .iter()
            .any(|e| matches!(e, LeaseEvent::Finished { .. }))
    })
    .await;
    scheduler.shutdown().await;
    assert!(!scheduler.is_running());

    assert_eq!(store.inner.tasks("rollup", slice(0, 10)).await.len(), 1);
    assert!(store.inner.tasks("rollup", slice(0, 5)).await.is_empty());
}

#[tokio::test]
async fn ticker_does_not_skip_slices_when_the_clock_jumps() {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(FixedClock::new(at(0, 0)));
    let probe = Probe::default();
    let config = SchedulerConfig {
        time_slice_secs: 1,
        ..config()
    };

    let mut scheduler = TaskScheduler::new(&config, store.clone(), store.clone())
        .unwrap()
        .with_clock(clock.clone());
    scheduler
        .register_task_type("rollup", 4, 2, probe.factory())
        .unwrap();
    let due = scheduler
        .schedule_task(
            "rollup",
            "tenant-A",
            BTreeSet::new(),
            minutes(1),
            Trigger::one_shot(at(0, 0) + chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();
    assert_eq!(due.instant(), at(0, 0) + chrono::Duration::seconds(1));

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.calls(), 0);

    // every 10ms slice between the last tick and the new "now" is drained,
    // including the one holding the task
    clock.set(at(0, 0) + chrono::Duration::milliseconds(2_505));

    wait_for(|| probe.calls() == 1).await;
    scheduler.shutdown().await;
}

#[tokio::test]
async fn lifecycle_rules() {
    let store = Arc::new(RecordingStore::new());
    let mut scheduler = TaskScheduler::new(&config(), store.clone(), store).unwrap();
    scheduler
        .register_task_type("rollup", 4, 2, Probe::default().factory())
        .unwrap();

    // shutdown before start is a no-op
    scheduler.shutdown().await;
    assert!(!scheduler.is_running());

    let duplicate = scheduler.register_task_type("rollup", 8, 2, Probe::default().factory());
    assert!(matches!(duplicate, Err(SchedulerError::Config(_))));
    let uneven = scheduler.register_task_type("retention", 8, 3, Probe::default().factory());
    assert!(matches!(uneven, Err(SchedulerError::Config(_))));

    scheduler.start().unwrap();
    assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStarted)));

    scheduler.shutdown().await;
    scheduler.shutdown().await;
    assert!(!scheduler.is_running());

    let late = scheduler.register_task_type("retention", 4, 2, Probe::default().factory());
    assert!(matches!(late, Err(SchedulerError::AlreadyStarted)));
    assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStarted)));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let store = Arc::new(RecordingStore::new());
    let config = SchedulerConfig {
        permits: 0,
        ..config()
    };
    let result = TaskScheduler::new(&config, store.clone(), store.clone());
    assert!(matches!(result, Err(SchedulerError::Config(_))));

    // 7ms ticks never line up with most 1s task slices
    let uneven_tick = SchedulerConfig {
        time_slice_secs: 1,
        tick_interval_ms: 7,
        ..self::config()
    };
    let result = TaskScheduler::new(&uneven_tick, store.clone(), store);
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}
