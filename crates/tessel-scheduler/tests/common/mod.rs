// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tessel_scheduler::{
    Executor, Lease, LeaseStore, MemoryStore, StoreError, StoreResult, Task, TaskFactory,
    TaskStore, TaskType, TaskTypeRegistry, TimeSlice,
};
use tokio::sync::Semaphore;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const BACKOFF: Duration = Duration::from_millis(5);

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

pub fn slice(hour: u32, minute: u32) -> TimeSlice {
    TimeSlice::of(at(hour, minute), MINUTE)
}

pub fn minutes(n: u64) -> Duration {
    MINUTE * n as u32
}

/// Factory that counts its invocations and records each target.
#[derive(Clone, Default)]
pub struct Probe {
    pub calls: Arc<AtomicUsize>,
    pub targets: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    pub fn factory(&self) -> Arc<dyn TaskFactory> {
        self.factory_with_delay(Duration::ZERO)
    }

    /// Like [`factory`](Self::factory) but every run sleeps `delay` first.
    pub fn factory_with_delay(&self, delay: Duration) -> Arc<dyn TaskFactory> {
        let probe = self.clone();
        Arc::new(move |task: Task| {
            let probe = probe.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                probe.calls.fetch_add(1, Ordering::SeqCst);
                probe.targets.lock().unwrap().push(task.target);
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

pub fn registry(types: Vec<TaskType>) -> Arc<TaskTypeRegistry> {
    let mut registry = TaskTypeRegistry::new();
    for task_type in types {
        registry.register(task_type).unwrap();
    }
    Arc::new(registry)
}

pub fn executor<S>(store: Arc<S>, registry: Arc<TaskTypeRegistry>, permits: usize, owner: &str) -> Executor
where
    S: LeaseStore + TaskStore + 'static,
{
    Executor::new(
        store.clone(),
        store,
        registry,
        Arc::new(Semaphore::new(permits)),
        owner,
        BACKOFF,
    )
}

/// Write `target` into `time_slice` with its lease, the way scheduling does.
pub async fn seed<S>(store: &S, task_type: &TaskType, time_slice: TimeSlice, target: &str, interval: Duration) -> Task
where
    S: LeaseStore + TaskStore,
{
    let task = Task::new(task_type, target, BTreeSet::new(), interval, interval);
    let lease = Lease::new(time_slice, task_type.name(), task_type.segment_offset(task.segment));
    store.create_lease(&lease).await.unwrap();
    store.insert_task(time_slice, &task).await.unwrap();
    task
}

/// One target per segment of `task_type`, found by probing `tenant-<n>`.
pub fn target_per_segment(task_type: &TaskType) -> Vec<String> {
    let mut found: Vec<Option<String>> = vec![None; task_type.segment_count() as usize];
    for n in 0.. {
        let target = format!("tenant-{n}");
        let segment = tessel_scheduler::router::segment(&target, task_type.segment_count());
        let slot = &mut found[segment as usize];
        if slot.is_none() {
            *slot = Some(target);
        }
        if found.iter().all(Option::is_some) {
            break;
        }
    }
    found.into_iter().flatten().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Acquired { task_type: String, segment_offset: u32 },
    Finished { task_type: String, segment_offset: u32 },
}

/// Wraps a [`MemoryStore`], recording lease transitions, tracking how many
/// leases are owned but not finished, and failing selected calls on demand.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    events: Mutex<Vec<LeaseEvent>>,
    open: AtomicUsize,
    peak: AtomicUsize,
    pub failing_finds: AtomicUsize,
    pub failing_acquires: AtomicUsize,
    pub failing_finishes: AtomicUsize,
    pub failing_task_reads: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LeaseEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Highest number of simultaneously owned, unfinished leases seen.
    pub fn peak_open(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn fail_next(counter: &AtomicUsize, n: usize) {
        counter.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> StoreResult<()> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl LeaseStore for RecordingStore {
    async fn create_lease(&self, lease: &Lease) -> StoreResult<()> {
        self.inner.create_lease(lease).await
    }

    async fn find_unfinished_leases(&self, time_slice: TimeSlice) -> StoreResult<Vec<Lease>> {
        take_failure(&self.failing_finds)?;
        self.inner.find_unfinished_leases(time_slice).await
    }

    async fn acquire(&self, lease: &Lease, owner: &str) -> StoreResult<bool> {
        take_failure(&self.failing_acquires)?;
        let acquired = self.inner.acquire(lease, owner).await?;
        if acquired {
            let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(open, Ordering::SeqCst);
            self.events.lock().unwrap().push(LeaseEvent::Acquired {
                task_type: lease.task_type.clone(),
                segment_offset: lease.segment_offset,
            });
        }
        Ok(acquired)
    }

    async fn finish(&self, lease: &Lease, owner: &str) -> StoreResult<bool> {
        take_failure(&self.failing_finishes)?;
        let finished = self.inner.finish(lease, owner).await?;
        if finished {
            self.open.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(LeaseEvent::Finished {
                task_type: lease.task_type.clone(),
                segment_offset: lease.segment_offset,
            });
        }
        Ok(finished)
    }

    async fn delete_lease_partition(&self, time_slice: TimeSlice) -> StoreResult<()> {
        self.inner.delete_lease_partition(time_slice).await
    }
}

#[async_trait]
impl TaskStore for RecordingStore {
    async fn find_tasks(&self, task_type: &str, time_slice: TimeSlice, segment: u32) -> StoreResult<Vec<Task>> {
        take_failure(&self.failing_task_reads)?;
        self.inner.find_tasks(task_type, time_slice, segment).await
    }

    async fn insert_task(&self, time_slice: TimeSlice, task: &Task) -> StoreResult<()> {
        self.inner.insert_task(time_slice, task).await
    }

    async fn delete_task_segment(&self, task_type: &str, time_slice: TimeSlice, segment: u32) -> StoreResult<()> {
        self.inner.delete_task_segment(task_type, time_slice, segment).await
    }
}
