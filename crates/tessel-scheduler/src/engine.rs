use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tessel_core::SchedulerConfig;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::executor::{schedule_at, Executor};
use crate::registry::{TaskFactory, TaskType, TaskTypeRegistry};
use crate::store::{LeaseStore, TaskStore};
use crate::time::{Clock, SystemClock, TimeSlice};
use crate::trigger::Trigger;
use crate::types::{DrainReport, Task};

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    ticker: JoinHandle<()>,
    lane: JoinHandle<()>,
}

/// Caller-facing scheduler: task type registration, task scheduling and the
/// ticker-driven drain loop.
///
/// Register every task type first, then share the scheduler (for example in
/// an `Arc`) and call [`start`](Self::start). Scheduling works before and
/// after `start`.
pub struct TaskScheduler {
    leases: Arc<dyn LeaseStore>,
    tasks: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    owner: String,
    time_slice: Duration,
    tick_interval: Duration,
    backoff: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl TaskScheduler {
    pub fn new(
        config: &SchedulerConfig,
        leases: Arc<dyn LeaseStore>,
        tasks: Arc<dyn TaskStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            leases,
            tasks,
            registry: Arc::new(TaskTypeRegistry::new()),
            clock: Arc::new(SystemClock),
            permits: Arc::new(Semaphore::new(config.permits)),
            owner: config.owner_name(),
            time_slice: config.time_slice(),
            tick_interval: config.tick_interval(),
            backoff: config.rediscovery_backoff(),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Replace the wall clock, e.g. with a [`FixedClock`](crate::FixedClock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Name this node writes into the leases it acquires.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn registry(&self) -> &TaskTypeRegistry {
        &self.registry
    }

    /// Register a task type. Only allowed before [`start`](Self::start);
    /// registration order is drain order.
    pub fn register_task_type(
        &mut self,
        name: &str,
        segment_count: u32,
        segment_offset_count: u32,
        factory: Arc<dyn TaskFactory>,
    ) -> Result<()> {
        if !matches!(*self.lifecycle.get_mut().unwrap_or_else(|p| p.into_inner()), Lifecycle::Idle) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let task_type = TaskType::new(name, segment_count, segment_offset_count, factory)?;
        let registry = Arc::get_mut(&mut self.registry).ok_or(SchedulerError::AlreadyStarted)?;
        registry.register(task_type)?;
        info!(task_type = name, segment_count, segment_offset_count, "task type registered");
        Ok(())
    }

    /// Store a task at the first slice its trigger fires in, together with
    /// the lease guarding its segment. Retrying the same call is harmless.
    ///
    /// Returns the slice the task was stored under.
    pub async fn schedule_task(
        &self,
        task_type: &str,
        target: &str,
        sources: BTreeSet<String>,
        window: Duration,
        trigger: Trigger,
    ) -> Result<TimeSlice> {
        let task_type = self.registry.require(task_type)?;
        trigger.validate().map_err(SchedulerError::Config)?;
        if window.as_secs() % 60 != 0 || window.subsec_nanos() != 0 {
            return Err(SchedulerError::Config(format!(
                "window {window:?} is not a whole number of minutes"
            )));
        }

        let time_slice = trigger.first_slice(self.clock.now(), self.time_slice);
        let task = Task::new(task_type, target, sources, trigger.interval(), window);
        schedule_at(
            self.leases.as_ref(),
            self.tasks.as_ref(),
            task_type,
            time_slice,
            &task,
        )
        .await?;

        info!(%task, %time_slice, "task scheduled");
        Ok(time_slice)
    }

    /// Drain one slice on the caller's task. Shares permits with the running
    /// scheduler but is not interrupted by [`shutdown`](Self::shutdown).
    pub async fn drain(&self, time_slice: TimeSlice) -> DrainReport {
        self.executor().drain(time_slice).await
    }

    /// Spawn the ticker and the sequential drain lane.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Idle => {}
            _ => return Err(SchedulerError::AlreadyStarted),
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (slice_tx, slice_rx) = mpsc::unbounded_channel();
        let executor = self.executor().with_shutdown(shutdown_rx.clone());

        let ticker = tokio::spawn(run_ticker(
            Arc::clone(&self.clock),
            self.tick_interval,
            slice_tx,
            shutdown_rx.clone(),
        ));
        let lane = tokio::spawn(run_lane(executor, slice_rx, shutdown_rx));

        *lifecycle = Lifecycle::Running(Running {
            shutdown_tx,
            ticker,
            lane,
        });
        info!(owner = %self.owner, task_types = self.registry.len(), "scheduler started");
        Ok(())
    }

    /// Stop the ticker, let in-flight lease processing finish and wait for
    /// both background tasks. Calling it again (or before `start`) is a no-op.
    pub async fn shutdown(&self) {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                previous => {
                    *lifecycle = previous;
                    return;
                }
            }
        };

        info!("scheduler shutting down");
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.ticker.await {
            error!(error = %e, "ticker task failed");
        }
        if let Err(e) = running.lane.await {
            error!(error = %e, "scheduler lane failed");
        }
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    fn executor(&self) -> Executor {
        Executor::new(
            Arc::clone(&self.leases),
            Arc::clone(&self.tasks),
            Arc::clone(&self.registry),
            Arc::clone(&self.permits),
            self.owner.clone(),
            self.backoff,
        )
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Emit the current tick slice every `tick`. Slices skipped because a tick
/// fired late are emitted too, oldest first, so no slice is ever passed over.
async fn run_ticker(
    clock: Arc<dyn Clock>,
    tick: Duration,
    slices: mpsc::UnboundedSender<TimeSlice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    let mut last: Option<TimeSlice> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let current = TimeSlice::of(clock.now(), tick);
                let mut next = match last {
                    Some(previous) if previous < current => previous.plus(tick),
                    Some(_) => continue,
                    None => current,
                };
                while next <= current {
                    if slices.send(next).is_err() {
                        return;
                    }
                    next = next.plus(tick);
                }
                last = Some(current);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("ticker stopped");
                    return;
                }
            }
        }
    }
}

/// Drain slices one at a time, in the order the ticker produced them.
async fn run_lane(
    executor: Executor,
    mut slices: mpsc::UnboundedReceiver<TimeSlice>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            slice = slices.recv() => {
                let Some(time_slice) = slice else { break };
                let report = executor.drain(time_slice).await;
                if report.interrupted {
                    warn!(%time_slice, "slice left unfinished at shutdown");
                    break;
                }
            }
        }
    }
    debug!("scheduler lane stopped");
}
