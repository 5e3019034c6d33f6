//! Lease discovery and segment execution for one time slice.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::registry::{TaskFactory, TaskType, TaskTypeRegistry};
use crate::store::{LeaseStore, TaskStore};
use crate::time::TimeSlice;
use crate::types::{DrainReport, ExecutionResults, Lease, Task};

/// Drains time slices: discovers leases, competes for them, and runs the
/// tasks of every lease it wins.
///
/// Cheap to clone; clones share stores, registry and permits.
#[derive(Clone)]
pub struct Executor {
    leases: Arc<dyn LeaseStore>,
    tasks: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    permits: Arc<Semaphore>,
    owner: Arc<str>,
    backoff: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

/// Result of processing one acquired lease.
struct GroupOutcome {
    segment_offset: u32,
    report: DrainReport,
}

impl Executor {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        tasks: Arc<dyn TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        permits: Arc<Semaphore>,
        owner: impl Into<String>,
        backoff: Duration,
    ) -> Self {
        Self {
            leases,
            tasks,
            registry,
            permits,
            owner: Arc::from(owner.into()),
            backoff,
            shutdown: None,
        }
    }

    /// Let `shutdown` interrupt permit waits and rediscovery pauses.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Process every lease of `time_slice`, one task type after the other in
    /// registration order, then delete the slice's lease partition.
    ///
    /// Store errors never abort the drain; the affected leases are retried on
    /// the next discovery pass. Only shutdown ends a drain early, and then
    /// the partition is kept so the remaining leases stay discoverable.
    pub async fn drain(&self, time_slice: TimeSlice) -> DrainReport {
        debug!(%time_slice, owner = %self.owner, "draining time slice");
        let mut report = DrainReport::default();

        for task_type in self.registry.iter() {
            let type_report = self.drain_type(time_slice, task_type).await;
            report.absorb(&type_report);
            if type_report.interrupted {
                break;
            }
        }

        if report.interrupted {
            warn!(%time_slice, "drain interrupted by shutdown, keeping lease partition");
            return report;
        }

        if let Err(e) = self.leases.delete_lease_partition(time_slice).await {
            warn!(%time_slice, error = %e, "failed to delete lease partition");
        }
        if report.leases_finished > 0 {
            info!(
                %time_slice,
                leases = report.leases_finished,
                tasks = report.tasks_executed,
                failed = report.tasks_failed,
                "time slice drained"
            );
        }
        report
    }

    /// Run discovery passes for one task type until none of its leases is
    /// left unfinished.
    async fn drain_type(&self, time_slice: TimeSlice, task_type: &Arc<TaskType>) -> DrainReport {
        let mut report = DrainReport::default();
        let mut groups: JoinSet<GroupOutcome> = JoinSet::new();
        let mut in_flight: HashSet<u32> = HashSet::new();

        loop {
            while let Some(joined) = groups.try_join_next() {
                collect(joined, &mut in_flight, &mut report);
            }

            let leases: Vec<Lease> = match self.leases.find_unfinished_leases(time_slice).await {
                Ok(all) => all
                    .into_iter()
                    .filter(|l| l.task_type == task_type.name())
                    .collect(),
                Err(e) => {
                    warn!(%time_slice, task_type = task_type.name(), error = %e, "failed to load leases");
                    if !self.pause().await {
                        report.interrupted = true;
                        break;
                    }
                    continue;
                }
            };
            if leases.is_empty() {
                break;
            }

            let mut acquisitions = Vec::new();
            for lease in leases {
                let resume = match lease.owner() {
                    None => false,
                    Some(owner) if owner == &*self.owner => {
                        if in_flight.contains(&lease.segment_offset) {
                            continue;
                        }
                        true
                    }
                    Some(owner) => {
                        debug!(%lease, %owner, "lease held by another node");
                        continue;
                    }
                };

                let Some(permit) = self.acquire_permit().await else {
                    report.interrupted = true;
                    break;
                };

                if resume {
                    debug!(%lease, "resuming own unfinished lease");
                    self.spawn_group(&mut groups, &mut in_flight, time_slice, task_type, lease, permit);
                    continue;
                }

                let store = Arc::clone(&self.leases);
                let owner = Arc::clone(&self.owner);
                acquisitions.push(tokio::spawn(async move {
                    let acquired = store.acquire(&lease, &owner).await;
                    (lease, permit, acquired)
                }));
            }

            // every acquisition of this pass reports before rediscovery
            for attempt in join_all(acquisitions).await {
                let (lease, permit, acquired) = match attempt {
                    Ok(attempt) => attempt,
                    Err(e) => {
                        warn!(error = %e, "lease acquisition task failed");
                        continue;
                    }
                };
                match acquired {
                    Ok(true) => {
                        debug!(%lease, "lease acquired");
                        self.spawn_group(&mut groups, &mut in_flight, time_slice, task_type, lease, permit);
                    }
                    Ok(false) => debug!(%lease, "lost lease race"),
                    Err(e) => warn!(%lease, error = %e, "failed to acquire lease"),
                }
            }

            if report.interrupted || !self.pause().await {
                report.interrupted = true;
                break;
            }
        }

        while let Some(joined) = groups.join_next().await {
            collect(joined, &mut in_flight, &mut report);
        }
        report
    }

    fn spawn_group(
        &self,
        groups: &mut JoinSet<GroupOutcome>,
        in_flight: &mut HashSet<u32>,
        time_slice: TimeSlice,
        task_type: &Arc<TaskType>,
        lease: Lease,
        permit: OwnedSemaphorePermit,
    ) {
        let segment_offset = lease.segment_offset;
        in_flight.insert(segment_offset);
        let work = self
            .clone()
            .process_group(time_slice, Arc::clone(task_type), lease, permit);
        groups.spawn(async move {
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(segment_offset, "lease processing panicked");
                    GroupOutcome {
                        segment_offset,
                        report: DrainReport::default(),
                    }
                }
            }
        });
    }

    /// Execute and reschedule every segment guarded by `lease`, then mark it
    /// finished. The permit is held until the lease is finished or abandoned.
    async fn process_group(
        self,
        time_slice: TimeSlice,
        task_type: Arc<TaskType>,
        lease: Lease,
        permit: OwnedSemaphorePermit,
    ) -> GroupOutcome {
        let _permit = permit;
        let mut report = DrainReport::default();
        let segment_offset = lease.segment_offset;

        for segment in task_type.segments_in_group(segment_offset) {
            match self.process_segment(time_slice, &task_type, segment).await {
                Ok(results) => {
                    report.tasks_executed += results.executed.len();
                    report.tasks_failed += results.failed();
                }
                Err(e) => {
                    // leave the lease unfinished; the next pass resumes it
                    warn!(%lease, segment, error = %e, "segment processing failed");
                    return GroupOutcome {
                        segment_offset,
                        report,
                    };
                }
            }
        }

        match self.leases.finish(&lease, &self.owner).await {
            Ok(true) => {
                debug!(%lease, "lease finished");
                report.leases_finished += 1;
            }
            Ok(false) => warn!(%lease, "lease no longer owned by this node"),
            Err(e) => warn!(%lease, error = %e, "failed to finish lease"),
        }
        GroupOutcome {
            segment_offset,
            report,
        }
    }

    async fn process_segment(
        &self,
        time_slice: TimeSlice,
        task_type: &TaskType,
        segment: u32,
    ) -> StoreResult<ExecutionResults> {
        let mut results = ExecutionResults::new(time_slice, task_type.name(), segment);
        let tasks = self
            .tasks
            .find_tasks(task_type.name(), time_slice, segment)
            .await?;
        if tasks.is_empty() {
            return Ok(results);
        }

        for task in tasks {
            let succeeded = run_task(task_type.factory().as_ref(), task.clone()).await;
            results.add(task, succeeded);
        }

        for executed in &results.executed {
            if let Some(next) = executed.task.next_time_slice(time_slice) {
                schedule_at(
                    self.leases.as_ref(),
                    self.tasks.as_ref(),
                    task_type,
                    next,
                    &executed.task,
                )
                .await?;
            }
        }
        self.tasks
            .delete_task_segment(task_type.name(), time_slice, segment)
            .await?;

        debug!(
            %time_slice,
            task_type = task_type.name(),
            segment,
            executed = results.executed.len(),
            failed = results.failed(),
            "segment processed"
        );
        Ok(results)
    }

    /// Wait for a permit. `None` when shutdown interrupts the wait.
    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        match self.shutdown.clone() {
            None => acquire.await.ok(),
            Some(mut rx) => {
                if *rx.borrow() {
                    return None;
                }
                tokio::select! {
                    permit = acquire => permit.ok(),
                    _ = wait_for_shutdown(&mut rx) => None,
                }
            }
        }
    }

    /// Sleep for the rediscovery backoff. `false` when shutdown was signalled.
    async fn pause(&self) -> bool {
        match self.shutdown.clone() {
            None => {
                tokio::time::sleep(self.backoff).await;
                true
            }
            Some(mut rx) => {
                if *rx.borrow() {
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => true,
                    _ = wait_for_shutdown(&mut rx) => false,
                }
            }
        }
    }
}

/// Write `task` into `time_slice` together with the lease guarding its
/// segment. The lease goes first so a task row is never left without one.
pub(crate) async fn schedule_at(
    leases: &dyn LeaseStore,
    tasks: &dyn TaskStore,
    task_type: &TaskType,
    time_slice: TimeSlice,
    task: &Task,
) -> StoreResult<()> {
    let lease = Lease::new(
        time_slice,
        task_type.name(),
        task_type.segment_offset(task.segment),
    );
    leases.create_lease(&lease).await?;
    tasks.insert_task(time_slice, task).await
}

async fn run_task(factory: &dyn TaskFactory, task: Task) -> bool {
    let target = task.target.clone();
    match AssertUnwindSafe(factory.run(task)).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(%target, error = %e, "task failed");
            false
        }
        Err(_) => {
            warn!(%target, "task panicked");
            false
        }
    }
}

/// Resolves once `rx` reads `true`. Never resolves if the sender is dropped
/// without signalling.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn collect(
    joined: Result<GroupOutcome, tokio::task::JoinError>,
    in_flight: &mut HashSet<u32>,
    report: &mut DrainReport,
) {
    match joined {
        Ok(outcome) => {
            in_flight.remove(&outcome.segment_offset);
            report.absorb(&outcome.report);
        }
        Err(e) => warn!(error = %e, "lease processing task failed"),
    }
}
