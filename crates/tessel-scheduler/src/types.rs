use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::TaskType;
use crate::router;
use crate::time::TimeSlice;
use crate::trigger::Trigger;

/// One unit of scheduled work, stored under `(task_type, time_slice, segment)`.
///
/// Tasks are never mutated in place: rescheduling writes a new row at a
/// later slice and deletes the old segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Name of the registered task type.
    pub task_type: String,
    /// Routing / ownership key, e.g. a tenant id.
    pub target: String,
    /// Free-form inputs for the factory (metric ids, tags, ...).
    pub sources: BTreeSet<String>,
    /// Recurrence interval; zero means the task fires once.
    pub interval: Duration,
    /// Width of the data window the task covers.
    pub window: Duration,
    /// `hash(target) mod segment_count` of the task type.
    pub segment: u32,
}

impl Task {
    pub fn new(
        task_type: &TaskType,
        target: impl Into<String>,
        sources: BTreeSet<String>,
        interval: Duration,
        window: Duration,
    ) -> Self {
        let target = target.into();
        let segment = router::segment(&target, task_type.segment_count());
        Self {
            task_type: task_type.name().to_string(),
            target,
            sources,
            interval,
            window,
            segment,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Slice this task moves to after executing in `current`.
    pub fn next_time_slice(&self, current: TimeSlice) -> Option<TimeSlice> {
        if !self.is_recurring() {
            return None;
        }
        Trigger::repeating(self.interval).next_slice(current)
    }

    pub fn interval_minutes(&self) -> i64 {
        (self.interval.as_secs() / 60) as i64
    }

    pub fn window_minutes(&self) -> i64 {
        (self.window.as_secs() / 60) as i64
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task[{} target={} segment={}]",
            self.task_type, self.target, self.segment
        )
    }
}

/// Who holds a lease. Set exactly once, by a conditional acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "owner", rename_all = "snake_case")]
pub enum Ownership {
    Unowned,
    Owned(String),
}

/// Exclusive execution rights over one segment-offset group of one task type
/// for one time slice.
///
/// In-memory leases are snapshots of store rows; re-query the store instead
/// of trusting them across discovery passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub time_slice: TimeSlice,
    pub task_type: String,
    pub segment_offset: u32,
    pub ownership: Ownership,
    pub finished: bool,
}

/// Identity of a lease row, independent of its ownership state.
pub type LeaseKey = (TimeSlice, String, u32);

impl Lease {
    /// A fresh, unowned and unfinished lease.
    pub fn new(time_slice: TimeSlice, task_type: impl Into<String>, segment_offset: u32) -> Self {
        Self {
            time_slice,
            task_type: task_type.into(),
            segment_offset,
            ownership: Ownership::Unowned,
            finished: false,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match &self.ownership {
            Ownership::Unowned => None,
            Ownership::Owned(owner) => Some(owner),
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner() == Some(owner)
    }

    pub fn key(&self) -> LeaseKey {
        (self.time_slice, self.task_type.clone(), self.segment_offset)
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lease[{} {}/{} owner={} finished={}]",
            self.time_slice,
            self.task_type,
            self.segment_offset,
            self.owner().unwrap_or("-"),
            self.finished
        )
    }
}

/// Outcome of running one task's factory.
#[derive(Debug, Clone)]
pub struct ExecutedTask {
    pub task: Task,
    pub succeeded: bool,
}

/// Everything executed while draining one segment at one time slice.
/// Lives only until the tasks are rescheduled.
#[derive(Debug, Clone)]
pub struct ExecutionResults {
    pub time_slice: TimeSlice,
    pub task_type: String,
    pub segment: u32,
    pub executed: Vec<ExecutedTask>,
}

impl ExecutionResults {
    pub fn new(time_slice: TimeSlice, task_type: impl Into<String>, segment: u32) -> Self {
        Self {
            time_slice,
            task_type: task_type.into(),
            segment,
            executed: Vec::new(),
        }
    }

    pub fn add(&mut self, task: Task, succeeded: bool) {
        self.executed.push(ExecutedTask { task, succeeded });
    }

    pub fn failed(&self) -> usize {
        self.executed.iter().filter(|t| !t.succeeded).count()
    }
}

/// Summary of one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Leases this node processed and marked finished.
    pub leases_finished: usize,
    pub tasks_executed: usize,
    pub tasks_failed: usize,
    /// Shutdown cut the drain short; the lease partition was kept.
    pub interrupted: bool,
}

impl DrainReport {
    pub(crate) fn absorb(&mut self, other: &DrainReport) {
        self.leases_finished += other.leases_finished;
        self.tasks_executed += other.tasks_executed;
        self.tasks_failed += other.tasks_failed;
        self.interrupted |= other.interrupted;
    }
}
