use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, SchedulerError};
use crate::router;
use crate::types::Task;

/// Caller-supplied executable for one task type.
///
/// Factories must be idempotent: a task may run more than once for the same
/// slice when a node fails between executing it and finishing its lease.
/// An `Err` (or a panic) is recorded as a failed execution; the task is
/// rescheduled either way.
#[async_trait]
pub trait TaskFactory: Send + Sync {
    async fn run(&self, task: Task) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskFactory for F
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, task: Task) -> anyhow::Result<()> {
        (self)(task).await
    }
}

/// Immutable descriptor of a kind of recurring work.
#[derive(Clone)]
pub struct TaskType {
    name: String,
    segment_count: u32,
    segment_offset_count: u32,
    factory: Arc<dyn TaskFactory>,
}

impl TaskType {
    /// Build a descriptor, rejecting segment arithmetic that does not divide
    /// evenly.
    pub fn new(
        name: impl Into<String>,
        segment_count: u32,
        segment_offset_count: u32,
        factory: Arc<dyn TaskFactory>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SchedulerError::Config(
                "task type name must not be empty".to_string(),
            ));
        }
        router::validate(segment_count, segment_offset_count)
            .map_err(|e| SchedulerError::Config(format!("task type {name}: {e}")))?;
        Ok(Self {
            name,
            segment_count,
            segment_offset_count,
            factory,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    pub fn segment_offset_count(&self) -> u32 {
        self.segment_offset_count
    }

    pub fn factory(&self) -> &Arc<dyn TaskFactory> {
        &self.factory
    }

    /// Lease group of `segment`.
    pub fn segment_offset(&self, segment: u32) -> u32 {
        router::segment_offset(segment, self.segment_count, self.segment_offset_count)
    }

    /// Segments guarded by the lease at `offset`.
    pub fn segments_in_group(&self, offset: u32) -> Range<u32> {
        router::segments_in_group(offset, self.segment_count, self.segment_offset_count)
    }
}

impl fmt::Debug for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskType")
            .field("name", &self.name)
            .field("segment_count", &self.segment_count)
            .field("segment_offset_count", &self.segment_offset_count)
            .finish_non_exhaustive()
    }
}

/// Task types in registration order.
///
/// Built during initialization (mutable), shared read-only once the
/// scheduler starts. Order matters: the executor drains types one after the
/// other in exactly this order.
#[derive(Debug, Default)]
pub struct TaskTypeRegistry {
    types: Vec<Arc<TaskType>>,
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self { types: Vec::new() }
    }

    pub fn register(&mut self, task_type: TaskType) -> Result<()> {
        if self.get(task_type.name()).is_some() {
            return Err(SchedulerError::Config(format!(
                "task type {} is already registered",
                task_type.name()
            )));
        }
        self.types.push(Arc::new(task_type));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskType>> {
        self.types.iter().find(|t| t.name() == name)
    }

    /// Like [`get`](Self::get) but an unknown name is an error.
    pub fn require(&self, name: &str) -> Result<&Arc<TaskType>> {
        self.get(name).ok_or_else(|| SchedulerError::UnknownTaskType {
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaskType>> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
