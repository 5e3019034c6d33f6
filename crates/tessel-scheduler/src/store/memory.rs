//! In-memory lease and task store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{LeaseStore, TaskStore};
use crate::error::StoreResult;
use crate::time::TimeSlice;
use crate::types::{Lease, LeaseKey, Ownership, Task};

type PartitionKey = (String, TimeSlice, u32);

#[derive(Default)]
struct MemoryState {
    leases: BTreeMap<LeaseKey, Lease>,
    /// Partition -> tasks in insertion order.
    tasks: HashMap<PartitionKey, Vec<Task>>,
}

/// Both stores behind one async mutex.
///
/// Every operation runs under the lock, so `acquire` is trivially a
/// compare-and-set. Clone the `Arc` around it to share one instance between
/// several executors in a test.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every lease of `time_slice`, finished or not.
    pub async fn leases(&self, time_slice: TimeSlice) -> Vec<Lease> {
        let state = self.state.lock().await;
        state
            .leases
            .values()
            .filter(|l| l.time_slice == time_slice)
            .cloned()
            .collect()
    }

    /// Every task of `task_type` stored at `time_slice`, ordered by segment.
    pub async fn tasks(&self, task_type: &str, time_slice: TimeSlice) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut partitions: Vec<(&PartitionKey, &Vec<Task>)> = state
            .tasks
            .iter()
            .filter(|((t, ts, _), _)| t == task_type && *ts == time_slice)
            .collect();
        partitions.sort_by_key(|((_, _, segment), _)| *segment);
        partitions
            .into_iter()
            .flat_map(|(_, tasks)| tasks.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn create_lease(&self, lease: &Lease) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .leases
            .entry(lease.key())
            .or_insert_with(|| Lease::new(lease.time_slice, lease.task_type.clone(), lease.segment_offset));
        Ok(())
    }

    async fn find_unfinished_leases(&self, time_slice: TimeSlice) -> StoreResult<Vec<Lease>> {
        let state = self.state.lock().await;
        Ok(state
            .leases
            .values()
            .filter(|l| l.time_slice == time_slice && !l.finished)
            .cloned()
            .collect())
    }

    async fn acquire(&self, lease: &Lease, owner: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&lease.key()) {
            Some(stored) if stored.ownership == Ownership::Unowned => {
                stored.ownership = Ownership::Owned(owner.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, lease: &Lease, owner: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&lease.key()) {
            Some(stored) if stored.is_owned_by(owner) && !stored.finished => {
                stored.finished = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lease_partition(&self, time_slice: TimeSlice) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.leases.retain(|(ts, _, _), _| *ts != time_slice);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn find_tasks(
        &self,
        task_type: &str,
        time_slice: TimeSlice,
        segment: u32,
    ) -> StoreResult<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .get(&(task_type.to_string(), time_slice, segment))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_task(&self, time_slice: TimeSlice, task: &Task) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let partition = state
            .tasks
            .entry((task.task_type.clone(), time_slice, task.segment))
            .or_default();
        match partition.iter_mut().find(|t| t.target == task.target) {
            Some(existing) => *existing = task.clone(),
            None => partition.push(task.clone()),
        }
        Ok(())
    }

    async fn delete_task_segment(
        &self,
        task_type: &str,
        time_slice: TimeSlice,
        segment: u32,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .tasks
            .remove(&(task_type.to_string(), time_slice, segment));
        Ok(())
    }
}
