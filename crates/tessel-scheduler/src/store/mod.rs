//! Persistence seams for leases and tasks.
//!
//! The executor only talks to these traits. Two backends ship with the crate:
//! [`MemoryStore`] for tests and single-process use, and [`SqliteStore`] for
//! nodes sharing one database file.
//!
//! # Coordination contract
//!
//! Mutual exclusion rests entirely on [`LeaseStore::acquire`]: it must be a
//! single conditional write that succeeds for at most one caller per lease,
//! and only while the lease is still unowned. Ownership is never cleared.
//!
//! Leases carry no expiry. A node that dies while holding a lease leaves the
//! group unfinished until that same owner name comes back and resumes it,
//! which in turn keeps the slice from ever completing on other nodes.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::time::TimeSlice;
use crate::types::{Lease, Task};

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert an unowned, unfinished lease. Inserting a lease that already
    /// exists leaves the stored row untouched.
    async fn create_lease(&self, lease: &Lease) -> StoreResult<()>;

    /// Every lease of `time_slice` not yet marked finished, all task types.
    async fn find_unfinished_leases(&self, time_slice: TimeSlice) -> StoreResult<Vec<Lease>>;

    /// Claim `lease` for `owner`. Returns `true` only if the stored row was
    /// unowned and is now owned by `owner`.
    async fn acquire(&self, lease: &Lease, owner: &str) -> StoreResult<bool>;

    /// Mark `lease` finished. Returns `false` when the row is missing, is
    /// not owned by `owner` or was already finished.
    async fn finish(&self, lease: &Lease, owner: &str) -> StoreResult<bool>;

    /// Remove every lease row of `time_slice`.
    async fn delete_lease_partition(&self, time_slice: TimeSlice) -> StoreResult<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks stored under one partition, in insertion order.
    async fn find_tasks(
        &self,
        task_type: &str,
        time_slice: TimeSlice,
        segment: u32,
    ) -> StoreResult<Vec<Task>>;

    /// Store `task` under `(task.task_type, time_slice, task.segment)`.
    /// Inserting the same target twice into a partition keeps one row.
    async fn insert_task(&self, time_slice: TimeSlice, task: &Task) -> StoreResult<()>;

    /// Remove one partition after all of its tasks were rescheduled.
    async fn delete_task_segment(
        &self,
        task_type: &str,
        time_slice: TimeSlice,
        segment: u32,
    ) -> StoreResult<()>;
}
