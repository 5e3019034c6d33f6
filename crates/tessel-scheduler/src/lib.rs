//! `tessel-scheduler`: distributed, time-sliced task scheduling over a
//! shared lease store.
//!
//! # Overview
//!
//! Recurring work is stored as [`Task`] rows keyed by
//! `(task type, time slice, segment)`. Every time slice has at most
//! `segment_offset_count` [`Lease`]s per task type, each guarding a
//! contiguous group of segments. Nodes race to [`acquire`](LeaseStore::acquire)
//! leases; whoever wins runs the group's tasks, reschedules them one interval
//! later and marks the lease finished.
//!
//! ```text
//! ticker ──slice──▶ lane ──drain(slice)──▶ Executor
//!                                          │ per task type, in order
//!                                          ├─ find unfinished leases
//!                                          ├─ acquire (permit-bounded)
//!                                          └─ run tasks, reschedule, finish
//! ```
//!
//! | Module       | Role |
//! |--------------|------|
//! | [`time`]     | `TimeSlice` truncation and the injectable `Clock` |
//! | [`router`]   | target → segment → segment offset |
//! | [`trigger`]  | first / next firing of a task |
//! | [`registry`] | task types and their factories |
//! | [`store`]    | `LeaseStore` / `TaskStore` plus memory and SQLite backends |
//! | [`executor`] | the drain algorithm |
//! | [`engine`]   | `TaskScheduler`: registration, scheduling, ticker lifecycle |

pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
pub mod router;
pub mod store;
pub mod time;
pub mod trigger;
pub mod types;

pub use engine::TaskScheduler;
pub use error::{Result, SchedulerError, StoreError, StoreResult};
pub use executor::Executor;
pub use registry::{TaskFactory, TaskType, TaskTypeRegistry};
pub use store::{LeaseStore, MemoryStore, SqliteStore, TaskStore};
pub use time::{Clock, FixedClock, SystemClock, TimeSlice};
pub use trigger::Trigger;
pub use types::{DrainReport, ExecutedTask, ExecutionResults, Lease, LeaseKey, Ownership, Task};
