//! SQLite-backed lease and task store.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::{debug, instrument};

use super::{LeaseStore, TaskStore};
use crate::db::init_db;
use crate::error::{StoreError, StoreResult};
use crate::time::TimeSlice;
use crate::types::{Lease, Ownership, Task};

/// Lease and task persistence on one SQLite connection.
///
/// Several nodes (or several `SqliteStore`s in one process) may open the same
/// database file; the conditional `UPDATE` in [`LeaseStore::acquire`] is what
/// keeps them from processing the same group twice. Every call runs on the
/// blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Wrap an already-open connection and initialise the schema.
    pub fn new(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record that the one-time setup step `key` is done. Returns `true` only
    /// for the single caller that inserted the marker, across every node
    /// sharing the database.
    #[instrument(skip(self))]
    pub async fn claim_bootstrap(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO bootstrap (key, claimed_at) VALUES (?1, ?2)",
                params![key, chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Drop the marker of `key` so a later boot retries the step.
    #[instrument(skip(self))]
    pub async fn release_bootstrap(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM bootstrap WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    #[instrument(skip(self), fields(lease = %lease))]
    async fn create_lease(&self, lease: &Lease) -> StoreResult<()> {
        let lease = lease.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO leases (time_slice, task_type, segment_offset, owner, finished)
                 VALUES (?1, ?2, ?3, NULL, 0)",
                params![
                    lease.time_slice.as_millis(),
                    lease.task_type,
                    i64::from(lease.segment_offset)
                ],
            )?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(time_slice = %time_slice))]
    async fn find_unfinished_leases(&self, time_slice: TimeSlice) -> StoreResult<Vec<Lease>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT time_slice, task_type, segment_offset, owner, finished
                 FROM leases
                 WHERE time_slice = ?1 AND finished = 0
                 ORDER BY task_type, segment_offset",
            )?;
            let rows = stmt.query_map(params![time_slice.as_millis()], |row| {
                Ok(LeaseRow {
                    time_slice: row.get(0)?,
                    task_type: row.get(1)?,
                    segment_offset: row.get(2)?,
                    owner: row.get(3)?,
                    finished: row.get(4)?,
                })
            })?;
            let mut leases = Vec::new();
            for row in rows {
                leases.push(row?.into_lease()?);
            }
            debug!(count = leases.len(), "unfinished leases");
            Ok(leases)
        })
        .await
    }

    #[instrument(skip(self), fields(lease = %lease))]
    async fn acquire(&self, lease: &Lease, owner: &str) -> StoreResult<bool> {
        let lease = lease.clone();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE leases SET owner = ?1
                 WHERE time_slice = ?2 AND task_type = ?3 AND segment_offset = ?4
                   AND owner IS NULL",
                params![
                    owner,
                    lease.time_slice.as_millis(),
                    lease.task_type,
                    i64::from(lease.segment_offset)
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    #[instrument(skip(self), fields(lease = %lease))]
    async fn finish(&self, lease: &Lease, owner: &str) -> StoreResult<bool> {
        let lease = lease.clone();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE leases SET finished = 1
                 WHERE time_slice = ?1 AND task_type = ?2 AND segment_offset = ?3
                   AND owner = ?4 AND finished = 0",
                params![
                    lease.time_slice.as_millis(),
                    lease.task_type,
                    i64::from(lease.segment_offset),
                    owner
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    #[instrument(skip(self), fields(time_slice = %time_slice))]
    async fn delete_lease_partition(&self, time_slice: TimeSlice) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM leases WHERE time_slice = ?1",
                params![time_slice.as_millis()],
            )?;
            debug!(removed, "lease partition deleted");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    #[instrument(skip(self), fields(time_slice = %time_slice))]
    async fn find_tasks(
        &self,
        task_type: &str,
        time_slice: TimeSlice,
        segment: u32,
    ) -> StoreResult<Vec<Task>> {
        let task_type = task_type.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_type, segment, target, sources, interval_minutes, window_minutes
                 FROM tasks
                 WHERE task_type = ?1 AND time_slice = ?2 AND segment = ?3
                 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(
                params![task_type, time_slice.as_millis(), i64::from(segment)],
                |row| {
                    Ok(TaskRow {
                        task_type: row.get(0)?,
                        segment: row.get(1)?,
                        target: row.get(2)?,
                        sources: row.get(3)?,
                        interval_minutes: row.get(4)?,
                        window_minutes: row.get(5)?,
                    })
                },
            )?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?.into_task()?);
            }
            Ok(tasks)
        })
        .await
    }

    #[instrument(skip(self, task), fields(time_slice = %time_slice, task = %task))]
    async fn insert_task(&self, time_slice: TimeSlice, task: &Task) -> StoreResult<()> {
        let sources = serde_json::to_string(&task.sources)?;
        let task = task.clone();
        self.with_conn(move |conn| {
            // upsert rather than REPLACE so the row keeps its rowid, and with
            // it its place in the partition's order
            conn.execute(
                "INSERT INTO tasks
                 (task_type, time_slice, segment, target, sources, interval_minutes, window_minutes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (task_type, time_slice, segment, target) DO UPDATE SET
                     sources = excluded.sources,
                     interval_minutes = excluded.interval_minutes,
                     window_minutes = excluded.window_minutes",
                params![
                    task.task_type,
                    time_slice.as_millis(),
                    i64::from(task.segment),
                    task.target,
                    sources,
                    task.interval_minutes(),
                    task.window_minutes()
                ],
            )?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(time_slice = %time_slice))]
    async fn delete_task_segment(
        &self,
        task_type: &str,
        time_slice: TimeSlice,
        segment: u32,
    ) -> StoreResult<()> {
        let task_type = task_type.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM tasks WHERE task_type = ?1 AND time_slice = ?2 AND segment = ?3",
                params![task_type, time_slice.as_millis(), i64::from(segment)],
            )?;
            Ok(())
        })
        .await
    }
}

/// Raw `leases` row, validated by [`LeaseRow::into_lease`].
struct LeaseRow {
    time_slice: i64,
    task_type: String,
    segment_offset: i64,
    owner: Option<String>,
    finished: i64,
}

impl LeaseRow {
    fn into_lease(self) -> StoreResult<Lease> {
        Ok(Lease {
            time_slice: slice_from_column(self.time_slice)?,
            task_type: self.task_type,
            segment_offset: u32_from_column("segment_offset", self.segment_offset)?,
            ownership: match self.owner {
                Some(owner) => Ownership::Owned(owner),
                None => Ownership::Unowned,
            },
            finished: self.finished != 0,
        })
    }
}

struct TaskRow {
    task_type: String,
    segment: i64,
    target: String,
    sources: String,
    interval_minutes: i64,
    window_minutes: i64,
}

impl TaskRow {
    fn into_task(self) -> StoreResult<Task> {
        let sources: BTreeSet<String> = serde_json::from_str(&self.sources)?;
        Ok(Task {
            task_type: self.task_type,
            target: self.target,
            sources,
            interval: minutes_from_column("interval_minutes", self.interval_minutes)?,
            window: minutes_from_column("window_minutes", self.window_minutes)?,
            segment: u32_from_column("segment", self.segment)?,
        })
    }
}

fn slice_from_column(millis: i64) -> StoreResult<TimeSlice> {
    TimeSlice::from_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("time_slice {millis} out of range")))
}

fn u32_from_column(column: &str, value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} = {value}")))
}

fn minutes_from_column(column: &str, value: i64) -> StoreResult<Duration> {
    let minutes = u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} = {value}")))?;
    Ok(Duration::from_secs(minutes.saturating_mul(60)))
}
