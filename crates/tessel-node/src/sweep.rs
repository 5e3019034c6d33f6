use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tessel_scheduler::{SqliteStore, Task, TaskFactory, TaskScheduler, TimeSlice, Trigger};
use tracing::info;

pub const TASK_TYPE: &str = "retention-sweep";

/// Tenant that owns cluster-wide housekeeping tasks.
pub const SYSTEM_TENANT: &str = "system";
const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Drops data points of a tenant that fell out of the retention window.
///
/// The node has no metric storage of its own, so the sweep only reports what
/// it would cover.
pub fn factory() -> Arc<dyn TaskFactory> {
    Arc::new(|task: Task| async move {
        info!(
            tenant = %task.target,
            window_minutes = task.window_minutes(),
            sources = task.sources.len(),
            "retention sweep"
        );
        Ok::<(), anyhow::Error>(())
    })
}

/// Schedule the recurring sweep of the system tenant, unless some node
/// already did. Returns the first slice when this call scheduled it.
pub async fn bootstrap(
    scheduler: &TaskScheduler,
    store: &SqliteStore,
) -> anyhow::Result<Option<TimeSlice>> {
    let key = format!("{TASK_TYPE}/{SYSTEM_TENANT}");
    if !store.claim_bootstrap(&key).await? {
        info!(%key, "retention sweep already scheduled");
        return Ok(None);
    }

    let scheduled = scheduler
        .schedule_task(
            TASK_TYPE,
            SYSTEM_TENANT,
            BTreeSet::new(),
            SWEEP_INTERVAL,
            Trigger::repeating(SWEEP_INTERVAL).with_delay(SWEEP_INTERVAL),
        )
        .await;
    match scheduled {
        Ok(first) => {
            info!(time_slice = %first, "retention sweep scheduled");
            Ok(Some(first))
        }
        Err(e) => {
            // let the next boot try again
            store.release_bootstrap(&key).await?;
            Err(e.into())
        }
    }
}
