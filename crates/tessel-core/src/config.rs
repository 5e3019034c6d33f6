use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesselError};

pub const DEFAULT_TIME_SLICE_SECS: u64 = 60;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_PERMITS: usize = 4; // same size as the worker pool
pub const DEFAULT_REDISCOVERY_BACKOFF_MS: u64 = 250;

/// Top-level config (tessel.toml + TESSEL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesselConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Knobs for the time-sliced task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Granularity of task time slices, in seconds.
    #[serde(default = "default_time_slice_secs")]
    pub time_slice_secs: u64,
    /// Ticker period in milliseconds. Tick slices are truncated to this
    /// granularity as well.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Number of lease groups this node may own and process at once.
    #[serde(default = "default_permits")]
    pub permits: usize,
    /// Pause between two lease rediscovery passes for the same task type.
    #[serde(default = "default_rediscovery_backoff_ms")]
    pub rediscovery_backoff_ms: u64,
    /// Identity written into acquired leases. Falls back to `$HOSTNAME`,
    /// then to a generated `node-<uuid>`.
    #[serde(default)]
    pub owner: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_slice_secs: DEFAULT_TIME_SLICE_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            permits: DEFAULT_PERMITS,
            rediscovery_backoff_ms: DEFAULT_REDISCOVERY_BACKOFF_MS,
            owner: None,
        }
    }
}

impl SchedulerConfig {
    pub fn time_slice(&self) -> Duration {
        Duration::from_secs(self.time_slice_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rediscovery_backoff(&self) -> Duration {
        Duration::from_millis(self.rediscovery_backoff_ms)
    }

    /// Resolve the lease owner name for this process.
    pub fn owner_name(&self) -> String {
        if let Some(owner) = self.owner.as_deref().filter(|o| !o.trim().is_empty()) {
            return owner.to_string();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.trim().is_empty() => host,
            _ => format!("node-{}", uuid::Uuid::now_v7()),
        }
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.time_slice_secs == 0 {
            return Err(TesselError::Config(
                "scheduler.time_slice_secs must be greater than zero".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(TesselError::Config(
                "scheduler.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        // the ticker truncates to tick slices; every task slice must be one
        let slice_ms = self.time_slice_secs.saturating_mul(1_000);
        if self.tick_interval_ms > slice_ms || slice_ms % self.tick_interval_ms != 0 {
            return Err(TesselError::Config(format!(
                "scheduler.tick_interval_ms ({}) must evenly divide the time slice ({} ms)",
                self.tick_interval_ms, slice_ms
            )));
        }
        if self.permits == 0 {
            return Err(TesselError::Config(
                "scheduler.permits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_time_slice_secs() -> u64 {
    DEFAULT_TIME_SLICE_SECS
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_permits() -> usize {
    DEFAULT_PERMITS
}
fn default_rediscovery_backoff_ms() -> u64 {
    DEFAULT_REDISCOVERY_BACKOFF_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tessel/tessel.db", home)
}

impl TesselConfig {
    /// Load config from a TOML file with TESSEL_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore so field names keep
    /// their own underscores: `TESSEL_SCHEDULER__TIME_SLICE_SECS=30`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tessel/tessel.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TesselConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TESSEL_").split("__"))
            .extract()
            .map_err(|e| TesselError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tessel/tessel.toml", home)
}
