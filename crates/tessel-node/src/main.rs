use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use tessel_core::TesselConfig;
use tessel_scheduler::{SqliteStore, TaskScheduler, TimeSlice};
use tracing::{info, warn};

mod sweep;

#[derive(Debug, Parser)]
#[command(name = "tessel-node", version, about = "Time-sliced task scheduler node")]
struct Cli {
    /// Config file (defaults to $TESSEL_CONFIG, then ~/.tessel/tessel.toml)
    #[arg(long)]
    config: Option<String>,

    /// SQLite database shared by all nodes; overrides database.path
    #[arg(long)]
    db: Option<String>,

    /// Drain the slice containing this RFC 3339 instant, then exit
    #[arg(long, value_name = "RFC3339")]
    once: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessel_node=info,tessel_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > TESSEL_CONFIG env > ~/.tessel/tessel.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("TESSEL_CONFIG").ok());
    let mut config = TesselConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        TesselConfig::default()
    });
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    info!(path = %config.database.path, "opening SQLite database");
    let store = Arc::new(SqliteStore::open(&config.database.path)?);

    let mut scheduler = TaskScheduler::new(&config.scheduler, store.clone(), store.clone())?;
    scheduler.register_task_type(sweep::TASK_TYPE, 16, 4, sweep::factory())?;

    if let Some(instant) = cli.once {
        let time_slice = TimeSlice::of(instant, config.scheduler.time_slice());
        info!(%time_slice, owner = scheduler.owner(), "draining single time slice");
        let report = scheduler.drain(time_slice).await;
        info!(
            leases = report.leases_finished,
            tasks = report.tasks_executed,
            failed = report.tasks_failed,
            "drain complete"
        );
        return Ok(());
    }

    sweep::bootstrap(&scheduler, &store).await?;

    scheduler.start()?;
    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    scheduler.shutdown().await;
    Ok(())
}
