//! Settlement worker entry point.
//!
//! Loads configuration, initialises structured logging, prepares the
//! database, optionally serves the admin API, and runs settlement batches
//! on a fixed interval until Ctrl+C. With `--once` it runs a single batch
//! and exits.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use alpha_settlement::admin::{self, AdminState};
use alpha_settlement::config;
use alpha_settlement::engine::{BatchOrchestrator, RunSummary};
use alpha_settlement::storage;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;
    init_logging();

    let once = std::env::args().any(|arg| arg == "--once");
    info!(
        enabled = cfg.settlement.enabled,
        interval_secs = cfg.scheduler.interval_secs,
        shard = cfg.settlement.shard_index,
        shard_count = cfg.settlement.shard_count,
        once,
        "Alpha settlement starting up"
    );

    // -- Database --------------------------------------------------------

    let pool = storage::connect(&cfg.database.url, cfg.database.max_connections).await?;
    if cfg.database.create_collaborator_tables {
        storage::collaborators::create_tables(&pool).await?;
    }
    storage::migrate(&pool).await?;

    let orchestrator = Arc::new(BatchOrchestrator::new(pool.clone(), cfg.settlement.clone()));

    if once {
        let summary = orchestrator.run_batch(Utc::now()).await?;
        log_summary(&summary);
        pool.close().await;
        return Ok(());
    }

    if cfg.admin.enabled {
        let state = Arc::new(AdminState {
            pool: pool.clone(),
            orchestrator: orchestrator.clone(),
        });
        admin::spawn_admin(state, cfg.admin.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.scheduler.interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.scheduler.interval_secs,
        "Entering settlement loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match orchestrator.run_batch(Utc::now()).await {
                    Ok(summary) => log_summary(&summary),
                    Err(e) => error!(error = %e, "Batch could not be recorded, continuing"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    pool.close().await;
    info!("Alpha settlement shut down cleanly.");
    Ok(())
}

fn log_summary(summary: &RunSummary) {
    for event in &summary.events {
        info!(run_id = summary.run_id, event = %event, "Run event");
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("alpha_settlement=info"));

    let json_logging = std::env::var("ALPHA_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
