//! crmsync daemon entry point.
//!
//! Loads configuration, opens the database, starts the web API and the
//! auto-sync scheduler, and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crmsync_core::config::AppConfig;
use crmsync_core::db::Database;
use crmsync_core::IntegrationService;
use crmsync_web::WebServer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// crmsync daemon.
#[derive(Parser, Debug)]
#[command(
    name = "crmsync-daemon",
    version,
    about = "Per-tenant Pipedrive connection and customer/contact sync service"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        listen = %config.web.listen,
        data_dir = %config.daemon.data_dir.display(),
        scheduler_tick_secs = config.daemon.scheduler_tick_secs,
        log_level,
        "crmsync daemon starting"
    );

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    let db_path = config.daemon.data_dir.join("crmsync.db");
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    info!(path = %db_path.display(), "database initialized");

    let service = Arc::new(
        IntegrationService::from_config(&config, Arc::new(db))
            .context("failed to initialize integration service")?,
    );

    let web_server = WebServer::new(service.clone());
    let listen_addr = config.web.listen.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start(&listen_addr).await {
            error!(error = %e, "web server error");
        }
    });

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();
    let sched = scheduler::Scheduler::new(
        service.clone(),
        Duration::from_secs(config.daemon.scheduler_tick_secs),
    );
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("shutdown signal received, stopping");

    // Stores a permit if the scheduler is mid-tick and not yet waiting.
    shutdown.notify_one();

    match tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!(error = %e, "scheduler task error"),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }

    web_handle.abort();

    info!("crmsync daemon stopped");
    Ok(())
}
