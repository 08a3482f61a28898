//! drx orchestrator
//!
//! Drives recovery-plan executions wave by wave. Control operations are
//! exposed through the library; this binary runs the tick driver against
//! the configured store and provider.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use drx_orchestrator::{
    config,
    controller::ExecutionController,
    db::{Database, ExecutionStore, InMemoryExecutionStore},
    notify::TracingNotifier,
    providers::{CredentialBroker, HttpBroker, HttpProvider, MockBroker, MockProvider},
    quota::QuotaGuard,
    scheduler::TickWorker,
    state::Capabilities,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Describes before the dev-mode mock reports every server launched.
const DEV_AUTO_LAUNCH_DESCRIBES: u32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to DRX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting drx orchestrator");
    info!(
        tick_interval_secs = config.scheduler.tick_interval.as_secs(),
        default_region = %config.scheduler.default_region,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let store: Arc<dyn ExecutionStore> = match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if let Err(e) = db.run_migrations().await {
                error!(error = %e, "Failed to run migrations");
                return Err(e.into());
            }
            Arc::new(db.execution_store())
        }
        None => {
            warn!("DRX_DATABASE_URL not set, executions are kept in memory");
            Arc::new(InMemoryExecutionStore::new())
        }
    };

    let broker: Arc<dyn CredentialBroker> = if config.dev_mode {
        info!("Using in-process mock provider (dev mode)");
        let provider = Arc::new(MockProvider::with_auto_launch(DEV_AUTO_LAUNCH_DESCRIBES));
        Arc::new(MockBroker::new(provider))
    } else {
        info!(provider_url = %config.provider_url, "Using provider gateway");
        let caller = HttpProvider::new(config.provider_url.clone(), config.provider_timeout)?;
        Arc::new(HttpBroker::new(caller))
    };

    let caps = Capabilities::new(
        store,
        broker,
        Arc::new(TracingNotifier),
        QuotaGuard::new(config.quota),
        config.scheduler.clone(),
    );
    let controller = Arc::new(ExecutionController::new(caps));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start tick worker in background
    let tick_worker = TickWorker::new(
        controller,
        config.scheduler.tick_interval,
        config.max_tick_retries,
        config.retry_window,
    );
    let tick_handle = tokio::spawn(async move {
        tick_worker.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Received shutdown signal");
    }

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for tick worker to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, tick_handle).await {
        warn!(error = %e, "Tick worker did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
