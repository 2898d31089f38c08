//! # Valuation Worker
//!
//! Stateless task executor. Claims dispatches from the shared worker group,
//! runs the configured valuation engine, and publishes task updates.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use valuation_core::logging;
use valuation_core::messaging::RedisStore;
use valuation_core::worker::{PricingCommandEngine, TaskProcessor, TaskWorker, ValuationEngine};
use valuation_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Arc::new(Config::from_env()?);
    info!("Starting valuation worker");

    let store = RedisStore::connect(&config.redis_url).await?;
    let engine: Arc<dyn ValuationEngine> = Arc::new(PricingCommandEngine::from_config(&config)?);
    let processor = Arc::new(TaskProcessor::new(store.clone(), engine));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = TaskWorker::new(store, config, processor, shutdown_rx);
    let worker_handle = tokio::spawn(worker.run());

    shutdown_signal().await;
    info!("Shutdown signal received; draining worker");
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;
    info!("Worker shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
