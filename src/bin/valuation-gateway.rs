//! # Valuation Gateway
//!
//! The HTTP front edge plus the background ingress consumer. Accepts
//! submissions, persists payloads, and hands claimed envelopes to request
//! orchestrators running on the local runtime.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use valuation_core::front::IngressConsumer;
use valuation_core::logging;
use valuation_core::messaging::RedisStore;
use valuation_core::orchestrator::{LocalInvoker, OrchestratorInvoker};
use valuation_core::web::{build_router, AppState};
use valuation_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Arc::new(Config::from_env()?);
    info!(
        port = config.http_port,
        http_enabled = config.enable_http,
        "Starting valuation gateway"
    );

    let store = RedisStore::connect(&config.redis_url).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let invoker: Arc<dyn OrchestratorInvoker> =
        Arc::new(LocalInvoker::new(store.clone(), config.clone()));
    let consumer = IngressConsumer::new(store.clone(), config.clone(), invoker, shutdown_rx);
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run().await {
            error!(error = %e, "Ingress consumer exited with error");
        }
    });

    if config.enable_http {
        let state = AppState::new(store, config.clone());
        let router = build_router(state);
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
        info!(port = config.http_port, "Gateway HTTP surface listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    info!("Shutdown signal received; stopping ingress consumer");
    let _ = shutdown_tx.send(true);
    let _ = consumer_handle.await;
    info!("Gateway shutdown complete");
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
