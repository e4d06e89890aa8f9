//! Minimal daemon entry point: opens a store at the configured persistence
//! directory, installs emergency-checkpoint shutdown hooks, and idles until
//! a signal arrives. Library users who don't want process-wide signal
//! handlers should construct `TaskStore` directly instead.

use std::path::PathBuf;
use std::sync::Arc;

use taskvault::config::StoreConfig;
use taskvault::events::{EventBus, StdOutSink};
use taskvault::store::TaskStore;

/// Installs `SIGINT`/`SIGTERM` handlers that drive a graceful
/// `TaskStore::shutdown`, falling back to an emergency checkpoint if the
/// graceful path itself fails.
///
/// Behind the `signals` feature: the library is usable without ever
/// installing global process state on its own.
async fn register_shutdown_hooks(store: Arc<TaskStore>) {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("received Ctrl+C, shutting down");
    }
    if let Err(e) = store.shutdown(true).await {
        tracing::error!(error = %e, "graceful shutdown failed, attempting emergency checkpoint");
        if let Err(e) = store.emergency_checkpoint().await {
            tracing::error!(error = %e, "emergency checkpoint also failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let persistence_directory = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".taskvault"));
    let config = StoreConfig {
        persistence_directory,
        ..StoreConfig::default()
    };

    let events = Arc::new(EventBus::with_sinks(vec![Box::new(StdOutSink::default())]));
    let store = Arc::new(TaskStore::open(config, events).await?);
    tokio::spawn(store.clone().run_checkpoint_timer());
    tokio::spawn(store.clone().run_heartbeat_timer());
    tokio::spawn(store.clone().run_cache_sweep_timer());

    register_shutdown_hooks(store).await;
    Ok(())
}
