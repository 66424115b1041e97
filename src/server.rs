//! Server startup and lifecycle.
//!
//! Owns the background dispatch worker: spawned before the listener comes up,
//! signaled through a watch channel on shutdown, and joined before exit so a
//! mid-cycle dispatch finishes its transaction.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::db::DbHandle;
use crate::dispatch::Dispatcher;
use crate::worker;

pub async fn start_server(config: Config) -> Result<()> {
    ensure_db_dir(&config)?;
    let db = DbHandle::open(&config.db_path)?;
    let state = AppState::new(db.clone(), config.clone())?;

    let dispatcher = Dispatcher::new(db, &config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker::run(
        dispatcher,
        config.dispatch_interval,
        shutdown_rx,
    ));

    let app = api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, dev_mode = config.dev_mode, "Aureli listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    worker_handle.await.context("Dispatch worker panicked")?;
    info!("Shutdown complete");
    Ok(())
}

pub fn ensure_db_dir(config: &Config) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
