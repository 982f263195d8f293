//! # relink-server
//!
//! Foreground process of relink.
//!
//! This binary provides:
//! - REST API for pairing, scanning, GATT access and device logs
//! - Live tracker events as Server-Sent Events
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development (in-memory radio)
//! cargo run --package relink-server
//!
//! # Against BlueZ
//! cargo run --package relink-server --features bluetooth
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use anyhow::Context;
use relink_core::{logging, platform_radio, Config, FileStore, LogStore, PairingRegistry, Tracker};
use tokio::net::TcpListener;
use tracing::{info, warn};

use relink_server::api;
use relink_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    logging::init("relink-server", &config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting relink-server");

    let store = Arc::new(
        FileStore::open(&config.storage.data_dir)
            .with_context(|| format!("Failed to open {}", config.storage.data_dir.display()))?,
    );
    let registry = PairingRegistry::new(store.clone());
    let logs = LogStore::new(store, config.retention.policy());
    let radio = platform_radio(config.tracker.adapter.clone()).await?;

    let tracker = Tracker::new(radio, registry.clone(), logs)
        .with_config(config.tracker.clone())
        .start()
        .await?;

    // Resume tracking whatever was paired in an earlier session.
    if !registry.load_all()?.is_empty() {
        tracker.ensure_scanning().await?;
    }

    let addr = config.server.bind_addr()?;
    let state = AppState::new(config, tracker.clone(), registry);
    let app = api::create_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down tracker");
    if let Err(e) = tracker.shutdown().await {
        warn!(error = %e, "Tracker did not shut down cleanly");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
