//! Hookscribe Capture Server – records inbound webhook deliveries.
//!
//! This binary:
//! 1. Reads configuration from `hookscribe.conf`
//! 2. Opens (or creates) the SQLite event store
//! 3. Runs an axum HTTP server that stores every request under
//!    `/webhooks/...` as a captured event.

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use hookscribe_common::store::EventStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| hookscribe_common::config::Config::default_path().to_string());
    let config = hookscribe_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    info!(
        "Hookscribe Capture Server starting (listen={})",
        config.capture_listen_addr
    );

    // ── open store ───────────────────────────────────────────────────
    let store = EventStore::open(&config.db_path).context("Cannot open event store")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start HTTP server ────────────────────────────────────────────
    let state = server::AppState::new(store, config.capture_max_body_bytes);
    let listen_addr = config.capture_listen_addr.clone();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(state, &listen_addr, shutdown).await {
            tracing::error!("HTTP server error: {e:#}");
        }
    });

    // Wait for the server task (runs until shutdown)
    let _ = server_handle.await;

    info!("Hookscribe Capture Server stopped");
    Ok(())
}
