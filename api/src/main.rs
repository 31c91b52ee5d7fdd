//! Hookscribe API Server – browses captured webhooks and generates handlers.
//!
//! This binary:
//! 1. Reads configuration from `hookscribe.conf`
//! 2. Opens the SQLite event store written by the capture server
//! 3. Builds one generation client for the configured backend
//! 4. Serves the listing and generation endpoints until Ctrl-C

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use hookscribe_api::generation::OpenAiCompatibleClient;
use hookscribe_api::prompt::PromptTemplate;
use hookscribe_api::relay::Relay;
use hookscribe_api::server;
use hookscribe_common::config::{self, Config};
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
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Hookscribe API Server starting (listen={}, model={}, language={})",
        config.api_listen_addr, config.generation_model, config.generation_language
    );

    // ── open store & backend client ──────────────────────────────────
    let store = EventStore::open(&config.db_path).context("Cannot open event store")?;
    let client = OpenAiCompatibleClient::from_config(&config)
        .context("Cannot build generation client")?;
    info!("Generation endpoint: {}", client.endpoint());

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start HTTP server ────────────────────────────────────────────
    let state = server::AppState::new(
        store,
        Arc::new(client),
        Relay::from_config(&config),
        PromptTemplate::new(&config.generation_language),
    );
    let listen_addr = config.api_listen_addr.clone();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(state, &listen_addr, shutdown).await {
            tracing::error!("HTTP server error: {e:#}");
        }
    });

    let _ = server_handle.await;

    info!("Hookscribe API Server stopped");
    Ok(())
}
