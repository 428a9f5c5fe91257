// =============================================================================
// stockpulse — A-share quote gateway & alerting engine
// =============================================================================
//
// One upstream polling loop multiplexed across many authenticated WebSocket
// subscribers, with per-session rule evaluation and a scheduled server-side
// replay path for durable notifications.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod fanout;
mod notify;
mod quotes;
mod registry;
mod replay;
mod rules;
mod store;
mod subscription;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::quotes::{QuoteSource, SinaQuoteSource, SyntheticQuoteSource};
use crate::store::{MemoryMonitorStore, MemorySessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        stockpulse gateway — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Config::from_env();
    info!(
        port = config.ws_port,
        test_mode = config.test_mode,
        upstream = %config.upstream_host,
        fanout_ms = config.fanout_interval_ms,
        heartbeat_s = config.heartbeat_secs,
        web_push = config.vapid.is_some(),
        "configuration loaded"
    );

    // ── 2. Stores & quote source ─────────────────────────────────────────
    let monitor_store = Arc::new(MemoryMonitorStore::new());
    let session_store = Arc::new(MemorySessionStore::new());

    let source: Arc<dyn QuoteSource> = if config.test_mode {
        info!("WS_TEST_MODE on: serving synthetic quotes");
        Arc::new(SyntheticQuoteSource::new())
    } else {
        Arc::new(SinaQuoteSource::new(
            config.upstream_host.clone(),
            config.batch_size,
        ))
    };

    // Test mode gets a ready-made session so a client can connect without
    // any provisioning step.
    if config.test_mode {
        let expires = Utc::now().timestamp_millis() + 24 * 3600 * 1000;
        session_store.issue("test-token", "test-user", expires);
        info!("test session issued (token=test-token, user=test-user)");
    }

    // ── 3. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        monitor_store,
        session_store,
        source,
    ));

    // ── 4. Background loops ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(fanout::run_fanout(state.clone(), shutdown_rx.clone()));
    tokio::spawn(registry::run_heartbeat(state.clone(), shutdown_rx.clone()));
    tokio::spawn(rules::history::run_daily_wipe(
        state.intraday.clone(),
        shutdown_rx.clone(),
    ));

    // ── 5. HTTP/WebSocket server ─────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let bind_addr = format!("0.0.0.0:{}", config.ws_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "gateway listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    wait_for_signal().await;
    warn!("shutdown signal received — stopping gracefully");

    // Stop the fan-out and heartbeat first, then close every session.
    let _ = shutdown_tx.send(true);
    state.registry.close_all("server shutdown");

    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => info!("listener closed"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => {
            error!("graceful shutdown deadline exceeded — forcing exit");
            std::process::exit(1);
        }
    }

    info!("stockpulse gateway shut down complete");
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
