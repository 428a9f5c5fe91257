// =============================================================================
// HTTP Endpoints — Axum 0.7
// =============================================================================
//
// The gateway's small HTTP surface:
//   GET /health              — public liveness probe
//   GET /cron/check-monitors — scheduled replay trigger (Bearer CRON_SECRET)
//   GET /ws                  — WebSocket upgrade (token auth in ws module)
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::api::auth::CronBearer;
use crate::app_state::AppState;
use crate::replay::{self, ReplayOutcome};

// =============================================================================
// Router construction
// =============================================================================

/// Build the gateway router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Scheduled trigger ───────────────────────────────────────
        .route("/cron/check-monitors", get(cron_check_monitors))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    sessions: usize,
    subscribed_users: usize,
    subscribed_codes: usize,
    fanout_ticks: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        sessions: state.registry.session_count(),
        subscribed_users: state.index.user_count(),
        subscribed_codes: state.index.code_count(),
        fanout_ticks: state.fanout_tick_count(),
        server_time: Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Scheduled trigger
// =============================================================================

async fn cron_check_monitors(
    _auth: CronBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match replay::check_monitors(&state).await {
        Ok(ReplayOutcome::Skipped) => Json(serde_json::json!({
            "success": true,
            "skipped": true,
        }))
        .into_response(),
        Ok(ReplayOutcome::Ran { checked, triggered }) => Json(serde_json::json!({
            "success": true,
            "message": format!("checked {checked} rules, triggered {triggered} alerts"),
            "checked": checked,
            "triggered": triggered,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "scheduled monitor pass failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
