// =============================================================================
// WebSocket Session Handler — auth, codec loop, per-session writer
// =============================================================================
//
// Clients connect to `/ws?token=<opaque>`. The token is looked up in the
// session store; absent, unknown, or expired tokens are closed with 1008.
//
// Each authenticated session runs two tasks:
//   1. **Writer** — owns the socket sink and the session's rule engine.
//      Drains the bounded mailbox the registry and fan-out feed: quote
//      messages become `stock_update` frames and are then run through the
//      rule engine, which may append `alert` frames (cooldown-gated).
//   2. **Read loop** (this task) — decodes client frames: subscribe /
//      unsubscribe / ping, transport ping-pong, close.
//
// Cleanup removes the session from the registry only when this connection is
// still the registered one (a superseded session must not evict its
// replacement) and then drops all subscriptions.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::messages::{AlertPayload, ClientMessage, ServerMessage};
use crate::app_state::AppState;
use crate::notify::{alert_title, format_alert_message, severity_of};
use crate::registry::{close_code, Outbound, SessionHandle, SESSION_MAILBOX_CAPACITY};
use crate::types::normalize_ts_code;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    // Auth happens after the upgrade so the rejection can carry a proper
    // close code instead of an HTTP status.
    ws.on_upgrade(move |socket| handle_session(socket, state, query.token))
}

async fn handle_session(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    // ── Authenticate ────────────────────────────────────────────────────
    let token = match token.filter(|t| !t.is_empty()) {
        Some(t) => t,
        None => {
            reject(socket, close_code::POLICY, "missing token").await;
            return;
        }
    };

    let claims = match state.sessions.lookup(&token).await {
        Ok(Some(claims)) => claims,
        Ok(None) => {
            reject(socket, close_code::POLICY, "invalid token").await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "session store lookup failed");
            reject(socket, close_code::INTERNAL, "internal error").await;
            return;
        }
    };
    let user_id = claims.user_id;
    info!(user_id = %user_id, "websocket session authenticated");

    // ── Register ────────────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel(SESSION_MAILBOX_CAPACITY);
    let handle = SessionHandle::new(user_id.clone(), tx.clone());
    let conn_id = handle.conn_id;
    let alive = handle.alive.clone();
    state.registry.add_connection(handle);

    let (sender, mut receiver) = socket.split();

    let writer = tokio::spawn(run_writer(sender, rx, state.clone(), user_id.clone()));

    // ── Read loop ───────────────────────────────────────────────────────
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_text(&state, &user_id, &tx, &alive, &text).await;
            }
            Ok(Message::Ping(data)) => {
                alive.store(true, Ordering::SeqCst);
                let _ = tx.send(Outbound::RawPong(data)).await;
            }
            Ok(Message::Pong(_)) => {
                alive.store(true, Ordering::SeqCst);
            }
            Ok(Message::Binary(_)) => {
                debug!(user_id = %user_id, "binary frame ignored");
            }
            Ok(Message::Close(_)) => {
                debug!(user_id = %user_id, "client close frame received");
                break;
            }
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "websocket receive error");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────────
    if state.registry.remove(&user_id, conn_id) {
        state.index.unsubscribe_all(&user_id);
    }
    drop(tx);
    let _ = writer.await;
    info!(user_id = %user_id, "websocket session closed");
}

/// Complete the upgrade only to hand back a close frame with the given code.
async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    warn!(code, reason, "websocket connection rejected");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

// =============================================================================
// Client message handling
// =============================================================================

async fn handle_client_text(
    state: &Arc<AppState>,
    user_id: &str,
    tx: &mpsc::Sender<Outbound>,
    alive: &Arc<std::sync::atomic::AtomicBool>,
    text: &str,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::SubscribeStocks { ts_codes }) => {
            let (valid, rejected) = partition_codes(&ts_codes);
            if !rejected.is_empty() {
                let _ = tx
                    .send(Outbound::Frame(ServerMessage::error_with_code(
                        format!("invalid ts codes: {}", rejected.join(", ")),
                        "invalid_codes",
                    )))
                    .await;
            }
            if !valid.is_empty() {
                state.index.subscribe(user_id, &valid);
                debug!(user_id, count = valid.len(), "stocks subscribed");
            }
        }
        Ok(ClientMessage::UnsubscribeStocks { ts_codes }) => {
            let (valid, _rejected) = partition_codes(&ts_codes);
            if !valid.is_empty() {
                state.index.unsubscribe(user_id, &valid);
                debug!(user_id, count = valid.len(), "stocks unsubscribed");
            }
        }
        Ok(ClientMessage::Ping) => {
            alive.store(true, Ordering::SeqCst);
            let _ = tx.send(Outbound::Frame(ServerMessage::Pong)).await;
        }
        Err(e) => {
            debug!(user_id, error = %e, "unparseable client message");
            let _ = tx
                .send(Outbound::Frame(ServerMessage::error(
                    "unsupported or malformed message",
                )))
                .await;
        }
    }
}

/// Split raw codes into normalised valid codes and the rejected originals.
fn partition_codes(raw: &[String]) -> (Vec<String>, Vec<String>) {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for code in raw {
        match normalize_ts_code(code) {
            Some(normalized) => valid.push(normalized),
            None => rejected.push(code.clone()),
        }
    }
    (valid, rejected)
}

// =============================================================================
// Writer task
// =============================================================================

/// Owns the socket sink and the session's rule engine. All server-originated
/// bytes for this session pass through here, which keeps per-stock quote
/// order monotonic in fan-out-tick order.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    state: Arc<AppState>,
    user_id: String,
) {
    let mut engine = state.new_rule_engine();

    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Frame(msg) => send_frame(&mut sink, &msg).await,
            Outbound::Quote(quote) => {
                match send_frame(&mut sink, &ServerMessage::StockUpdate(quote.clone())).await {
                    Ok(()) => {
                        evaluate_and_alert(&mut sink, &state, &user_id, &mut engine, &quote).await
                    }
                    Err(e) => Err(e),
                }
            }
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::RawPong(data) => sink.send(Message::Pong(data)).await,
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };

        if let Err(e) = result {
            debug!(user_id = %user_id, error = %e, "websocket send failed — writer stopping");
            break;
        }
    }
}

/// Run the session rule engine over one delivered quote and emit an `alert`
/// frame per cooldown-approved OPEN.
async fn evaluate_and_alert(
    sink: &mut SplitSink<WebSocket, Message>,
    state: &Arc<AppState>,
    user_id: &str,
    engine: &mut crate::rules::RuleEngine,
    quote: &crate::types::Quote,
) -> Result<(), axum::Error> {
    let rules = match state.store.applicable_rules(user_id, &quote.ts_code).await {
        Ok(rules) => rules,
        Err(e) => {
            warn!(user_id, ts_code = %quote.ts_code, error = %e, "failed to load rules");
            return Ok(());
        }
    };
    if rules.is_empty() {
        return Ok(());
    }

    for event in engine.process_quote(quote, &rules) {
        if !engine.should_notify(&event.ts_code, event.rule_type, quote.timestamp) {
            continue;
        }
        let frame = ServerMessage::Alert(AlertPayload {
            id: Uuid::new_v4().to_string(),
            title: alert_title(event.rule_type).to_string(),
            message: format_alert_message(&event),
            severity: severity_of(event.rule_type),
        });
        send_frame(sink, &frame).await?;
    }
    Ok(())
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation errors are not transport errors; keep writing.
            warn!(error = %e, "failed to serialise server message");
            Ok(())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
