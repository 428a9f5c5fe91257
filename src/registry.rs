// =============================================================================
// Connection Registry — one live WebSocket session per user
// =============================================================================
//
// Every server-originated send goes through the session's bounded writer
// mailbox; the registry never touches a socket directly and never blocks. A
// full mailbox means the session is not draining — quote sends are dropped
// for that cycle and the next fan-out tick brings fresh values.
//
// Reconnection: the newest connection wins. The superseded session is sent a
// 1000 close with reason "superseded" through its own mailbox and is expected
// to clean itself up; its cleanup must not evict the replacement, which is
// why removal is keyed by connection id.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::messages::ServerMessage;
use crate::types::Quote;

/// Writer mailbox capacity per session. Sized for a full fan-out tick of a
/// large watchlist plus control frames.
pub const SESSION_MAILBOX_CAPACITY: usize = 256;

/// Close codes the gateway uses.
pub mod close_code {
    /// Normal close: supersede, shutdown, heartbeat expiry.
    pub const NORMAL: u16 = 1000;
    /// Authentication failure at session open.
    pub const POLICY: u16 = 1008;
    /// Internal error.
    pub const INTERNAL: u16 = 1011;
}

/// What a session's writer task consumes.
#[derive(Debug)]
pub enum Outbound {
    /// Encoded as a JSON text frame.
    Frame(ServerMessage),
    /// A fan-out quote: emitted as `stock_update`, then run through the
    /// session's rule engine.
    Quote(Quote),
    /// Transport-level ping issued by the heartbeat.
    Ping,
    /// Transport-level pong echoing a client ping's payload.
    RawPong(Vec<u8>),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: &'static str },
}

/// Handle to a live session held by the registry.
#[derive(Clone)]
pub struct SessionHandle {
    pub conn_id: Uuid,
    pub user_id: String,
    pub tx: mpsc::Sender<Outbound>,
    /// Cleared by the heartbeat, set by the session's pong handling.
    pub alive: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(user_id: impl Into<String>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            user_id: user_id.into(),
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. An existing connection for the same user is sent
    /// a 1000 "superseded" close and replaced; the new connection is
    /// canonical from here on.
    pub fn add_connection(&self, handle: SessionHandle) {
        let old = self
            .sessions
            .write()
            .insert(handle.user_id.clone(), handle.clone());

        if let Some(old) = old {
            info!(user_id = %handle.user_id, "existing connection superseded");
            let _ = old.tx.try_send(Outbound::Close {
                code: close_code::NORMAL,
                reason: "superseded",
            });
        }
    }

    /// Remove a session, but only if `conn_id` still identifies the
    /// registered connection. Returns whether a removal happened; the caller
    /// owns the follow-up unsubscribe.
    pub fn remove(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(user_id) {
            Some(current) if current.conn_id == conn_id => {
                sessions.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Queue a message frame for a user. True iff the user has a live
    /// connection and the frame was accepted by its mailbox.
    pub fn send_to(&self, user_id: &str, msg: ServerMessage) -> bool {
        let handle = match self.sessions.read().get(user_id) {
            Some(h) => h.clone(),
            None => return false,
        };
        handle.tx.try_send(Outbound::Frame(msg)).is_ok()
    }

    /// Queue a quote for a user. A full mailbox drops the quote (the session
    /// is not keeping up; next tick supplies fresh data).
    pub fn send_quote(&self, user_id: &str, quote: Quote) -> bool {
        let handle = match self.sessions.read().get(user_id) {
            Some(h) => h.clone(),
            None => return false,
        };
        handle.tx.try_send(Outbound::Quote(quote)).is_ok()
    }

    /// Queue a frame for every live session. Individual failures are logged
    /// and do not abort the iteration.
    pub fn broadcast(&self, msg: ServerMessage) {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        for handle in handles {
            if handle.tx.try_send(Outbound::Frame(msg.clone())).is_err() {
                warn!(user_id = %handle.user_id, "broadcast frame dropped");
            }
        }
    }

    /// Heartbeat sweep: sessions that did not answer the previous ping are
    /// closed; the rest get their flag cleared and a fresh ping. Returns the
    /// users whose sessions were terminated.
    pub fn sweep_liveness(&self) -> Vec<String> {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();

        let mut expired = Vec::new();
        for handle in handles {
            if handle.alive.swap(false, Ordering::SeqCst) {
                let _ = handle.tx.try_send(Outbound::Ping);
            } else {
                debug!(user_id = %handle.user_id, "session failed liveness check");
                let _ = handle.tx.try_send(Outbound::Close {
                    code: close_code::NORMAL,
                    reason: "heartbeat timeout",
                });
                self.remove(&handle.user_id, handle.conn_id);
                expired.push(handle.user_id);
            }
        }
        expired
    }

    /// Close every session with the given reason. Used on shutdown.
    pub fn close_all(&self, reason: &'static str) {
        let handles: Vec<SessionHandle> = self.sessions.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.tx.try_send(Outbound::Close {
                code: close_code::NORMAL,
                reason,
            });
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// The connection id currently registered for a user, if any.
    pub fn conn_id_of(&self, user_id: &str) -> Option<Uuid> {
        self.sessions.read().get(user_id).map(|h| h.conn_id)
    }
}

// =============================================================================
// Heartbeat loop
// =============================================================================

/// Run the liveness sweep on the configured cadence until shutdown.
/// Terminated users also lose their subscriptions.
pub async fn run_heartbeat(
    state: Arc<crate::app_state::AppState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(
        interval_secs = state.config.heartbeat_secs,
        "heartbeat loop started"
    );
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("heartbeat loop stopping");
                return;
            }
        }
        for user in state.registry.sweep_liveness() {
            state.index.unsubscribe_all(&user);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: &str) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(SESSION_MAILBOX_CAPACITY);
        (SessionHandle::new(user, tx), rx)
    }

    #[tokio::test]
    async fn supersede_sends_close_to_old_connection() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = session("u1");
        let (second, _second_rx) = session("u1");
        let second_id = second.conn_id;

        registry.add_connection(first);
        registry.add_connection(second);

        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.conn_id_of("u1"), Some(second_id));

        match first_rx.recv().await {
            Some(Outbound::Close { code, reason }) => {
                assert_eq!(code, close_code::NORMAL);
                assert_eq!(reason, "superseded");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_remove_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = session("u1");
        let first_id = first.conn_id;
        let (second, _rx2) = session("u1");

        registry.add_connection(first);
        registry.add_connection(second);

        // The superseded session's cleanup races with the new connection.
        assert!(!registry.remove("u1", first_id));
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to("ghost", ServerMessage::Pong));
    }

    #[tokio::test]
    async fn full_mailbox_drops_quote() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.add_connection(SessionHandle::new("u1", tx));

        let quote = crate::types::Quote {
            ts_code: "600519.SH".into(),
            name: String::new(),
            current_price: 1.0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            pre_close: 1.0,
            volume: 0.0,
            amount: 0.0,
            change: 0.0,
            change_percent: 0.0,
            timestamp: 0,
            trade_date: String::new(),
            trade_time: String::new(),
        };

        assert!(registry.send_quote("u1", quote.clone()));
        // Mailbox of one is now full; the quote is dropped, not blocked on.
        assert!(!registry.send_quote("u1", quote));
    }

    #[tokio::test]
    async fn liveness_sweep_pings_then_expires() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = session("u1");
        let alive = handle.alive.clone();
        registry.add_connection(handle);

        // First sweep: alive flag was set, so the session gets a ping.
        assert!(registry.sweep_liveness().is_empty());
        match rx.recv().await {
            Some(Outbound::Ping) => {}
            other => panic!("expected ping, got {other:?}"),
        }
        assert!(!alive.load(Ordering::SeqCst));

        // No pong arrives: the second sweep terminates the session.
        let expired = registry.sweep_liveness();
        assert_eq!(expired, vec!["u1".to_string()]);
        assert_eq!(registry.session_count(), 0);
        match rx.recv().await {
            Some(Outbound::Close { reason, .. }) => assert_eq!(reason, "heartbeat timeout"),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pong_keeps_session_alive() {
        let registry = ConnectionRegistry::new();
        let (handle, mut _rx) = session("u1");
        let alive = handle.alive.clone();
        registry.add_connection(handle);

        registry.sweep_liveness();
        alive.store(true, Ordering::SeqCst); // what the session does on pong
        assert!(registry.sweep_liveness().is_empty());
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn close_all_drains_registry() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = session("u1");
        let (h2, mut rx2) = session("u2");
        registry.add_connection(h1);
        registry.add_connection(h2);

        registry.close_all("server shutdown");
        assert_eq!(registry.session_count(), 0);
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await {
                Some(Outbound::Close { code, reason }) => {
                    assert_eq!(code, close_code::NORMAL);
                    assert_eq!(reason, "server shutdown");
                }
                other => panic!("expected close, got {other:?}"),
            }
        }
    }
}
