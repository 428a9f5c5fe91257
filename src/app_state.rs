// =============================================================================
// Central Application State — stockpulse gateway
// =============================================================================
//
// The single composition point shared across all async tasks via
// `Arc<AppState>`. Subsystems keep their own interior mutability
// (parking_lot + atomics); nothing here is awaited while a lock is held —
// tasks copy what they need out before I/O.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::notify::NotificationDispatcher;
use crate::quotes::QuoteSource;
use crate::registry::ConnectionRegistry;
use crate::rules::{IntradayHistory, RuleEngine};
use crate::store::{MonitorStore, SessionStore};
use crate::subscription::SubscriptionIndex;

pub struct AppState {
    pub config: Config,

    // ── Gateway core ────────────────────────────────────────────────────
    pub index: SubscriptionIndex,
    pub registry: ConnectionRegistry,

    // ── External collaborators ──────────────────────────────────────────
    pub store: Arc<dyn MonitorStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub source: Arc<dyn QuoteSource>,

    // ── Alerting ────────────────────────────────────────────────────────
    pub dispatcher: NotificationDispatcher,
    /// Replay-path rule engines, one per user, persisted across scheduled
    /// invocations so ACTIVE holds and cooldowns survive between cron ticks.
    replay_engines: Mutex<HashMap<String, RuleEngine>>,

    // ── Server-side history ─────────────────────────────────────────────
    pub intraday: Arc<IntradayHistory>,

    // ── Counters ────────────────────────────────────────────────────────
    pub fanout_ticks: AtomicU64,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn MonitorStore>,
        sessions: Arc<dyn SessionStore>,
        source: Arc<dyn QuoteSource>,
    ) -> Self {
        let dispatcher = NotificationDispatcher::new(store.clone(), config.vapid.clone());

        Self {
            config,
            index: SubscriptionIndex::new(),
            registry: ConnectionRegistry::new(),
            store,
            sessions,
            source,
            dispatcher,
            replay_engines: Mutex::new(HashMap::new()),
            intraday: Arc::new(IntradayHistory::default()),
            fanout_ticks: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    /// A rule engine configured from this gateway's settings.
    pub fn new_rule_engine(&self) -> RuleEngine {
        RuleEngine::new(
            self.config.window_secs,
            self.config.compression_threshold_pct,
            self.config.cooldown_secs,
        )
    }

    /// Take a user's replay engine out of the shared map (creating it on
    /// first use) so the caller can run it without holding the lock across
    /// awaits. Pair with [`AppState::put_replay_engine`].
    pub fn take_replay_engine(&self, user_id: &str) -> RuleEngine {
        self.replay_engines
            .lock()
            .remove(user_id)
            .unwrap_or_else(|| self.new_rule_engine())
    }

    pub fn put_replay_engine(&self, user_id: &str, engine: RuleEngine) {
        self.replay_engines
            .lock()
            .insert(user_id.to_string(), engine);
    }

    pub fn fanout_tick_count(&self) -> u64 {
        self.fanout_ticks.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::SyntheticQuoteSource;
    use crate::store::{MemoryMonitorStore, MemorySessionStore};

    fn state() -> AppState {
        AppState::new(
            Config::default(),
            Arc::new(MemoryMonitorStore::new()),
            Arc::new(MemorySessionStore::new()),
            Arc::new(SyntheticQuoteSource::new()),
        )
    }

    #[test]
    fn replay_engine_round_trips_state() {
        let state = state();

        let mut engine = state.take_replay_engine("u1");
        assert!(engine.should_notify("600519.SH", crate::rules::RuleType::LimitUp, 0));
        state.put_replay_engine("u1", engine);

        // The same engine comes back: the cooldown entry survives.
        let mut engine = state.take_replay_engine("u1");
        assert!(!engine.should_notify("600519.SH", crate::rules::RuleType::LimitUp, 60_000));
    }

    #[test]
    fn fresh_engine_per_unknown_user() {
        let state = state();
        let engine = state.take_replay_engine("nobody");
        assert_eq!(engine.live_alert_count(), 0);
    }
}
