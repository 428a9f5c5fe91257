// =============================================================================
// Rule Engine — per-session alert state machines
// =============================================================================
//
// Evaluates every applicable rule against every quote the session observes.
// State per (ts_code, rule_type):
//
//   absent --[should_open]--> OPEN   (emits an AlertEvent)
//   OPEN   --[not closing]--> ACTIVE (no emission)
//   ACTIVE --[should_close]-> absent (no emission)
//
// The notification cooldown is tracked separately from the state machine: a
// re-opened alert inside the cooldown window still transitions, but
// `should_notify` gates the outbound side. All state is owned by one session
// task; nothing here is shared across sessions.
// =============================================================================

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::rules::window::{DataPoint, TimeWindow};
use crate::rules::{
    AlertState, AlertStatus, BreakoutConfig, LimitConfig, MonitorRule, PriceChangeConfig,
    PriceDirection, RuleConfig, RuleType, VolumeSpikeConfig,
};
use crate::types::Quote;

/// Hysteresis factor between open and close thresholds.
const CLOSE_FACTOR: f64 = 0.95;

/// Cooldown bookkeeping is garbage-collected this often.
const COOLDOWN_GC_INTERVAL_MS: i64 = 60_000;

/// An OPEN transition surfaced to the caller.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub ts_code: String,
    pub stock_name: String,
    pub rule_id: String,
    pub rule_name: Option<String>,
    pub rule_type: RuleType,
    /// Rule-specific trigger snapshot.
    pub data: Value,
    /// Unix ms of the opening tick.
    pub opened_at: i64,
}

/// Outcome of evaluating one rule against one tick.
struct Evaluation {
    /// Present when the open condition holds; carries the trigger snapshot.
    open: Option<Value>,
    close: bool,
}

/// Stateful rule evaluator for a single session (or the server-side replay
/// context of a single user).
pub struct RuleEngine {
    windows: HashMap<String, TimeWindow>,
    states: HashMap<(String, RuleType), AlertState>,
    prev_prices: HashMap<String, f64>,
    notified_at: HashMap<(String, RuleType), i64>,
    window_secs: i64,
    compression_threshold_pct: f64,
    cooldown_ms: i64,
    last_gc_ms: i64,
}

impl RuleEngine {
    pub fn new(window_secs: i64, compression_threshold_pct: f64, cooldown_secs: i64) -> Self {
        Self {
            windows: HashMap::new(),
            states: HashMap::new(),
            prev_prices: HashMap::new(),
            notified_at: HashMap::new(),
            window_secs,
            compression_threshold_pct,
            cooldown_ms: cooldown_secs * 1000,
            last_gc_ms: 0,
        }
    }

    /// Evaluate all `rules` against one quote. Returns the OPEN transitions;
    /// holds and closes are silent.
    pub fn process_quote(&mut self, quote: &Quote, rules: &[MonitorRule]) -> Vec<AlertEvent> {
        let now = quote.timestamp;
        let prev_price = self.prev_prices.get(&quote.ts_code).copied();

        let window = self
            .windows
            .entry(quote.ts_code.clone())
            .or_insert_with(|| TimeWindow::new(self.window_secs, self.compression_threshold_pct));
        window.push(DataPoint {
            timestamp: now,
            price: quote.current_price,
            volume: quote.volume,
            change_percent: quote.change_percent,
        });

        let mut events = Vec::new();

        for rule in rules {
            let rule_type = rule.rule_type();
            let key = (quote.ts_code.clone(), rule_type);
            let window = &self.windows[&quote.ts_code];

            let eval = match &rule.config {
                RuleConfig::PriceChange(cfg) => eval_price_change(cfg, quote),
                RuleConfig::VolumeSpike(cfg) => eval_volume_spike(cfg, window, quote),
                RuleConfig::LimitUp(cfg) => eval_limit_up(cfg, quote),
                RuleConfig::LimitDown(cfg) => eval_limit_down(cfg, quote),
                RuleConfig::PriceBreakout(cfg) => eval_breakout(cfg, prev_price, quote),
            };

            if self.states.contains_key(&key) {
                if eval.close {
                    self.states.remove(&key);
                } else if let Some(state) = self.states.get_mut(&key) {
                    state.status = AlertStatus::Active;
                    state.last_check_time = now;
                }
            } else if let Some(data) = eval.open {
                self.states.insert(
                    key,
                    AlertState {
                        status: AlertStatus::Open,
                        open_time: now,
                        last_check_time: now,
                        trigger_data: data.clone(),
                    },
                );
                events.push(AlertEvent {
                    ts_code: quote.ts_code.clone(),
                    stock_name: quote.name.clone(),
                    rule_id: rule.id.clone(),
                    rule_name: rule.rule_name.clone(),
                    rule_type,
                    data,
                    opened_at: now,
                });
            }
        }

        self.prev_prices
            .insert(quote.ts_code.clone(), quote.current_price);
        events
    }

    /// Notification gate: true at most once per cooldown interval for each
    /// `(ts_code, rule_type)` key. Marks the key as notified when it passes.
    pub fn should_notify(&mut self, ts_code: &str, rule_type: RuleType, now_ms: i64) -> bool {
        self.gc_cooldowns(now_ms);

        let key = (ts_code.to_string(), rule_type);
        if let Some(last) = self.notified_at.get(&key) {
            if now_ms - last < self.cooldown_ms {
                return false;
            }
        }
        self.notified_at.insert(key, now_ms);
        true
    }

    fn gc_cooldowns(&mut self, now_ms: i64) {
        if now_ms - self.last_gc_ms < COOLDOWN_GC_INTERVAL_MS {
            return;
        }
        self.last_gc_ms = now_ms;
        let cooldown_ms = self.cooldown_ms;
        self.notified_at.retain(|_, last| now_ms - *last < cooldown_ms);
    }

    /// Current alert state for a key, if any.
    pub fn state_of(&self, ts_code: &str, rule_type: RuleType) -> Option<&AlertState> {
        self.states.get(&(ts_code.to_string(), rule_type))
    }

    /// Number of live (OPEN or ACTIVE) alert states.
    pub fn live_alert_count(&self) -> usize {
        self.states.len()
    }
}

// =============================================================================
// Per-kind evaluators
// =============================================================================

fn eval_price_change(cfg: &PriceChangeConfig, quote: &Quote) -> Evaluation {
    let magnitude = quote.change_percent.abs();
    let open = if magnitude >= cfg.threshold {
        Some(json!({
            "threshold": cfg.threshold,
            "changePercent": quote.change_percent,
            "currentPrice": quote.current_price,
            "open": quote.open,
        }))
    } else {
        None
    };
    Evaluation {
        open,
        close: magnitude < CLOSE_FACTOR * cfg.threshold,
    }
}

fn eval_volume_spike(cfg: &VolumeSpikeConfig, window: &TimeWindow, quote: &Quote) -> Evaluation {
    let inc_now = window.current_increment();
    let inc_avg = window.average_increment(cfg.period);
    let ratio = if inc_avg > 0.0 { inc_now / inc_avg } else { 0.0 };

    let mut opens = inc_avg > 0.0 && ratio >= cfg.multiplier;

    // Preset refinement: a signed price move past the threshold in the
    // configured direction must accompany the spike.
    if let (Some(threshold), Some(direction)) = (cfg.price_change_threshold, cfg.price_direction) {
        let direction_ok = match direction {
            PriceDirection::Up => quote.change_percent >= threshold,
            PriceDirection::Down => quote.change_percent <= -threshold,
        };
        opens = opens && direction_ok;
    }

    let open = opens.then(|| {
        json!({
            "incNow": inc_now,
            "incAvg": inc_avg,
            "ratio": ratio,
            "multiplier": cfg.multiplier,
            "period": cfg.period,
        })
    });

    Evaluation {
        open,
        close: ratio < CLOSE_FACTOR * cfg.multiplier,
    }
}

fn eval_limit_up(cfg: &LimitConfig, quote: &Quote) -> Evaluation {
    let limit = cfg.threshold * 0.99;
    let cp = quote.change_percent;
    let open = (cp >= limit).then(|| limit_data(cfg.threshold, limit, quote));
    Evaluation {
        open,
        close: cp < CLOSE_FACTOR * limit,
    }
}

fn eval_limit_down(cfg: &LimitConfig, quote: &Quote) -> Evaluation {
    let limit = -cfg.threshold * 0.99;
    let cp = quote.change_percent;
    let open = (cp <= limit).then(|| limit_data(cfg.threshold, limit, quote));
    Evaluation {
        open,
        // 0.95 x a negative limit sits closer to zero, so recovery past it
        // (upwards) closes the alert.
        close: cp > CLOSE_FACTOR * limit,
    }
}

fn limit_data(threshold: f64, limit: f64, quote: &Quote) -> Value {
    json!({
        "threshold": threshold,
        "changePercent": quote.change_percent,
        "currentPrice": quote.current_price,
        "limitThreshold": limit,
    })
}

fn eval_breakout(cfg: &BreakoutConfig, prev_price: Option<f64>, quote: &Quote) -> Evaluation {
    let b = cfg.breakout_price;
    let now = quote.current_price;

    let (crossed, back_on_start_side) = match cfg.breakout_direction {
        PriceDirection::Up => (prev_price.is_some_and(|p| p < b) && now >= b, now < b),
        PriceDirection::Down => (prev_price.is_some_and(|p| p > b) && now <= b, now > b),
    };

    let open = crossed.then(|| {
        json!({
            "breakoutPrice": b,
            "breakoutDirection": match cfg.breakout_direction {
                PriceDirection::Up => "up",
                PriceDirection::Down => "down",
            },
            "currentPrice": now,
            "previousPrice": prev_price,
        })
    });

    Evaluation {
        open,
        close: back_on_start_side,
    }
}

// =============================================================================
// Tests
// =============================================================================
