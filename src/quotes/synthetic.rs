// =============================================================================
// Synthetic Quote Source — deterministic generator for WS_TEST_MODE
// =============================================================================
//
// Serves five fixed instruments and cycles each through three regimes so the
// full alerting surface can be exercised without the live upstream:
//
//   normal -> volume spike -> limit move -> normal -> ...
//
// Each regime lasts `REGIME_TICKS` fetches. Values are deterministic
// functions of the tick counter, so test runs are reproducible.
// =============================================================================

use chrono::Utc;
use parking_lot::Mutex;

use crate::quotes::{FetchOutcome, QuoteSource};
use crate::types::Quote;

/// Fetches per regime phase.
const REGIME_TICKS: u64 = 60;

/// The five instruments the generator serves.
const INSTRUMENTS: &[(&str, &str, f64)] = &[
    ("600519.SH", "贵州茅台", 1680.0),
    ("000001.SZ", "平安银行", 10.50),
    ("600036.SH", "招商银行", 32.00),
    ("300750.SZ", "宁德时代", 185.0),
    ("830799.BJ", "艾融软件", 14.20),
];

#[derive(Debug, Clone, Copy)]
enum Regime {
    Normal,
    Spike,
    Limit,
}

struct State {
    tick: u64,
    /// Cumulative volume per instrument, indexed like `INSTRUMENTS`.
    volumes: [f64; 5],
}

pub struct SyntheticQuoteSource {
    state: Mutex<State>,
}

impl SyntheticQuoteSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tick: 0,
                volumes: [0.0; 5],
            }),
        }
    }

    fn regime_for(tick: u64) -> Regime {
        match (tick / REGIME_TICKS) % 3 {
            0 => Regime::Normal,
            1 => Regime::Spike,
            _ => Regime::Limit,
        }
    }

    /// Change-percent for one instrument at one tick.
    fn change_percent(regime: Regime, tick: u64, idx: usize) -> f64 {
        match regime {
            // Small sawtooth around flat: -0.4 % .. +0.5 %.
            Regime::Normal => ((tick % 10) as f64 - 4.0) / 10.0,
            // Decisive move; odd instruments fall so both spike directions
            // are covered.
            Regime::Spike => {
                if idx % 2 == 0 {
                    3.5
                } else {
                    -3.5
                }
            }
            Regime::Limit => {
                if idx % 2 == 0 {
                    9.9
                } else {
                    -9.9
                }
            }
        }
    }

    fn volume_step(regime: Regime, base_price: f64) -> f64 {
        // Cheaper stocks trade more shares; spikes trade eight times as much.
        let base = 1_000_000.0 / base_price;
        match regime {
            Regime::Spike => base * 8.0,
            _ => base,
        }
    }
}

impl Default for SyntheticQuoteSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl QuoteSource for SyntheticQuoteSource {
    async fn fetch_batch(&self, codes: &[String]) -> FetchOutcome {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let regime = Self::regime_for(tick);

        let mut outcome = FetchOutcome::default();
        for code in codes {
            let Some(idx) = INSTRUMENTS.iter().position(|(c, _, _)| c == code) else {
                outcome.failed.push(code.clone());
                continue;
            };
            let (ts_code, name, base) = INSTRUMENTS[idx];

            state.volumes[idx] += Self::volume_step(regime, base);
            let cp = Self::change_percent(regime, tick, idx);
            let price = base * (1.0 + cp / 100.0);

            let quote = Quote {
                ts_code: ts_code.to_string(),
                name: name.to_string(),
                current_price: price,
                open: base,
                high: price.max(base),
                low: price.min(base),
                pre_close: base,
                volume: state.volumes[idx],
                amount: state.volumes[idx] * price,
                change: 0.0,
                change_percent: 0.0,
                timestamp: now_ms,
                trade_date: String::new(),
                trade_time: String::new(),
            }
            .with_derived_change();
            outcome.quotes.insert(ts_code.to_string(), quote);
        }
        outcome
    }
}

// =============================================================================
// Tests
// =============================================================================
