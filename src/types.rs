// =============================================================================
// Shared types used across the stockpulse gateway
// =============================================================================

use serde::{Deserialize, Serialize};

/// A snapshot of a single stock at an instant, as delivered to subscribers.
///
/// `change` and `change_percent` are derived at parse time:
/// `change = current_price - pre_close`, and
/// `change_percent = change / pre_close * 100` when `pre_close > 0`, else 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Exchange-qualified code, e.g. `600519.SH`.
    pub ts_code: String,
    /// Display name as reported by the upstream (may contain CJK characters).
    pub name: String,
    pub current_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub pre_close: f64,
    /// Cumulative traded volume for the day, in shares.
    pub volume: f64,
    /// Cumulative traded amount for the day, in CNY.
    pub amount: f64,
    pub change: f64,
    pub change_percent: f64,
    /// Unix milliseconds at adapter receive time.
    pub timestamp: i64,
    /// Trade date as reported upstream (`YYYY-MM-DD`).
    pub trade_date: String,
    /// Trade time as reported upstream (`HH:MM:SS`).
    pub trade_time: String,
}

impl Quote {
    /// Recompute the derived change fields from `current_price` and
    /// `pre_close`. A non-positive `pre_close` yields zero for both.
    pub fn with_derived_change(mut self) -> Self {
        if self.pre_close > 0.0 {
            self.change = self.current_price - self.pre_close;
            self.change_percent = self.change / self.pre_close * 100.0;
        } else {
            self.change = 0.0;
            self.change_percent = 0.0;
        }
        self
    }
}

/// The three Chinese exchanges the gateway covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    SH,
    SZ,
    BJ,
}

impl Exchange {
    /// Parse an exchange suffix, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SH" => Some(Self::SH),
            "SZ" => Some(Self::SZ),
            "BJ" => Some(Self::BJ),
            _ => None,
        }
    }

    /// Lowercase prefix used by the upstream quote provider.
    pub fn upstream_prefix(&self) -> &'static str {
        match self {
            Self::SH => "sh",
            Self::SZ => "sz",
            Self::BJ => "bj",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SH => write!(f, "SH"),
            Self::SZ => write!(f, "SZ"),
            Self::BJ => write!(f, "BJ"),
        }
    }
}

/// Validate and normalise an exchange-qualified code (`600519.SH`).
///
/// Accepts lowercase suffixes; returns the canonical uppercase form, or `None`
/// when the input does not match `\d{6}.(SH|SZ|BJ)`.
pub fn normalize_ts_code(raw: &str) -> Option<String> {
    let (symbol, suffix) = raw.split_once('.')?;
    if symbol.len() != 6 || !symbol.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let exchange = Exchange::parse(suffix)?;
    Some(format!("{symbol}.{exchange}"))
}

/// Split a valid ts-code into `(symbol, exchange)`. Callers must pass codes
/// that already went through [`normalize_ts_code`].
pub fn split_ts_code(ts_code: &str) -> Option<(&str, Exchange)> {
    let (symbol, suffix) = ts_code.split_once('.')?;
    Some((symbol, Exchange::parse(suffix)?))
}

/// Severity attached to `alert` frames pushed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

// =============================================================================
// Tests
// =============================================================================
