// =============================================================================
// Rules Module
// =============================================================================
//
// Monitor-rule model and the per-session evaluation engine:
// - Five rule kinds with structured, strictly-validated configs
// - Per (stock, kind) alert state machines with open/close hysteresis
// - Rolling TimeWindow feeding the volume-spike rule
// - Notification cooldown gate

pub mod engine;
pub mod history;
pub mod window;

pub use engine::{AlertEvent, RuleEngine};
pub use history::IntradayHistory;
pub use window::{DataPoint, TimeWindow};

use serde::{Deserialize, Serialize};

// =============================================================================
// Rule kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    PriceChange,
    VolumeSpike,
    LimitUp,
    LimitDown,
    PriceBreakout,
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PriceChange => "price_change",
            Self::VolumeSpike => "volume_spike",
            Self::LimitUp => "limit_up",
            Self::LimitDown => "limit_down",
            Self::PriceBreakout => "price_breakout",
        };
        write!(f, "{s}")
    }
}

/// Direction qualifier shared by the breakout rule and the volume-spike
/// price refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceDirection {
    Up,
    Down,
}

// =============================================================================
// Per-kind configs
// =============================================================================
//
// Unknown keys are rejected at the deserialization boundary, not left for the
// engine to trip over.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriceChangeConfig {
    /// Absolute change-percent threshold that opens the alert.
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeSpikeConfig {
    /// Open when current increment >= multiplier x trailing average.
    pub multiplier: f64,
    /// Averaging period in minutes.
    pub period: u32,
    /// Optional preset refinement: also require a signed price move past this
    /// threshold in `price_direction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_change_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_direction: Option<PriceDirection>,
}

fn default_limit_threshold() -> f64 {
    10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    /// Exchange limit percentage; the effective trigger is `threshold x 0.99`.
    #[serde(default = "default_limit_threshold")]
    pub threshold: f64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            threshold: default_limit_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BreakoutConfig {
    pub breakout_price: f64,
    pub breakout_direction: PriceDirection,
}

/// Tagged rule configuration, one arm per rule kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleConfig {
    PriceChange(PriceChangeConfig),
    VolumeSpike(VolumeSpikeConfig),
    LimitUp(LimitConfig),
    LimitDown(LimitConfig),
    PriceBreakout(BreakoutConfig),
}

impl RuleConfig {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::PriceChange(_) => RuleType::PriceChange,
            Self::VolumeSpike(_) => RuleType::VolumeSpike,
            Self::LimitUp(_) => RuleType::LimitUp,
            Self::LimitDown(_) => RuleType::LimitDown,
            Self::PriceBreakout(_) => RuleType::PriceBreakout,
        }
    }
}

// =============================================================================
// MonitorRule
// =============================================================================

/// A per-user alert rule. Whether it applies to a given stock is decided by
/// the stock-rule association in the store, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRule {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    pub enabled: bool,
    pub config: RuleConfig,
}

impl MonitorRule {
    pub fn rule_type(&self) -> RuleType {
        self.config.rule_type()
    }
}

// =============================================================================
// Alert lifecycle
// =============================================================================

/// Status of a live alert. `CLOSED` is represented by removing the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Open,
    Active,
}

/// In-memory state per `(ts_code, rule_type)` key.
#[derive(Debug, Clone)]
pub struct AlertState {
    pub status: AlertStatus,
    /// Unix ms of the tick that opened the alert.
    pub open_time: i64,
    /// Unix ms of the last evaluation that touched this state.
    pub last_check_time: i64,
    /// Rule-specific snapshot captured at open.
    pub trigger_data: serde_json::Value,
}

// =============================================================================
// Tests
// =============================================================================
