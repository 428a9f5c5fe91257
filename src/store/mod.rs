// =============================================================================
// Storage Seam — persisted records and their access traits
// =============================================================================
//
// Durable storage (users, watchlists, rules, alerts, settings) is an external
// collaborator; the gateway only depends on these traits. `memory.rs` ships
// the in-process reference implementation used by the server and the tests.

pub mod memory;

pub use memory::{MemoryMonitorStore, MemorySessionStore};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rules::{MonitorRule, RuleType};

// =============================================================================
// Records
// =============================================================================

/// A stock on a user's watchlist.
///
/// `cost_price` and `quantity` are either both present (and positive) or both
/// absent. Deleting a group nulls `group_ref` rather than cascading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedStock {
    pub user_id: String,
    pub ts_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    pub monitored: bool,
    /// Unix ms.
    pub added_at: i64,
}

impl WatchedStock {
    /// Position fields must be both present and positive, or both absent.
    pub fn position_is_valid(&self) -> bool {
        match (self.cost_price, self.quantity) {
            (None, None) => true,
            (Some(c), Some(q)) => c > 0.0 && q > 0.0,
            _ => false,
        }
    }
}

/// Scopes a rule to one watched stock. A rule applies only when this record
/// exists and `rule.enabled`, `association.enabled`, and `stock.monitored`
/// all hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRuleAssociation {
    pub user_id: String,
    pub ts_code: String,
    pub rule_id: String,
    pub enabled: bool,
}

/// Input to [`MonitorStore::insert_alert`].
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub user_id: String,
    pub ts_code: String,
    pub stock_name: String,
    pub rule_id: Option<String>,
    pub alert_type: RuleType,
    /// Unix ms of the opening tick.
    pub trigger_time: i64,
    pub trigger_data: Value,
    pub message: String,
}

/// A persisted alert, written exactly once per OPEN transition that reaches
/// the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub id: String,
    pub user_id: String,
    pub ts_code: String,
    pub stock_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub alert_type: RuleType,
    pub trigger_time: i64,
    pub trigger_data: Value,
    pub message: String,
    pub read: bool,
    pub notified: bool,
    pub created_at: i64,
}

/// A standard Web Push subscription object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Per-user outbound notification configuration. At most one per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub webhook_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_subscription: Option<PushSubscription>,
    pub browser_push_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours_end: Option<String>,
}

/// What the session store yields for a presented token.
#[derive(Debug, Clone)]
pub struct SessionClaims {
    pub user_id: String,
    /// Unix ms after which the token is invalid.
    pub expires_at: i64,
}

// =============================================================================
// Traits
// =============================================================================

/// Opaque-token session lookup used by the WebSocket auth handshake.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` for unknown or expired tokens.
    async fn lookup(&self, token: &str) -> Result<Option<SessionClaims>>;
}

/// Access to watchlists, rules, associations, alerts, and settings.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Users owning at least one monitored watched stock.
    async fn monitored_users(&self) -> Result<Vec<String>>;

    /// Monitored watchlist entries for one user.
    async fn monitored_stocks(&self, user_id: &str) -> Result<Vec<WatchedStock>>;

    /// Rules that apply to `(user, ts_code)`: the association exists and the
    /// rule, the association, and the watched stock are all enabled.
    async fn applicable_rules(&self, user_id: &str, ts_code: &str) -> Result<Vec<MonitorRule>>;

    /// Enable or disable every rule id in the set. Returns how many rules
    /// were actually updated.
    async fn set_rules_enabled(
        &self,
        user_id: &str,
        rule_ids: &[String],
        enabled: bool,
    ) -> Result<usize>;

    /// Persist an alert with `notified = false`; returns its primary key.
    async fn insert_alert(&self, alert: NewAlert) -> Result<String>;

    /// Flip `notified` on the record identified by the insert's primary key.
    async fn mark_alert_notified(&self, alert_id: &str) -> Result<()>;

    async fn unread_alerts(&self, user_id: &str) -> Result<Vec<AlertRecord>>;

    async fn mark_alert_read(&self, alert_id: &str) -> Result<()>;

    /// `Ok(None)` means all channels disabled.
    async fn notification_settings(&self, user_id: &str) -> Result<Option<NotificationSettings>>;

    /// Invalidate a user's push subscription after an endpoint-gone response.
    async fn mark_push_expired(&self, user_id: &str) -> Result<()>;

    /// Delete a watchlist group; member stocks keep their rows with a nulled
    /// `group_ref`.
    async fn delete_group(&self, user_id: &str, group_ref: &str) -> Result<usize>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn watched(cost: Option<f64>, qty: Option<f64>) -> WatchedStock {
        WatchedStock {
            user_id: "u1".into(),
            ts_code: "600519.SH".into(),
            group_ref: None,
            cost_price: cost,
            quantity: qty,
            monitored: true,
            added_at: 0,
        }
    }

    #[test]
    fn position_validity() {
        assert!(watched(None, None).position_is_valid());
        assert!(watched(Some(1680.0), Some(100.0)).position_is_valid());
        assert!(!watched(Some(1680.0), None).position_is_valid());
        assert!(!watched(None, Some(100.0)).position_is_valid());
        assert!(!watched(Some(0.0), Some(100.0)).position_is_valid());
        assert!(!watched(Some(1680.0), Some(-1.0)).position_is_valid());
    }

    #[test]
    fn push_subscription_matches_standard_shape() {
        let json = r#"{
            "endpoint": "https://push.example/abc",
            "keys": { "p256dh": "pk", "auth": "secret" }
        }"#;
        let sub: PushSubscription = serde_json::from_str(json).unwrap();
        assert_eq!(sub.keys.p256dh, "pk");
    }
}
