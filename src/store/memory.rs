// =============================================================================
// In-memory store — reference implementation of the storage traits
// =============================================================================
//
// Backs the gateway when no external database is wired in, and every test
// that needs a store. All maps live behind parking_lot locks; methods copy
// data out so no lock is held across an await point.
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::rules::MonitorRule;
use crate::store::{
    AlertRecord, MonitorStore, NewAlert, NotificationSettings, SessionClaims, SessionStore,
    StockRuleAssociation, WatchedStock,
};

// =============================================================================
// Session store
// =============================================================================

/// Token -> claims map with expiry checking.
#[derive(Default)]
pub struct MemorySessionStore {
    tokens: RwLock<HashMap<String, SessionClaims>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token. Used by tests and by deployments that provision
    /// sessions out of band.
    pub fn issue(&self, token: impl Into<String>, user_id: impl Into<String>, expires_at: i64) {
        self.tokens.write().insert(
            token.into(),
            SessionClaims {
                user_id: user_id.into(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn lookup(&self, token: &str) -> Result<Option<SessionClaims>> {
        let claims = self.tokens.read().get(token).cloned();
        Ok(claims.filter(|c| c.expires_at > Utc::now().timestamp_millis()))
    }
}

// =============================================================================
// Monitor store
// =============================================================================

#[derive(Default)]
struct Tables {
    /// Keyed by (user_id, ts_code).
    watched: HashMap<(String, String), WatchedStock>,
    /// Keyed by rule id.
    rules: HashMap<String, MonitorRule>,
    /// Keyed by (user_id, ts_code, rule_id).
    associations: HashMap<(String, String, String), StockRuleAssociation>,
    /// Keyed by alert id, insertion-ordered ids on the side.
    alerts: HashMap<String, AlertRecord>,
    alert_order: Vec<String>,
    settings: HashMap<String, NotificationSettings>,
}

#[derive(Default)]
pub struct MemoryMonitorStore {
    tables: RwLock<Tables>,
}

impl MemoryMonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding helpers (server bootstrap and tests) ────────────────────

    pub fn upsert_watched(&self, stock: WatchedStock) -> Result<()> {
        if !stock.position_is_valid() {
            bail!(
                "watched stock {} has an invalid cost/quantity pair",
                stock.ts_code
            );
        }
        let key = (stock.user_id.clone(), stock.ts_code.clone());
        self.tables.write().watched.insert(key, stock);
        Ok(())
    }

    pub fn upsert_rule(&self, rule: MonitorRule) {
        self.tables.write().rules.insert(rule.id.clone(), rule);
    }

    pub fn upsert_association(&self, assoc: StockRuleAssociation) {
        let key = (
            assoc.user_id.clone(),
            assoc.ts_code.clone(),
            assoc.rule_id.clone(),
        );
        self.tables.write().associations.insert(key, assoc);
    }

    pub fn put_settings(&self, settings: NotificationSettings) {
        self.tables
            .write()
            .settings
            .insert(settings.user_id.clone(), settings);
    }

    pub fn alert(&self, alert_id: &str) -> Option<AlertRecord> {
        self.tables.read().alerts.get(alert_id).cloned()
    }

    pub fn alert_count(&self) -> usize {
        self.tables.read().alerts.len()
    }
}

#[async_trait]
impl MonitorStore for MemoryMonitorStore {
    async fn monitored_users(&self) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let mut users: Vec<String> = tables
            .watched
            .values()
            .filter(|w| w.monitored)
            .map(|w| w.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn monitored_stocks(&self, user_id: &str) -> Result<Vec<WatchedStock>> {
        let tables = self.tables.read();
        let mut stocks: Vec<WatchedStock> = tables
            .watched
            .values()
            .filter(|w| w.user_id == user_id && w.monitored)
            .cloned()
            .collect();
        stocks.sort_by(|a, b| a.ts_code.cmp(&b.ts_code));
        Ok(stocks)
    }

    async fn applicable_rules(&self, user_id: &str, ts_code: &str) -> Result<Vec<MonitorRule>> {
        let tables = self.tables.read();

        let monitored = tables
            .watched
            .get(&(user_id.to_string(), ts_code.to_string()))
            .is_some_and(|w| w.monitored);
        if !monitored {
            return Ok(Vec::new());
        }

        let mut rules: Vec<MonitorRule> = tables
            .associations
            .values()
            .filter(|a| a.user_id == user_id && a.ts_code == ts_code && a.enabled)
            .filter_map(|a| tables.rules.get(&a.rule_id))
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn set_rules_enabled(
        &self,
        user_id: &str,
        rule_ids: &[String],
        enabled: bool,
    ) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut updated = 0;
        for id in rule_ids {
            if let Some(rule) = tables.rules.get_mut(id) {
                if rule.user_id == user_id {
                    rule.enabled = enabled;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn insert_alert(&self, alert: NewAlert) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let record = AlertRecord {
            id: id.clone(),
            user_id: alert.user_id,
            ts_code: alert.ts_code,
            stock_name: alert.stock_name,
            rule_id: alert.rule_id,
            alert_type: alert.alert_type,
            trigger_time: alert.trigger_time,
            trigger_data: alert.trigger_data,
            message: alert.message,
            read: false,
            notified: false,
            created_at: Utc::now().timestamp_millis(),
        };
        let mut tables = self.tables.write();
        tables.alerts.insert(id.clone(), record);
        tables.alert_order.push(id.clone());
        Ok(id)
    }

    async fn mark_alert_notified(&self, alert_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.alerts.get_mut(alert_id) {
            Some(record) => {
                record.notified = true;
                Ok(())
            }
            None => bail!("alert {alert_id} not found"),
        }
    }

    async fn unread_alerts(&self, user_id: &str) -> Result<Vec<AlertRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .alert_order
            .iter()
            .filter_map(|id| tables.alerts.get(id))
            .filter(|a| a.user_id == user_id && !a.read)
            .cloned()
            .collect())
    }

    async fn mark_alert_read(&self, alert_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.alerts.get_mut(alert_id) {
            Some(record) => {
                record.read = true;
                Ok(())
            }
            None => bail!("alert {alert_id} not found"),
        }
    }

    async fn notification_settings(&self, user_id: &str) -> Result<Option<NotificationSettings>> {
        Ok(self.tables.read().settings.get(user_id).cloned())
    }

    async fn mark_push_expired(&self, user_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(settings) = tables.settings.get_mut(user_id) {
            settings.push_subscription = None;
            settings.browser_push_enabled = false;
        }
        Ok(())
    }

    async fn delete_group(&self, user_id: &str, group_ref: &str) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut nulled = 0;
        for stock in tables.watched.values_mut() {
            if stock.user_id == user_id && stock.group_ref.as_deref() == Some(group_ref) {
                stock.group_ref = None;
                nulled += 1;
            }
        }
        Ok(nulled)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{PriceChangeConfig, RuleConfig, RuleType};
    use serde_json::json;

    fn watched(user: &str, code: &str, monitored: bool) -> WatchedStock {
        WatchedStock {
            user_id: user.into(),
            ts_code: code.into(),
            group_ref: None,
            cost_price: None,
            quantity: None,
            monitored,
            added_at: 0,
        }
    }

    fn rule(id: &str, user: &str, enabled: bool) -> MonitorRule {
        MonitorRule {
            id: id.into(),
            user_id: user.into(),
            rule_name: None,
            enabled,
            config: RuleConfig::PriceChange(PriceChangeConfig { threshold: 5.0 }),
        }
    }

    fn assoc(user: &str, code: &str, rule_id: &str, enabled: bool) -> StockRuleAssociation {
        StockRuleAssociation {
            user_id: user.into(),
            ts_code: code.into(),
            rule_id: rule_id.into(),
            enabled,
        }
    }

    fn new_alert(user: &str) -> NewAlert {
        NewAlert {
            user_id: user.into(),
            ts_code: "600519.SH".into(),
            stock_name: "贵州茅台".into(),
            rule_id: Some("r1".into()),
            alert_type: RuleType::PriceChange,
            trigger_time: 1_700_000_000_000,
            trigger_data: json!({"changePercent": 5.2}),
            message: "price moved".into(),
        }
    }

    #[tokio::test]
    async fn session_lookup_respects_expiry() {
        let store = MemorySessionStore::new();
        let future = Utc::now().timestamp_millis() + 60_000;
        let past = Utc::now().timestamp_millis() - 60_000;
        store.issue("good", "u1", future);
        store.issue("stale", "u1", past);

        assert_eq!(store.lookup("good").await.unwrap().unwrap().user_id, "u1");
        assert!(store.lookup("stale").await.unwrap().is_none());
        assert!(store.lookup("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn applicable_rules_requires_all_three_flags() {
        let store = MemoryMonitorStore::new();
        store.upsert_watched(watched("u1", "600519.SH", true)).unwrap();
        store.upsert_rule(rule("r1", "u1", true));
        store.upsert_association(assoc("u1", "600519.SH", "r1", true));

        assert_eq!(store.applicable_rules("u1", "600519.SH").await.unwrap().len(), 1);

        // Disabled rule.
        store.upsert_rule(rule("r1", "u1", false));
        assert!(store.applicable_rules("u1", "600519.SH").await.unwrap().is_empty());
        store.upsert_rule(rule("r1", "u1", true));

        // Disabled association.
        store.upsert_association(assoc("u1", "600519.SH", "r1", false));
        assert!(store.applicable_rules("u1", "600519.SH").await.unwrap().is_empty());
        store.upsert_association(assoc("u1", "600519.SH", "r1", true));

        // Unmonitored stock.
        store.upsert_watched(watched("u1", "600519.SH", false)).unwrap();
        assert!(store.applicable_rules("u1", "600519.SH").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn association_scopes_rules_per_stock() {
        let store = MemoryMonitorStore::new();
        store.upsert_watched(watched("u1", "600519.SH", true)).unwrap();
        store.upsert_watched(watched("u1", "000001.SZ", true)).unwrap();
        store.upsert_rule(rule("r1", "u1", true));
        store.upsert_association(assoc("u1", "600519.SH", "r1", true));

        // No association for the second stock: the rule does not leak to it.
        assert_eq!(store.applicable_rules("u1", "600519.SH").await.unwrap().len(), 1);
        assert!(store.applicable_rules("u1", "000001.SZ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_rules_enabled_touches_every_id() {
        let store = MemoryMonitorStore::new();
        store.upsert_rule(rule("r1", "u1", true));
        store.upsert_rule(rule("r2", "u1", true));
        store.upsert_rule(rule("r3", "u2", true));

        let updated = store
            .set_rules_enabled("u1", &["r1".into(), "r2".into(), "r3".into(), "nope".into()], false)
            .await
            .unwrap();

        // r3 belongs to another user; "nope" does not exist.
        assert_eq!(updated, 2);
    }

    #[tokio::test]
    async fn insert_then_mark_notified_by_returned_key() {
        let store = MemoryMonitorStore::new();
        let id = store.insert_alert(new_alert("u1")).await.unwrap();

        let record = store.alert(&id).unwrap();
        assert!(!record.notified);
        assert!(!record.read);

        store.mark_alert_notified(&id).await.unwrap();
        assert!(store.alert(&id).unwrap().notified);

        assert!(store.mark_alert_notified("missing").await.is_err());
    }

    #[tokio::test]
    async fn unread_alerts_and_mark_read() {
        let store = MemoryMonitorStore::new();
        let a = store.insert_alert(new_alert("u1")).await.unwrap();
        let _b = store.insert_alert(new_alert("u1")).await.unwrap();
        store.insert_alert(new_alert("u2")).await.unwrap();

        assert_eq!(store.unread_alerts("u1").await.unwrap().len(), 2);
        store.mark_alert_read(&a).await.unwrap();
        assert_eq!(store.unread_alerts("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn push_expiry_clears_subscription() {
        use crate::store::{NotificationSettings, PushKeys, PushSubscription};
        let store = MemoryMonitorStore::new();
        store.put_settings(NotificationSettings {
            user_id: "u1".into(),
            webhook_url: None,
            webhook_enabled: false,
            push_subscription: Some(PushSubscription {
                endpoint: "https://push.example/x".into(),
                keys: PushKeys {
                    p256dh: "pk".into(),
                    auth: "a".into(),
                },
            }),
            browser_push_enabled: true,
            quiet_hours_start: None,
            quiet_hours_end: None,
        });

        store.mark_push_expired("u1").await.unwrap();
        let settings = store.notification_settings("u1").await.unwrap().unwrap();
        assert!(settings.push_subscription.is_none());
        assert!(!settings.browser_push_enabled);
    }

    #[tokio::test]
    async fn delete_group_nulls_refs_without_deleting() {
        let store = MemoryMonitorStore::new();
        let mut stock = watched("u1", "600519.SH", true);
        stock.group_ref = Some("tech".into());
        store.upsert_watched(stock).unwrap();

        let nulled = store.delete_group("u1", "tech").await.unwrap();
        assert_eq!(nulled, 1);
        let stocks = store.monitored_stocks("u1").await.unwrap();
        assert_eq!(stocks.len(), 1);
        assert!(stocks[0].group_ref.is_none());
    }

    #[test]
    fn upsert_watched_rejects_invalid_position() {
        let store = MemoryMonitorStore::new();
        let mut stock = watched("u1", "600519.SH", true);
        stock.cost_price = Some(10.0);
        assert!(store.upsert_watched(stock).is_err());
    }
}
