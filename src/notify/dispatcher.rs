// =============================================================================
// Notification Dispatcher — alert persistence and outbound fan-out
// =============================================================================
//
// Invoked for every alert OPEN that the server-side replay path decides to
// notify. The sequence is fixed:
//
//   1. Insert the alert record (notified = false) and keep its primary key.
//   2. Load the user's notification settings; absent settings mean every
//      channel is disabled (the record still persists for the UI).
//   3. Webhook, then Web Push, each only when enabled and configured.
//   4. Flip `notified` by the primary key from step 1 once at least one
//      channel succeeded.
//
// Channel failures never unwind: they are recorded and the next alert tries
// again. A gone push endpoint additionally clears the stored subscription.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::VapidConfig;
use crate::notify::webhook;
use crate::notify::webpush::{PushOutcome, WebPushSender};
use crate::notify::{alert_title, format_alert_message};
use crate::rules::engine::AlertEvent;
use crate::store::{MonitorStore, NewAlert};

/// Outbound webhook deadline.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// What happened to one dispatched alert.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Primary key of the persisted alert record.
    pub alert_id: String,
    pub message: String,
    pub webhook_delivered: bool,
    pub push_delivered: bool,
}

pub struct NotificationDispatcher {
    store: Arc<dyn MonitorStore>,
    http: reqwest::Client,
    push: Option<WebPushSender>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn MonitorStore>, vapid: Option<VapidConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        let push = vapid.and_then(|cfg| match WebPushSender::new(cfg) {
            Ok(sender) => Some(sender),
            Err(e) => {
                warn!(error = %e, "web push disabled: sender construction failed");
                None
            }
        });

        Self { store, http, push }
    }

    /// Persist and fan out one alert OPEN for `user_id`.
    pub async fn dispatch(&self, user_id: &str, event: &AlertEvent) -> Result<DispatchReport> {
        let message = format_alert_message(event);
        let title = alert_title(event.rule_type);

        let alert_id = self
            .store
            .insert_alert(NewAlert {
                user_id: user_id.to_string(),
                ts_code: event.ts_code.clone(),
                stock_name: event.stock_name.clone(),
                rule_id: Some(event.rule_id.clone()),
                alert_type: event.rule_type,
                trigger_time: event.opened_at,
                trigger_data: event.data.clone(),
                message: message.clone(),
            })
            .await
            .context("failed to persist alert record")?;

        let settings = match self.store.notification_settings(user_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(user_id, error = %e, "failed to load notification settings");
                None
            }
        };

        let mut report = DispatchReport {
            alert_id: alert_id.clone(),
            message: message.clone(),
            webhook_delivered: false,
            push_delivered: false,
        };

        let Some(settings) = settings else {
            debug!(user_id, ts_code = %event.ts_code, "no notification settings; record persisted only");
            return Ok(report);
        };

        // ── Webhook ─────────────────────────────────────────────────────
        if settings.webhook_enabled {
            if let Some(url) = settings.webhook_url.as_deref() {
                match webhook::deliver(&self.http, url, event, &message).await {
                    Ok(()) => report.webhook_delivered = true,
                    Err(e) => {
                        warn!(user_id, ts_code = %event.ts_code, error = %e, "webhook delivery failed");
                    }
                }
            }
        }

        // ── Web Push ────────────────────────────────────────────────────
        if settings.browser_push_enabled {
            if let (Some(subscription), Some(push)) =
                (settings.push_subscription.as_ref(), self.push.as_ref())
            {
                match push.send(subscription, event, title, &message).await {
                    PushOutcome::Delivered => report.push_delivered = true,
                    PushOutcome::Expired => {
                        if let Err(e) = self.store.mark_push_expired(user_id).await {
                            warn!(user_id, error = %e, "failed to clear expired push subscription");
                        }
                    }
                    PushOutcome::Failed => {}
                }
            }
        }

        if report.webhook_delivered || report.push_delivered {
            // Update by the primary key returned from the insert, never by a
            // reconstructed predicate.
            if let Err(e) = self.store.mark_alert_notified(&alert_id).await {
                warn!(user_id, alert_id = %alert_id, error = %e, "failed to mark alert notified");
            }
        }

        info!(
            user_id,
            ts_code = %event.ts_code,
            rule_type = %event.rule_type,
            webhook = report.webhook_delivered,
            push = report.push_delivered,
            "alert dispatched"
        );
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleType;
    use crate::store::{MemoryMonitorStore, NotificationSettings};
    use serde_json::json;

    fn event() -> AlertEvent {
        AlertEvent {
            ts_code: "000001.SZ".into(),
            stock_name: "平安银行".into(),
            rule_id: "r1".into(),
            rule_name: None,
            rule_type: RuleType::LimitUp,
            data: json!({"changePercent": 9.9, "threshold": 10.0}),
            opened_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn absent_settings_persists_record_without_channels() {
        let store = Arc::new(MemoryMonitorStore::new());
        let dispatcher = NotificationDispatcher::new(store.clone(), None);

        let report = dispatcher.dispatch("u1", &event()).await.unwrap();

        assert!(!report.webhook_delivered);
        assert!(!report.push_delivered);
        let record = store.alert(&report.alert_id).expect("record persisted");
        assert!(!record.notified);
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.alert_type, RuleType::LimitUp);
        assert_eq!(record.trigger_time, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn disabled_channels_are_skipped() {
        let store = Arc::new(MemoryMonitorStore::new());
        store.put_settings(NotificationSettings {
            user_id: "u1".into(),
            webhook_url: Some("https://hooks.example.com/x".into()),
            webhook_enabled: false,
            push_subscription: None,
            browser_push_enabled: false,
            quiet_hours_start: None,
            quiet_hours_end: None,
        });
        let dispatcher = NotificationDispatcher::new(store.clone(), None);

        let report = dispatcher.dispatch("u1", &event()).await.unwrap();
        assert!(!report.webhook_delivered);
        assert!(!store.alert(&report.alert_id).unwrap().notified);
    }

    #[tokio::test]
    async fn each_open_writes_exactly_one_record() {
        let store = Arc::new(MemoryMonitorStore::new());
        let dispatcher = NotificationDispatcher::new(store.clone(), None);

        dispatcher.dispatch("u1", &event()).await.unwrap();
        dispatcher.dispatch("u1", &event()).await.unwrap();
        assert_eq!(store.alert_count(), 2);
    }
}
