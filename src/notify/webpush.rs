// =============================================================================
// Web Push delivery — VAPID-signed browser notifications
// =============================================================================
//
// Standard Web Push (RFC 8030/8291) through the `web-push` crate. A 410-style
// "endpoint gone" response is surfaced as `Expired` so the caller can clear
// the stored subscription; other failures are plain failures and will be
// retried on the next alert.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, warn};
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder, URL_SAFE_NO_PAD,
};

use crate::config::VapidConfig;
use crate::rules::engine::AlertEvent;
use crate::store::PushSubscription;

/// Outcome of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The push service reported the subscription gone; clear it.
    Expired,
    Failed,
}

pub struct WebPushSender {
    vapid: VapidConfig,
    client: IsahcWebPushClient,
}

impl WebPushSender {
    pub fn new(vapid: VapidConfig) -> Result<Self> {
        let client = IsahcWebPushClient::new().context("failed to build web push client")?;
        Ok(Self { vapid, client })
    }

    /// Send one alert notification to a subscription.
    pub async fn send(
        &self,
        subscription: &PushSubscription,
        event: &AlertEvent,
        title: &str,
        message: &str,
    ) -> PushOutcome {
        let info = SubscriptionInfo::new(
            subscription.endpoint.clone(),
            subscription.keys.p256dh.clone(),
            subscription.keys.auth.clone(),
        );

        let payload = json!({
            "title": title,
            "body": message,
            "tag": format!("{}-{}", event.ts_code, event.rule_type),
            "requireInteraction": true,
            "data": {
                "alertType": event.rule_type,
                "stockCode": event.ts_code,
                "stockName": event.stock_name,
                "triggerData": event.data,
                "url": "/alerts",
            },
        })
        .to_string();

        let signature = match VapidSignatureBuilder::from_base64(
            &self.vapid.private_key,
            URL_SAFE_NO_PAD,
            &info,
        ) {
            Ok(mut builder) => {
                builder.add_claim("sub", self.vapid.subject.clone());
                match builder.build() {
                    Ok(sig) => sig,
                    Err(e) => {
                        warn!(error = %e, "failed to build VAPID signature");
                        return PushOutcome::Failed;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "invalid VAPID key material");
                return PushOutcome::Failed;
            }
        };

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload.as_bytes());
        builder.set_vapid_signature(signature);

        let push_message = match builder.build() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to build push message");
                return PushOutcome::Failed;
            }
        };

        match self.client.send(push_message).await {
            Ok(()) => {
                debug!(ts_code = %event.ts_code, "web push delivered");
                PushOutcome::Delivered
            }
            Err(WebPushError::EndpointNotValid) | Err(WebPushError::EndpointNotFound) => {
                warn!(endpoint = %subscription.endpoint, "push subscription gone");
                PushOutcome::Expired
            }
            Err(e) => {
                warn!(error = %e, "web push delivery failed");
                PushOutcome::Failed
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleType;
    use serde_json::Value;

    #[test]
    fn payload_shape_matches_contract() {
        // The payload is assembled inline in `send`; mirror it here so the
        // contract shape is pinned by a test.
        let event = AlertEvent {
            ts_code: "600519.SH".into(),
            stock_name: "贵州茅台".into(),
            rule_id: "r1".into(),
            rule_name: None,
            rule_type: RuleType::LimitUp,
            data: json!({"changePercent": 9.9}),
            opened_at: 0,
        };
        let payload = json!({
            "title": "Limit up",
            "body": "msg",
            "tag": format!("{}-{}", event.ts_code, event.rule_type),
            "requireInteraction": true,
            "data": {
                "alertType": event.rule_type,
                "stockCode": event.ts_code,
                "stockName": event.stock_name,
                "triggerData": event.data,
                "url": "/alerts",
            },
        });

        let v: Value = payload;
        assert_eq!(v["tag"], "600519.SH-limit_up");
        assert_eq!(v["requireInteraction"], true);
        assert_eq!(v["data"]["alertType"], "limit_up");
        assert_eq!(v["data"]["stockCode"], "600519.SH");
    }
}
