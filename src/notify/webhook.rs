// =============================================================================
// Webhook delivery — WeCom, DingTalk, and generic JSON targets
// =============================================================================
//
// The channel is detected from the URL: `qyapi.weixin.qq.com` is WeCom,
// `oapi.dingtalk.com` is DingTalk, anything else gets the generic payload.
// Bot channels report success through `errcode == 0` in the response body
// regardless of HTTP status; generic targets succeed on any 2xx.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::rules::engine::AlertEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookChannel {
    WeCom,
    DingTalk,
    Generic,
}

impl WebhookChannel {
    pub fn detect(url: &str) -> Self {
        if url.contains("qyapi.weixin.qq.com") {
            Self::WeCom
        } else if url.contains("oapi.dingtalk.com") {
            Self::DingTalk
        } else {
            Self::Generic
        }
    }
}

/// Deliver one alert to a webhook target. `Ok(())` means the channel
/// acknowledged the message; any failure is reported by return for the
/// dispatcher to record.
pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    event: &AlertEvent,
    message: &str,
) -> Result<()> {
    let channel = WebhookChannel::detect(url);
    let body = match channel {
        WebhookChannel::WeCom | WebhookChannel::DingTalk => json!({
            "msgtype": "text",
            "text": { "content": message },
        }),
        WebhookChannel::Generic => json!({
            "alertType": event.rule_type,
            "stockCode": event.ts_code,
            "stockName": event.stock_name,
            "triggerData": event.data,
            "timestamp": iso8601(event.opened_at),
            "message": message,
        }),
    };

    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .context("webhook request failed")?;
    let status = resp.status();

    match channel {
        WebhookChannel::WeCom | WebhookChannel::DingTalk => {
            let reply: serde_json::Value = resp
                .json()
                .await
                .context("failed to parse bot webhook reply")?;
            let errcode = reply.get("errcode").and_then(|v| v.as_i64()).unwrap_or(-1);
            if errcode != 0 {
                let errmsg = reply
                    .get("errmsg")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                warn!(?channel, errcode, errmsg, "bot webhook rejected message");
                anyhow::bail!("bot webhook errcode {errcode}: {errmsg}");
            }
        }
        WebhookChannel::Generic => {
            if !status.is_success() {
                warn!(%status, "generic webhook returned non-2xx");
                anyhow::bail!("generic webhook returned {status}");
            }
        }
    }

    debug!(?channel, ts_code = %event.ts_code, "webhook delivered");
    Ok(())
}

/// Unix ms to an ISO-8601 UTC string.
fn iso8601(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

// =============================================================================
// Tests
// =============================================================================
