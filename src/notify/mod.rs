// =============================================================================
// Notification Module
// =============================================================================
//
// Outbound alert delivery:
// - Dispatcher: persist the alert record, then fan out to webhook / Web Push
// - Webhook: WeCom, DingTalk, generic JSON
// - Web Push: VAPID-signed browser notifications
// - Trading-hours gate for the scheduled replay path

pub mod dispatcher;
pub mod trading_hours;
pub mod webhook;
pub mod webpush;

pub use dispatcher::NotificationDispatcher;
pub use webpush::{PushOutcome, WebPushSender};

use crate::rules::engine::AlertEvent;
use crate::rules::RuleType;
use crate::types::Severity;

/// Short human title per rule kind.
pub fn alert_title(rule_type: RuleType) -> &'static str {
    match rule_type {
        RuleType::PriceChange => "Price move",
        RuleType::VolumeSpike => "Volume spike",
        RuleType::LimitUp => "Limit up",
        RuleType::LimitDown => "Limit down",
        RuleType::PriceBreakout => "Price breakout",
    }
}

/// Severity shown on in-session `alert` frames. Limit moves outrank the rest.
pub fn severity_of(rule_type: RuleType) -> Severity {
    match rule_type {
        RuleType::LimitUp | RuleType::LimitDown => Severity::Warning,
        _ => Severity::Info,
    }
}

/// One-line human message for webhook text bodies and push notifications.
pub fn format_alert_message(event: &AlertEvent) -> String {
    let subject = format!("{} ({})", event.stock_name, event.ts_code);
    let d = &event.data;
    match event.rule_type {
        RuleType::PriceChange => format!(
            "{subject} moved {:+.2}%, past the {:.2}% threshold (price {:.2})",
            d["changePercent"].as_f64().unwrap_or(0.0),
            d["threshold"].as_f64().unwrap_or(0.0),
            d["currentPrice"].as_f64().unwrap_or(0.0),
        ),
        RuleType::VolumeSpike => format!(
            "{subject} volume running {:.1}x the {}-minute average",
            d["ratio"].as_f64().unwrap_or(0.0),
            d["period"].as_u64().unwrap_or(0),
        ),
        RuleType::LimitUp => format!(
            "{subject} up {:+.2}%, at the daily limit",
            d["changePercent"].as_f64().unwrap_or(0.0),
        ),
        RuleType::LimitDown => format!(
            "{subject} down {:+.2}%, at the daily limit",
            d["changePercent"].as_f64().unwrap_or(0.0),
        ),
        RuleType::PriceBreakout => {
            let direction = if d["breakoutDirection"] == "up" {
                "above"
            } else {
                "below"
            };
            format!(
                "{subject} broke {direction} {:.2} (now {:.2})",
                d["breakoutPrice"].as_f64().unwrap_or(0.0),
                d["currentPrice"].as_f64().unwrap_or(0.0),
            )
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
