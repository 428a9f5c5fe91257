// =============================================================================
// WebSocket Message Codec — JSON text frames
// =============================================================================
//
// Adjacently tagged (`type` / `payload`). Unit variants carry no payload key,
// so `{"type":"ping"}` and `{"type":"pong"}` round-trip as-is. Unknown client
// types fail deserialization; the session replies with an `error` frame and
// keeps the connection open.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{Quote, Severity};

// =============================================================================
// Client -> server
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeStocks { ts_codes: Vec<String> },
    #[serde(rename_all = "camelCase")]
    UnsubscribeStocks { ts_codes: Vec<String> },
    Ping,
}

// =============================================================================
// Server -> client
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub id: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub id: String,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    StockUpdate(Quote),
    Alert(AlertPayload),
    Notification(NotificationPayload),
    Pong,
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            code: None,
        })
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            code: Some(code.into()),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_parses() {
        let json = r#"{"type":"subscribe_stocks","payload":{"tsCodes":["600519.SH","000001.SZ"]}}"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::SubscribeStocks { ts_codes } => {
                assert_eq!(ts_codes, vec!["600519.SH", "000001.SZ"]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn bare_ping_parses() {
        match serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap() {
            ClientMessage::Ping => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"order_now"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json at all").is_err());
    }

    #[test]
    fn pong_serialises_without_payload() {
        let json = serde_json::to_value(&ServerMessage::Pong).unwrap();
        assert_eq!(json, serde_json::json!({"type": "pong"}));
    }

    #[test]
    fn error_frame_shape() {
        let json =
            serde_json::to_value(ServerMessage::error_with_code("bad codes", "invalid_codes"))
                .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["message"], "bad codes");
        assert_eq!(json["payload"]["code"], "invalid_codes");

        let bare = serde_json::to_value(ServerMessage::error("oops")).unwrap();
        assert!(bare["payload"].get("code").is_none());
    }

    #[test]
    fn stock_update_payload_is_camel_case() {
        let quote = Quote {
            ts_code: "600519.SH".into(),
            name: "贵州茅台".into(),
            current_price: 1700.0,
            open: 1680.0,
            high: 1710.0,
            low: 1695.0,
            pre_close: 1680.0,
            volume: 100_000.0,
            amount: 170_000_000.0,
            change: 0.0,
            change_percent: 0.0,
            timestamp: 0,
            trade_date: "2024-01-02".into(),
            trade_time: "10:30:00".into(),
        }
        .with_derived_change();

        let json = serde_json::to_value(ServerMessage::StockUpdate(quote)).unwrap();
        assert_eq!(json["type"], "stock_update");
        assert_eq!(json["payload"]["tsCode"], "600519.SH");
        assert!(json["payload"]["currentPrice"].is_f64());
        assert!(json["payload"]["changePercent"].is_f64());
    }
}
