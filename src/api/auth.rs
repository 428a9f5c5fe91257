// =============================================================================
// Scheduled-trigger Authentication — Axum Bearer extractor
// =============================================================================
//
// The cron caller authenticates with `Authorization: Bearer <CRON_SECRET>`.
// The expected secret is read from the environment on every request so that
// rotation does not require a restart. Comparison is performed in constant
// time to prevent timing side-channels.
//
// Usage as an Axum extractor:
//
//   async fn handler(_auth: CronBearer, ...) { ... }
//
// A missing or invalid secret short-circuits the request with 403 before the
// handler body executes. (WebSocket session auth is different: the opaque
// `?token=` is looked up in the session store by the ws handler itself.)
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Every byte of equal-length
/// inputs is examined even after a mismatch; a length difference returns
/// early, which only reveals that lengths differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Validates `Authorization: Bearer <token>` against the `CRON_SECRET`
/// environment variable and yields the raw token for audit logging.
pub struct CronBearer(pub String);

pub struct CronRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for CronRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "message": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CronBearer
where
    S: Send + Sync,
{
    type Rejection = CronRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("CRON_SECRET").unwrap_or_default();

        if expected.is_empty() {
            warn!("CRON_SECRET is not set — scheduled trigger requests are rejected");
            return Err(CronRejection {
                status: StatusCode::FORBIDDEN,
                message: "scheduled trigger not configured",
            });
        }

        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header on cron endpoint");
                return Err(CronRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "missing or invalid authorization token",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid cron secret presented");
            return Err(CronRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid authorization token",
            });
        }

        Ok(CronBearer(token.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"secret", b"secret"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"secret", b"hunter2"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"much_longer_secret"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
