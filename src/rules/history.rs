// =============================================================================
// Intraday History — uncompressed per-stock data points, wiped daily
// =============================================================================
//
// Server-side companion to the per-session TimeWindow: every observed point is
// appended verbatim (no compression), capped per stock, and the whole store is
// wiped once a day at 00:05 Asia/Shanghai by a maintenance task.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use crate::rules::window::DataPoint;

/// Default per-stock cap: one point per second across a full trading day.
pub const DEFAULT_INTRADAY_CAP: usize = 14_400;

/// Append-only intraday point store, shared across tasks.
pub struct IntradayHistory {
    points: RwLock<HashMap<String, Vec<DataPoint>>>,
    cap: usize,
}

impl IntradayHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            cap,
        }
    }

    /// Append a point for `ts_code`. At the cap, the oldest point is dropped.
    pub fn record(&self, ts_code: &str, point: DataPoint) {
        let mut map = self.points.write();
        let series = map.entry(ts_code.to_string()).or_default();
        if series.len() >= self.cap {
            series.remove(0);
        }
        series.push(point);
    }

    /// Copy of the series for `ts_code`, oldest first.
    pub fn points_of(&self, ts_code: &str) -> Vec<DataPoint> {
        self.points
            .read()
            .get(ts_code)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of stocks currently tracked.
    pub fn stock_count(&self) -> usize {
        self.points.read().len()
    }

    /// Drop everything. Invoked by the daily maintenance task.
    pub fn wipe(&self) {
        let mut map = self.points.write();
        let stocks = map.len();
        map.clear();
        info!(stocks, "intraday history wiped");
    }
}

impl Default for IntradayHistory {
    fn default() -> Self {
        Self::new(DEFAULT_INTRADAY_CAP)
    }
}

// =============================================================================
// Daily maintenance
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Asia::Shanghai;

/// Wipe the store at 00:05 Asia/Shanghai every day until shutdown.
pub async fn run_daily_wipe(
    history: Arc<IntradayHistory>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let wait = duration_until_next_wipe(Utc::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => history.wipe(),
            _ = shutdown.changed() => return,
        }
    }
}

/// Time remaining until the next 00:05 Asia/Shanghai.
fn duration_until_next_wipe(now: DateTime<Utc>) -> Duration {
    let local = now.with_timezone(&Shanghai);
    let today_wipe = local
        .date_naive()
        .and_hms_opt(0, 5, 0)
        .expect("00:05 is a valid time");
    let next = if local.naive_local() < today_wipe {
        today_wipe
    } else {
        today_wipe + chrono::Duration::days(1)
    };

    match Shanghai.from_local_datetime(&next).earliest() {
        Some(next_local) => (next_local.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or_default(),
        // Unreachable for a DST-free zone; retry in an hour if it ever is.
        None => Duration::from_secs(3600),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64) -> DataPoint {
        DataPoint {
            timestamp: ts,
            price: 10.0,
            volume: ts as f64,
            change_percent: 0.0,
        }
    }

    #[test]
    fn records_without_compression() {
        let history = IntradayHistory::new(100);
        // Identical consecutive values would be collapsed by TimeWindow.
        history.record("600519.SH", point(0));
        history.record("600519.SH", point(0));
        assert_eq!(history.points_of("600519.SH").len(), 2);
    }

    #[test]
    fn cap_drops_oldest() {
        let history = IntradayHistory::new(3);
        for i in 0..5 {
            history.record("600519.SH", point(i));
        }
        let points = history.points_of("600519.SH");
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].timestamp, 2);
        assert_eq!(points[2].timestamp, 4);
    }

    #[test]
    fn wipe_schedule_targets_00_05_shanghai() {
        // 23:00 Shanghai: 1 h 05 m to go.
        let now = Shanghai
            .with_ymd_and_hms(2024, 1, 2, 23, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(duration_until_next_wipe(now), Duration::from_secs(65 * 60));

        // 00:04 Shanghai: one minute to go, same day.
        let now = Shanghai
            .with_ymd_and_hms(2024, 1, 3, 0, 4, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(duration_until_next_wipe(now), Duration::from_secs(60));

        // 00:05 exactly: the next wipe is tomorrow.
        let now = Shanghai
            .with_ymd_and_hms(2024, 1, 3, 0, 5, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            duration_until_next_wipe(now),
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn wipe_clears_all_stocks() {
        let history = IntradayHistory::new(10);
        history.record("600519.SH", point(0));
        history.record("000001.SZ", point(0));
        assert_eq!(history.stock_count(), 2);

        history.wipe();
        assert_eq!(history.stock_count(), 0);
        assert!(history.points_of("600519.SH").is_empty());
    }
}
