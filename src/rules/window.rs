// =============================================================================
// TimeWindow — compressed rolling window of per-stock data points
// =============================================================================
//
// One window per (session, stock). Points span at most `span_secs` relative to
// the newest point. A new point is kept iff the window is empty, the relative
// change versus the last kept point exceeds the compression threshold in
// either price or volume, or more than 30 s elapsed since the last kept point.
// Expired points are pruned by binary search on timestamp.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

/// Minimum retention interval: at least one point every 30 s is kept even when
/// price and volume are flat.
const MAX_KEEP_GAP_MS: i64 = 30_000;

/// A single observation fed into the window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DataPoint {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub price: f64,
    /// Cumulative volume in shares.
    pub volume: f64,
    pub change_percent: f64,
}

/// Rolling, compressed window of [`DataPoint`]s for a single stock.
#[derive(Debug)]
pub struct TimeWindow {
    points: VecDeque<DataPoint>,
    span_ms: i64,
    /// Compression threshold in percent (0.01 means 0.01 %).
    threshold_pct: f64,
}

impl TimeWindow {
    pub fn new(span_secs: i64, threshold_pct: f64) -> Self {
        Self {
            points: VecDeque::new(),
            span_ms: span_secs * 1000,
            threshold_pct,
        }
    }

    /// Feed an observation. Returns `true` when the point was kept.
    pub fn push(&mut self, point: DataPoint) -> bool {
        let keep = match self.points.back() {
            None => true,
            Some(last) => {
                point.timestamp - last.timestamp > MAX_KEEP_GAP_MS
                    || relative_change_pct(last.price, point.price) > self.threshold_pct
                    || relative_change_pct(last.volume, point.volume) > self.threshold_pct
            }
        };

        if keep {
            self.points.push_back(point);
            self.prune(point.timestamp);
        }
        keep
    }

    /// Drop points older than the span relative to `newest_ts`.
    fn prune(&mut self, newest_ts: i64) {
        let cutoff = newest_ts - self.span_ms;
        let first_live = self.points.partition_point(|p| p.timestamp < cutoff);
        for _ in 0..first_live {
            self.points.pop_front();
        }
    }

    /// The most recent kept point.
    pub fn latest(&self) -> Option<&DataPoint> {
        self.points.back()
    }

    /// Volume of the last kept point with `timestamp <= ts`. Falls back to the
    /// oldest retained point when every kept point is newer than `ts`.
    pub fn volume_at(&self, ts: i64) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.timestamp <= ts);
        if idx == 0 {
            self.points.front().map(|p| p.volume)
        } else {
            Some(self.points[idx - 1].volume)
        }
    }

    /// Current-tick volume increment: `latest volume − volume one second ago`,
    /// clamped to be non-negative.
    pub fn current_increment(&self) -> f64 {
        let Some(latest) = self.latest() else {
            return 0.0;
        };
        let Some(base) = self.volume_at(latest.timestamp - 1000) else {
            return 0.0;
        };
        (latest.volume - base).max(0.0)
    }

    /// Per-second average volume increment over the trailing `period_minutes`.
    /// Returns 0 with fewer than two points in range or a zero time span.
    pub fn average_increment(&self, period_minutes: u32) -> f64 {
        let Some(latest) = self.latest() else {
            return 0.0;
        };
        let cutoff = latest.timestamp - i64::from(period_minutes) * 60_000;
        let start = self.points.partition_point(|p| p.timestamp < cutoff);
        let in_range = self.points.len() - start;
        if in_range < 2 {
            return 0.0;
        }

        let first = &self.points[start];
        let last = &self.points[self.points.len() - 1];
        let span_secs = (last.timestamp - first.timestamp) as f64 / 1000.0;
        if span_secs <= 0.0 {
            return 0.0;
        }
        (last.volume - first.volume) / span_secs
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Relative change between `old` and `new`, in percent of `|old|`. A zero
/// baseline treats any change as material.
fn relative_change_pct(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        if new == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        ((new - old) / old).abs() * 100.0
    }
}

// =============================================================================
// Tests
// =============================================================================
