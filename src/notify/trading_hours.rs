// =============================================================================
// Trading-hours gate — Asia/Shanghai session windows
// =============================================================================
//
// The server-side replay path only does work Monday-Friday inside the
// mainland sessions 09:30-11:30 and 13:00-15:00, Asia/Shanghai. Window ends
// are inclusive. The in-session engine does not consult this gate; it simply
// processes whatever ticks the server delivers.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Asia::Shanghai;

/// Is `now` inside a mainland trading window?
pub fn is_trading_time(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&Shanghai);

    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }

    let t = local.time();
    let morning_open = NaiveTime::from_hms_opt(9, 30, 0).expect("valid time");
    let morning_close = NaiveTime::from_hms_opt(11, 30, 0).expect("valid time");
    let afternoon_open = NaiveTime::from_hms_opt(13, 0, 0).expect("valid time");
    let afternoon_close = NaiveTime::from_hms_opt(15, 0, 0).expect("valid time");

    (t >= morning_open && t <= morning_close) || (t >= afternoon_open && t <= afternoon_close)
}

/// Convenience wrapper over the wall clock.
pub fn is_trading_now() -> bool {
    is_trading_time(Utc::now())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Build a UTC instant from an Asia/Shanghai wall-clock reading.
    fn shanghai(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Shanghai
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("unambiguous local time")
            .with_timezone(&Utc)
    }

    #[test]
    fn saturday_morning_is_closed() {
        // 2024-01-06 is a Saturday.
        assert!(!is_trading_time(shanghai(2024, 1, 6, 10, 0)));
    }

    #[test]
    fn weekday_sessions_are_open() {
        // 2024-01-02 is a Tuesday.
        assert!(is_trading_time(shanghai(2024, 1, 2, 10, 0)));
        assert!(is_trading_time(shanghai(2024, 1, 2, 14, 0)));
    }

    #[test]
    fn lunch_break_is_closed() {
        assert!(!is_trading_time(shanghai(2024, 1, 2, 12, 0)));
        assert!(!is_trading_time(shanghai(2024, 1, 2, 11, 31)));
        assert!(!is_trading_time(shanghai(2024, 1, 2, 12, 59)));
    }

    #[test]
    fn window_edges_are_inclusive() {
        assert!(is_trading_time(shanghai(2024, 1, 2, 9, 30)));
        assert!(is_trading_time(shanghai(2024, 1, 2, 11, 30)));
        assert!(is_trading_time(shanghai(2024, 1, 2, 13, 0)));
        assert!(is_trading_time(shanghai(2024, 1, 2, 15, 0)));
        assert!(!is_trading_time(shanghai(2024, 1, 2, 9, 29)));
        assert!(!is_trading_time(shanghai(2024, 1, 2, 15, 1)));
    }

    #[test]
    fn gate_is_timezone_aware_not_utc() {
        use chrono::Timelike;
        // 10:00 Shanghai is 02:00 UTC; naive UTC hours would say closed.
        let inside = shanghai(2024, 1, 2, 10, 0);
        assert_eq!(inside.time().hour(), 2);
        assert!(is_trading_time(inside));
    }
}
