// =============================================================================
// Gateway Configuration — environment-driven settings
// =============================================================================
//
// Every tunable the gateway honours lives here, read once at startup from the
// process environment (`.env` is loaded by main before this runs). Missing or
// malformed values fall back to defaults with a warning so a bare environment
// still boots a working gateway.
// =============================================================================

use std::time::Duration;

use tracing::warn;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_ws_port() -> u16 {
    3333
}

fn default_upstream_host() -> String {
    "hq.sinajs.cn".to_string()
}

fn default_fanout_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    800
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_cooldown_secs() -> i64 {
    300
}

fn default_window_secs() -> i64 {
    3600
}

fn default_compression_threshold_pct() -> f64 {
    0.01
}

// =============================================================================
// Config
// =============================================================================

/// Web Push (VAPID) identity. Only present when all three variables are set;
/// absent identity disables the browser push channel entirely.
#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway listen port (`WS_PORT`).
    pub ws_port: u16,
    /// When true the fan-out runs against the synthetic quote generator
    /// instead of the live upstream (`WS_TEST_MODE`).
    pub test_mode: bool,
    /// Upstream quote host (`UPSTREAM_HOST`).
    pub upstream_host: String,
    /// Shared secret for the scheduled trigger (`CRON_SECRET`).
    pub cron_secret: String,
    /// Web Push identity (`VAPID_PUBLIC_KEY` / `VAPID_PRIVATE_KEY` /
    /// `VAPID_SUBJECT`).
    pub vapid: Option<VapidConfig>,
    /// Fan-out tick cadence in milliseconds.
    pub fanout_interval_ms: u64,
    /// Maximum codes per upstream request chunk.
    pub batch_size: usize,
    /// Heartbeat cadence in seconds.
    pub heartbeat_secs: u64,
    /// Minimum interval between outbound notifications for one alert key.
    pub cooldown_secs: i64,
    /// Time-window retention span in seconds.
    pub window_secs: i64,
    /// Window compression threshold, in percent.
    pub compression_threshold_pct: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            test_mode: false,
            upstream_host: default_upstream_host(),
            cron_secret: String::new(),
            vapid: None,
            fanout_interval_ms: default_fanout_interval_ms(),
            batch_size: default_batch_size(),
            heartbeat_secs: default_heartbeat_secs(),
            cooldown_secs: default_cooldown_secs(),
            window_secs: default_window_secs(),
            compression_threshold_pct: default_compression_threshold_pct(),
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let vapid = match (
            std::env::var("VAPID_PUBLIC_KEY"),
            std::env::var("VAPID_PRIVATE_KEY"),
            std::env::var("VAPID_SUBJECT"),
        ) {
            (Ok(public_key), Ok(private_key), Ok(subject))
                if !public_key.is_empty() && !private_key.is_empty() =>
            {
                Some(VapidConfig {
                    public_key,
                    private_key,
                    subject,
                })
            }
            _ => None,
        };

        let cron_secret = std::env::var("CRON_SECRET").unwrap_or_default();
        if cron_secret.is_empty() {
            warn!("CRON_SECRET is not set — the scheduled trigger will reject all callers");
        }

        Self {
            ws_port: env_parse("WS_PORT", default_ws_port()),
            test_mode: env_flag("WS_TEST_MODE"),
            upstream_host: std::env::var("UPSTREAM_HOST")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(default_upstream_host),
            cron_secret,
            vapid,
            fanout_interval_ms: env_parse("FANOUT_INTERVAL_MS", default_fanout_interval_ms()),
            batch_size: env_parse("FETCH_BATCH_SIZE", default_batch_size()),
            heartbeat_secs: env_parse("HEARTBEAT_SECS", default_heartbeat_secs()),
            cooldown_secs: env_parse("NOTIFY_COOLDOWN_SECS", default_cooldown_secs()),
            window_secs: env_parse("TIME_WINDOW_SECS", default_window_secs()),
            compression_threshold_pct: env_parse(
                "COMPRESSION_THRESHOLD_PCT",
                default_compression_threshold_pct(),
            ),
        }
    }

    pub fn fanout_interval(&self) -> Duration {
        Duration::from_millis(self.fanout_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Parse an environment variable, falling back to `default` (with a warning)
/// when the value is absent or malformed.
fn env_parse<T: std::str::FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, fallback = ?default, "malformed env var");
                default
            }
        },
        Err(_) => default,
    }
}

/// Boolean env flag: `1`, `true`, `yes` (any case) enable it.
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.ws_port, 3333);
        assert!(!cfg.test_mode);
        assert_eq!(cfg.upstream_host, "hq.sinajs.cn");
        assert_eq!(cfg.fanout_interval_ms, 1000);
        assert_eq!(cfg.batch_size, 800);
        assert_eq!(cfg.heartbeat_secs, 30);
        assert_eq!(cfg.cooldown_secs, 300);
        assert_eq!(cfg.window_secs, 3600);
        assert!((cfg.compression_threshold_pct - 0.01).abs() < f64::EPSILON);
        assert!(cfg.vapid.is_none());
    }

    #[test]
    fn durations_derive_from_fields() {
        let cfg = Config::default();
        assert_eq!(cfg.fanout_interval(), Duration::from_millis(1000));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("STOCKPULSE_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("STOCKPULSE_TEST_PARSE", 42u64), 42);
        std::env::remove_var("STOCKPULSE_TEST_PARSE");
    }

    #[test]
    fn env_flag_variants() {
        std::env::set_var("STOCKPULSE_TEST_FLAG", "TRUE");
        assert!(env_flag("STOCKPULSE_TEST_FLAG"));
        std::env::set_var("STOCKPULSE_TEST_FLAG", "0");
        assert!(!env_flag("STOCKPULSE_TEST_FLAG"));
        std::env::remove_var("STOCKPULSE_TEST_FLAG");
        assert!(!env_flag("STOCKPULSE_TEST_FLAG"));
    }
}
