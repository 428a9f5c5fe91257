// =============================================================================
// Sina HQ Quote Source — batched polling of the upstream text endpoint
// =============================================================================
//
// One GET serves up to `batch_size` codes; larger requests are split into
// chunks issued concurrently. The upstream refuses requests without a
// `Referer` from finance.sina.com.cn, responds `text/plain` in GBK unless it
// declares otherwise, and emits one line per requested code:
//
//   var hq_str_sh600519="贵州茅台,1680.00,1680.00,1700.00,...,2024-01-02,10:30:00";
//
// Field map (0-indexed): 0 name, 1 open, 2 preClose, 3 current, 4 high,
// 5 low, 6 bid1, 7 ask1, 8 cumulative volume (shares), 9 cumulative amount
// (CNY), 10-29 five-level depth, 30 date, 31 time.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use tracing::{debug, warn};

use crate::quotes::{FetchOutcome, QuoteSource};
use crate::types::{split_ts_code, Quote};

/// Upstream refuses requests missing this referer.
const SINA_REFERER: &str = "https://finance.sina.com.cn";

/// A realistic desktop browser agent; the default reqwest agent is refused.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum fields per line for a parseable quote.
const MIN_FIELDS: usize = 32;

pub struct SinaQuoteSource {
    host: String,
    batch_size: usize,
    client: reqwest::Client,
}

impl SinaQuoteSource {
    pub fn new(host: impl Into<String>, batch_size: usize) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static(SINA_REFERER));
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            host: host.into(),
            batch_size: batch_size.max(1),
            client,
        }
    }

    /// Fetch one chunk (<= batch_size codes). An HTTP-level failure is
    /// returned as `Err` and the caller fails the whole chunk.
    async fn fetch_chunk(&self, codes: &[String]) -> Result<FetchOutcome> {
        let joined = codes
            .iter()
            .filter_map(|c| to_upstream_code(c))
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("https://{}/list={}", self.host, joined);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("upstream quote request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("upstream quote endpoint returned {status}");
        }

        // Decode per the declared charset; the upstream usually omits it and
        // actually sends GBK.
        let body = resp
            .text_with_charset("GBK")
            .await
            .context("failed to decode upstream response body")?;

        let now_ms = Utc::now().timestamp_millis();
        Ok(parse_chunk(codes, &body, now_ms))
    }
}

#[async_trait::async_trait]
impl QuoteSource for SinaQuoteSource {
    async fn fetch_batch(&self, codes: &[String]) -> FetchOutcome {
        if codes.is_empty() {
            return FetchOutcome::default();
        }

        let chunks: Vec<&[String]> = codes.chunks(self.batch_size).collect();
        let results = join_all(chunks.iter().map(|chunk| self.fetch_chunk(chunk))).await;

        let mut outcome = FetchOutcome::default();
        for (chunk, result) in chunks.into_iter().zip(results) {
            match result {
                Ok(mut part) => {
                    outcome.quotes.extend(part.quotes.drain());
                    outcome.failed.append(&mut part.failed);
                }
                Err(e) => {
                    warn!(codes = chunk.len(), error = %e, "quote chunk failed");
                    outcome.failed.extend(chunk.iter().cloned());
                }
            }
        }

        debug!(
            requested = codes.len(),
            parsed = outcome.quotes.len(),
            failed = outcome.failed.len(),
            "quote batch fetched"
        );
        outcome
    }
}

/// Translate `600519.SH` into the upstream's `sh600519` form.
pub fn to_upstream_code(ts_code: &str) -> Option<String> {
    let (symbol, exchange) = split_ts_code(ts_code)?;
    Some(format!("{}{}", exchange.upstream_prefix(), symbol))
}

/// Align response lines with the requested codes by index, up to the shorter
/// of the two, and parse each. Codes without a parseable line are failed.
fn parse_chunk(codes: &[String], body: &str, now_ms: i64) -> FetchOutcome {
    let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut outcome = FetchOutcome::default();
    for (i, code) in codes.iter().enumerate() {
        let parsed = lines.get(i).and_then(|line| parse_hq_line(code, line, now_ms));
        match parsed {
            Some(quote) => {
                outcome.quotes.insert(code.clone(), quote);
            }
            None => outcome.failed.push(code.clone()),
        }
    }
    outcome
}

/// Parse one `var hq_str_...="...";` line into a [`Quote`].
///
/// Returns `None` for lines with fewer than 32 fields, a non-positive or NaN
/// current price, or unparseable numerics.
fn parse_hq_line(ts_code: &str, line: &str, now_ms: i64) -> Option<Quote> {
    let start = line.find('"')? + 1;
    let end = line.rfind('"')?;
    if end <= start {
        return None;
    }
    let fields: Vec<&str> = line[start..end].split(',').collect();
    if fields.len() < MIN_FIELDS {
        return None;
    }

    let open: f64 = fields[1].trim().parse().ok()?;
    let pre_close: f64 = fields[2].trim().parse().ok()?;
    let current_price: f64 = fields[3].trim().parse().ok()?;
    let high: f64 = fields[4].trim().parse().ok()?;
    let low: f64 = fields[5].trim().parse().ok()?;
    let volume: f64 = fields[8].trim().parse().ok()?;
    let amount: f64 = fields[9].trim().parse().ok()?;

    if !current_price.is_finite() || current_price <= 0.0 {
        return None;
    }

    Some(
        Quote {
            ts_code: ts_code.to_string(),
            name: fields[0].to_string(),
            current_price,
            open,
            high,
            low,
            pre_close,
            volume,
            amount,
            change: 0.0,
            change_percent: 0.0,
            timestamp: now_ms,
            trade_date: fields[30].to_string(),
            trade_time: fields[31].to_string(),
        }
        .with_derived_change(),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// 32-field line in the upstream's shape with controllable head fields.
    fn hq_line(code: &str, head: &str) -> String {
        let mut fields: Vec<String> = head.split(',').map(str::to_string).collect();
        while fields.len() < 30 {
            fields.push("0".into());
        }
        fields.push("2024-01-02".into());
        fields.push("10:30:00".into());
        format!("var hq_str_{code}=\"{}\";", fields.join(","))
    }

    const MOUTAI_HEAD: &str =
        "贵州茅台,1680.00,1680.00,1700.00,1710.00,1695.00,1699.99,1700.01,100000,170000000";

    #[test]
    fn upstream_code_translation() {
        assert_eq!(to_upstream_code("600519.SH").as_deref(), Some("sh600519"));
        assert_eq!(to_upstream_code("000001.SZ").as_deref(), Some("sz000001"));
        assert_eq!(to_upstream_code("830799.BJ").as_deref(), Some("bj830799"));
        assert_eq!(to_upstream_code("garbage"), None);
    }

    #[test]
    fn parses_a_full_line() {
        let line = hq_line("sh600519", MOUTAI_HEAD);
        let q = parse_hq_line("600519.SH", &line, 42).expect("line should parse");

        assert_eq!(q.ts_code, "600519.SH");
        assert_eq!(q.name, "贵州茅台");
        assert!((q.open - 1680.0).abs() < 1e-9);
        assert!((q.pre_close - 1680.0).abs() < 1e-9);
        assert!((q.current_price - 1700.0).abs() < 1e-9);
        assert!((q.high - 1710.0).abs() < 1e-9);
        assert!((q.low - 1695.0).abs() < 1e-9);
        assert!((q.volume - 100_000.0).abs() < 1e-9);
        assert!((q.amount - 170_000_000.0).abs() < 1e-9);
        assert!((q.change - 20.0).abs() < 1e-9);
        assert!((q.change_percent - 20.0 / 1680.0 * 100.0).abs() < 1e-9);
        assert_eq!(q.timestamp, 42);
        assert_eq!(q.trade_date, "2024-01-02");
        assert_eq!(q.trade_time, "10:30:00");
    }

    #[test]
    fn numeric_fields_round_trip() {
        let line = hq_line("sh600519", MOUTAI_HEAD);
        let q = parse_hq_line("600519.SH", &line, 0).unwrap();
        // Formatting the parsed values reproduces the source numerics.
        assert_eq!(format!("{:.2}", q.open), "1680.00");
        assert_eq!(format!("{:.2}", q.current_price), "1700.00");
        assert_eq!(format!("{}", q.volume), "100000");
    }

    #[test]
    fn short_line_is_rejected() {
        let line = "var hq_str_sh600519=\"贵州茅台,1680.00,1680.00\";";
        assert!(parse_hq_line("600519.SH", line, 0).is_none());
    }

    #[test]
    fn non_positive_price_is_rejected() {
        let head = "停牌股,10.00,10.00,0.00,10.00,10.00,0,0,0,0";
        let line = hq_line("sz000001", head);
        assert!(parse_hq_line("000001.SZ", &line, 0).is_none());
    }

    #[test]
    fn unparseable_numeric_is_rejected() {
        let head = "坏数据,abc,1680.00,1700.00,1710.00,1695.00,0,0,0,0";
        let line = hq_line("sh600519", head);
        assert!(parse_hq_line("600519.SH", &line, 0).is_none());
    }

    #[test]
    fn chunk_alignment_by_index() {
        let codes = vec!["600519.SH".to_string(), "000001.SZ".to_string()];
        // Upstream returned only one line: the second code fails.
        let body = hq_line("sh600519", MOUTAI_HEAD);
        let outcome = parse_chunk(&codes, &body, 0);

        assert_eq!(outcome.quotes.len(), 1);
        assert!(outcome.quotes.contains_key("600519.SH"));
        assert_eq!(outcome.failed, vec!["000001.SZ".to_string()]);
    }

    #[test]
    fn empty_body_fails_all_codes() {
        let codes = vec!["600519.SH".to_string(), "000001.SZ".to_string()];
        let outcome = parse_chunk(&codes, "", 0);
        assert!(outcome.quotes.is_empty());
        assert_eq!(outcome.failed.len(), 2);
    }

    #[test]
    fn bad_line_fails_only_that_code() {
        let codes = vec!["600519.SH".to_string(), "000001.SZ".to_string()];
        let body = format!(
            "var hq_str_sh600519=\"\";\n{}",
            hq_line("sz000001", "平安银行,10.00,10.00,10.50,10.60,9.90,0,0,5000,52000")
        );
        let outcome = parse_chunk(&codes, &body, 0);
        assert_eq!(outcome.failed, vec!["600519.SH".to_string()]);
        assert!(outcome.quotes.contains_key("000001.SZ"));
    }
}
