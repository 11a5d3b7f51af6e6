//! Tencent quote adapter (primary source).
//!
//! # Endpoints
//! - Quotes: `{quote_url}/q=sh600519,sz000001` returning `~`-delimited lines
//! - Daily K-lines: `{kline_url}/appstock/app/fqkline/get?param=sh600519,day,,,120,qfq`
//!
//! # Units
//! Volume is reported in lots (手), traded value in 万元 and market cap in
//! 亿元. Everything is converted to shares and yuan on parse.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;
use zero_common::util::{json_lenient_f64, parse_lenient_f64};

use super::provider::{build_client, http_get_text, DataProvider, ProviderError, SourceRecord};
use super::{normalize_code, Candle, Exchange, FundamentalSnapshot, QuoteSnapshot};
use crate::screener::config::SourceConfig;

// ============================================================================
// Constants
// ============================================================================

/// Minimum number of `~` fields in a complete quote line
const MIN_QUOTE_FIELDS: usize = 50;

const SHARES_PER_LOT: f64 = 100.0;
const YUAN_PER_WAN: f64 = 10_000.0;
const YUAN_PER_YI: f64 = 100_000_000.0;

/// Beijing time offset (UTC+8)
const CST_OFFSET_SECS: i32 = 8 * 3600;

// ============================================================================
// Parsing
// ============================================================================

/// Convert "600519.SH" to the feed code "sh600519".
fn feed_code(symbol: &str) -> String {
    let code = normalize_code(symbol);
    format!("{}{}", Exchange::from_code(code).feed_prefix(), code)
}

/// Parse one `v_sh600519="1~贵州茅台~600519~..."` line.
fn parse_quote_line(line: &str, source: &str) -> Option<SourceRecord> {
    let line = line.trim().trim_end_matches(';');
    let (_, rest) = line.split_once("=\"")?;
    let body = rest.strip_suffix('"')?;

    let fields: Vec<&str> = body.split('~').collect();
    if fields.len() < MIN_QUOTE_FIELDS {
        return None;
    }

    let code = fields[2].trim();
    if code.len() != 6 {
        return None;
    }
    let symbol = format!("{}.{}", code, Exchange::from_code(code));
    let num = |i: usize| fields.get(i).and_then(|s| parse_lenient_f64(s));

    let timestamp = fields
        .get(30)
        .and_then(|s| NaiveDateTime::parse_from_str(s.trim(), "%Y%m%d%H%M%S").ok())
        .and_then(|dt| {
            chrono::FixedOffset::east_opt(CST_OFFSET_SECS)
                .and_then(|tz| tz.from_local_datetime(&dt).single())
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let quote = QuoteSnapshot {
        symbol: symbol.clone(),
        // Zero price means no trade today
        price: num(3).filter(|p| *p > 0.0),
        change_pct: num(32),
        volume: num(6).map(|v| v * SHARES_PER_LOT),
        traded_value: num(37).map(|v| v * YUAN_PER_WAN),
        turnover_rate: num(38),
        timestamp,
        source: source.to_string(),
    };

    let fundamental = FundamentalSnapshot {
        symbol,
        market_cap: num(45).filter(|v| *v > 0.0).map(|v| v * YUAN_PER_YI),
        earnings_multiple: num(39),
        book_multiple: num(46),
        source: source.to_string(),
    };

    Some(SourceRecord { quote, fundamental })
}

/// Parse the fqkline JSON body.
///
/// Rows are `[date, open, close, high, low, volume, ...]`; the series key is
/// `qfqday` for adjusted data and `day` otherwise.
fn parse_kline_body(body: &str, feed_code: &str) -> Result<Vec<Candle>, ProviderError> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse kline: {}", e)))?;

    let series = json
        .get("data")
        .and_then(|d| d.get(feed_code))
        .and_then(|s| s.get("qfqday").or_else(|| s.get("day")))
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::DataNotAvailable(format!("no kline for {}", feed_code)))?;

    let mut candles = Vec::with_capacity(series.len());
    for row in series {
        let Some(row) = row.as_array() else { continue };
        let date = row
            .first()
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        let value = |i: usize| row.get(i).and_then(json_lenient_f64);

        if let (Some(date), Some(open), Some(close), Some(high), Some(low)) =
            (date, value(1), value(2), value(3), value(4))
        {
            candles.push(Candle {
                date,
                open,
                high,
                low,
                close,
                volume: value(5).map(|v| v * SHARES_PER_LOT).unwrap_or(0.0),
            });
        }
    }

    Ok(candles)
}

// ============================================================================
// Tencent Adapter
// ============================================================================

/// Tencent quote adapter.
pub struct TencentAdapter {
    name: &'static str,
    client: reqwest::Client,
    quote_url: String,
    kline_url: String,
}

impl TencentAdapter {
    /// Create from a source config.
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            name: "tencent",
            client: build_client(config.timeout()),
            quote_url: config.quote_url.trim_end_matches('/').to_string(),
            kline_url: config.kline_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DataProvider for TencentAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_snapshots(&self, symbols: &[String]) -> Result<Vec<SourceRecord>, ProviderError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let codes: Vec<String> = symbols.iter().map(|s| feed_code(s)).collect();
        let url = format!("{}/q={}", self.quote_url, codes.join(","));
        debug!(count = symbols.len(), "Fetching quotes from Tencent");

        let body = http_get_text(&self.client, &url, None).await?;
        Ok(body
            .lines()
            .filter_map(|line| parse_quote_line(line, self.name))
            .collect())
    }

    async fn fetch_daily_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ProviderError> {
        let code = feed_code(symbol);
        let url = format!(
            "{}/appstock/app/fqkline/get?param={},day,,,{},qfq",
            self.kline_url, code, limit
        );
        debug!(symbol, limit, "Fetching kline from Tencent");

        let body = http_get_text(&self.client, &url, None).await?;
        let mut candles = parse_kline_body(&body, &code)?;
        candles.sort_by_key(|c| c.date);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }
}

// ============================================================================
// Tests
// ============================================================================
