//! Sina Finance adapter (secondary source and universe listing).
//!
//! # Endpoints
//! - Listing pages: `{listing_url}/quotes_service/api/json_v2.php/Market_Center.getHQNodeData`
//! - Listing count: `{listing_url}/quotes_service/api/json_v2.php/Market_Center.getHQNodeStockCount`
//! - Realtime quotes: `{quote_url}/list=sh600519,sz000001` (requires a Referer)
//! - Daily K-lines: `{kline_url}/cn/api/json_v2.php/CN_MarketDataService.getKLineData`
//!
//! The realtime quote lines carry no valuation fields, so the adapter keeps
//! the listing rows it paged through and serves earnings multiple, book
//! multiple, market cap and turnover from them.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use zero_common::util::{json_lenient_f64, parse_lenient_f64};

use super::provider::{
    build_client, http_get_text, DataProvider, ListingRecord, ProviderError, SourceRecord,
    UniverseSource,
};
use super::{normalize_code, Candle, Exchange, FundamentalSnapshot, QuoteSnapshot};
use crate::screener::config::SourceConfig;

// ============================================================================
// Constants
// ============================================================================

const NODE: &str = "hs_a";

const REFERER: &str = "https://finance.sina.com.cn";

/// Minimum number of `,` fields in a complete quote line
const MIN_QUOTE_FIELDS: usize = 32;

/// Daily bars
const DAILY_SCALE: u32 = 240;

const YUAN_PER_WAN: f64 = 10_000.0;

const CST_OFFSET_SECS: i32 = 8 * 3600;

// ============================================================================
// Listing rows
// ============================================================================

/// Valuation fields kept from a listing row. Market cap in yuan.
#[derive(Debug, Clone, Default, PartialEq)]
struct ListingFundamentals {
    earnings_multiple: Option<f64>,
    book_multiple: Option<f64>,
    market_cap: Option<f64>,
    turnover_rate: Option<f64>,
}

/// Parse a listing page (JSON array of objects; numbers may be strings).
fn parse_listing_page(body: &str) -> Result<Vec<(ListingRecord, ListingFundamentals)>, ProviderError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    let rows: Vec<Value> = serde_json::from_str(trimmed)
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse listing: {}", e)))?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let code = row.get("code").and_then(Value::as_str)?.trim().to_string();
            if code.len() != 6 {
                return None;
            }
            let name = row.get("name").and_then(Value::as_str).unwrap_or_default().trim().to_string();
            let num = |key: &str| row.get(key).and_then(json_lenient_f64);

            let record = ListingRecord {
                code,
                name,
                last_price: num("trade"),
            };
            let fundamentals = ListingFundamentals {
                earnings_multiple: num("per"),
                book_multiple: num("pb"),
                market_cap: num("mktcap").filter(|v| *v > 0.0).map(|v| v * YUAN_PER_WAN),
                turnover_rate: num("turnoverratio"),
            };
            Some((record, fundamentals))
        })
        .collect())
}

/// Parse one `var hq_str_sh600519="贵州茅台,1460.00,..."` line.
///
/// Field layout: name, open, prev_close, price, high, low, bid, ask,
/// volume (shares), amount (yuan), ..., date [30], time [31].
fn parse_hq_line(line: &str, source: &str) -> Option<QuoteSnapshot> {
    let line = line.trim().trim_end_matches(';');
    let (head, rest) = line.split_once("=\"")?;
    let feed = head.strip_prefix("var hq_str_")?;
    let body = rest.strip_suffix('"')?;

    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < MIN_QUOTE_FIELDS {
        return None;
    }

    let code = normalize_code(feed);
    if code.len() != 6 {
        return None;
    }
    let num = |i: usize| fields.get(i).and_then(|s| parse_lenient_f64(s));

    let price = num(3).filter(|p| *p > 0.0);
    let prev_close = num(2).filter(|p| *p > 0.0);
    let change_pct = match (price, prev_close) {
        (Some(p), Some(prev)) => Some((p - prev) / prev * 100.0),
        _ => None,
    };

    let timestamp = NaiveDateTime::parse_from_str(
        &format!("{} {}", fields[30].trim(), fields[31].trim()),
        "%Y-%m-%d %H:%M:%S",
    )
    .ok()
    .and_then(|dt| {
        chrono::FixedOffset::east_opt(CST_OFFSET_SECS)
            .and_then(|tz| tz.from_local_datetime(&dt).single())
    })
    .map(|dt| dt.with_timezone(&Utc))
    .unwrap_or_else(Utc::now);

    Some(QuoteSnapshot {
        symbol: format!("{}.{}", code, Exchange::from_code(code)),
        price,
        change_pct,
        volume: num(8),
        traded_value: num(9),
        turnover_rate: None,
        timestamp,
        source: source.to_string(),
    })
}

/// Parse a K-line body; JSONP wrappers are tolerated.
fn parse_kline_body(body: &str) -> Result<Vec<Candle>, ProviderError> {
    let start = body.find('[');
    let end = body.rfind(']');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &body[s..=e],
        _ => {
            return Err(ProviderError::DataNotAvailable("empty kline response".into()));
        }
    };

    let rows: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse kline: {}", e)))?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let date = row
                .get("day")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok())?;
            let num = |key: &str| row.get(key).and_then(json_lenient_f64);
            Some(Candle {
                date,
                open: num("open")?,
                high: num("high")?,
                low: num("low")?,
                close: num("close")?,
                volume: num("volume").unwrap_or(0.0),
            })
        })
        .collect())
}

// ============================================================================
// Sina Adapter
// ============================================================================

/// Sina Finance adapter.
pub struct SinaAdapter {
    name: &'static str,
    client: reqwest::Client,
    listing_url: String,
    quote_url: String,
    kline_url: String,
    /// Valuation fields from listing pages, keyed by symbol
    listing_cache: RwLock<HashMap<String, ListingFundamentals>>,
}

impl SinaAdapter {
    /// Create from a source config.
    ///
    /// Without a `listing_url` the quote endpoint base is used for listing calls.
    pub fn from_config(config: &SourceConfig) -> Self {
        let quote_url = config.quote_url.trim_end_matches('/').to_string();
        Self {
            name: "sina",
            client: build_client(config.timeout()),
            listing_url: config
                .listing_url
                .as_deref()
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| quote_url.clone()),
            quote_url,
            kline_url: config.kline_url.trim_end_matches('/').to_string(),
            listing_cache: RwLock::new(HashMap::new()),
        }
    }

    fn market_center(&self, method: &str) -> String {
        format!(
            "{}/quotes_service/api/json_v2.php/Market_Center.{}",
            self.listing_url, method
        )
    }

    /// Number of listing rows cached so far.
    pub async fn cached_listings(&self) -> usize {
        self.listing_cache.read().await.len()
    }
}

#[async_trait]
impl UniverseSource for SinaAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn total_count(&self) -> Result<Option<usize>, ProviderError> {
        let url = format!("{}?node={}", self.market_center("getHQNodeStockCount"), NODE);
        let body = http_get_text(&self.client, &url, None).await?;
        Ok(body.trim().trim_matches('"').parse::<usize>().ok().filter(|n| *n > 0))
    }

    async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ListingRecord>, ProviderError> {
        // Sort by symbol so pages stay stable while prices move
        let url = format!(
            "{}?page={}&num={}&sort=symbol&asc=1&node={}",
            self.market_center("getHQNodeData"),
            page,
            page_size,
            NODE
        );
        debug!(page, page_size, "Fetching listing page from Sina");

        let body = http_get_text(&self.client, &url, None).await?;
        let rows = parse_listing_page(&body)?;

        let mut cache = self.listing_cache.write().await;
        let mut records = Vec::with_capacity(rows.len());
        for (record, fundamentals) in rows {
            let symbol = format!("{}.{}", record.code, Exchange::from_code(&record.code));
            cache.insert(symbol, fundamentals);
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl DataProvider for SinaAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_snapshots(&self, symbols: &[String]) -> Result<Vec<SourceRecord>, ProviderError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let codes: Vec<String> = symbols
            .iter()
            .map(|s| {
                let code = normalize_code(s);
                format!("{}{}", Exchange::from_code(code).feed_prefix(), code)
            })
            .collect();
        let url = format!("{}/list={}", self.quote_url, codes.join(","));
        debug!(count = symbols.len(), "Fetching quotes from Sina");

        let body = http_get_text(&self.client, &url, Some(REFERER)).await?;

        let cache = self.listing_cache.read().await;
        Ok(body
            .lines()
            .filter_map(|line| parse_hq_line(line, self.name))
            .map(|mut quote| {
                let listing = cache.get(&quote.symbol).cloned().unwrap_or_default();
                quote.turnover_rate = listing.turnover_rate;
                let fundamental = FundamentalSnapshot {
                    symbol: quote.symbol.clone(),
                    market_cap: listing.market_cap,
                    earnings_multiple: listing.earnings_multiple,
                    book_multiple: listing.book_multiple,
                    source: self.name.to_string(),
                };
                SourceRecord { quote, fundamental }
            })
            .collect())
    }

    async fn fetch_daily_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ProviderError> {
        let code = normalize_code(symbol);
        let feed = format!("{}{}", Exchange::from_code(code).feed_prefix(), code);
        let url = format!(
            "{}/cn/api/json_v2.php/CN_MarketDataService.getKLineData?symbol={}&scale={}&ma=no&datalen={}",
            self.kline_url, feed, DAILY_SCALE, limit
        );
        debug!(symbol, limit, "Fetching kline from Sina");

        let body = http_get_text(&self.client, &url, Some(REFERER)).await?;
        let mut candles = parse_kline_body(&body)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn hq_line(feed: &str, name: &str, price: &str, prev_close: &str) -> String {
        let mut fields = vec!["0.000"; 33];
        fields[0] = name;
        fields[1] = prev_close;
        fields[2] = prev_close;
        fields[3] = price;
        fields[8] = "2345678";
        fields[9] = "3412345678.000";
        fields[30] = "2024-01-05";
        fields[31] = "15:00:03";
        format!("var hq_str_{}=\"{}\";", feed, fields.join(","))
    }

    #[test]
    fn test_parse_listing_page() {
        let body = r#"[
            {"symbol":"sh600519","code":"600519","name":"贵州茅台","trade":"1455.020","per":21.5,"pb":"7.800","mktcap":182783000.5,"turnoverratio":0.19},
            {"symbol":"sz000001","code":"000001","name":"平安银行","trade":"0.000","per":"-","pb":0.6,"mktcap":"21000000","turnoverratio":"0.5"},
            {"symbol":"bad","code":"12","name":"x"}
        ]"#;
        let rows = parse_listing_page(body).unwrap();
        assert_eq!(rows.len(), 2);

        let (moutai, f) = &rows[0];
        assert_eq!(moutai.code, "600519");
        assert_eq!(moutai.last_price, Some(1455.02));
        assert_eq!(f.earnings_multiple, Some(21.5));
        assert_eq!(f.book_multiple, Some(7.8));
        assert!((f.market_cap.unwrap() - 1.827830005e12).abs() < 1.0);

        let (pingan, f) = &rows[1];
        assert_eq!(pingan.last_price, Some(0.0));
        assert_eq!(f.earnings_multiple, None);
        assert_eq!(f.turnover_rate, Some(0.5));
    }

    #[test]
    fn test_parse_listing_empty() {
        assert!(parse_listing_page("").unwrap().is_empty());
        assert!(parse_listing_page("null").unwrap().is_empty());
        assert!(parse_listing_page("[]").unwrap().is_empty());
        assert!(matches!(
            parse_listing_page("<html>"),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_hq_line() {
        let line = hq_line("sh600519", "贵州茅台", "1455.02", "1466.21");
        let quote = parse_hq_line(&line, "sina").unwrap();
        assert_eq!(quote.symbol, "600519.SH");
        assert_eq!(quote.price, Some(1455.02));
        assert!((quote.change_pct.unwrap() - (1455.02 - 1466.21) / 1466.21 * 100.0).abs() < 1e-9);
        assert_eq!(quote.volume, Some(2_345_678.0));
        assert_eq!(quote.traded_value, Some(3_412_345_678.0));
        assert_eq!(
            quote.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 5, 7, 0, 3).unwrap()
        );
    }

    #[test]
    fn test_parse_hq_line_suspended_and_empty() {
        let line = hq_line("sz000001", "平安银行", "0.000", "10.50");
        let quote = parse_hq_line(&line, "sina").unwrap();
        assert_eq!(quote.price, None);
        assert_eq!(quote.change_pct, None);

        assert!(parse_hq_line("var hq_str_sh600000=\"\";", "sina").is_none());
    }

    #[test]
    fn test_parse_kline_jsonp_and_plain() {
        let plain = r#"[{"day":"2024-01-04","open":"10.0","high":"10.5","low":"9.8","close":"10.2","volume":"123400"}]"#;
        let jsonp = format!("/*<script>*/var _sh600000=({});", plain);

        for body in [plain.to_string(), jsonp] {
            let candles = parse_kline_body(&body).unwrap();
            assert_eq!(candles.len(), 1);
            assert_eq!(candles[0].close, 10.2);
            assert_eq!(candles[0].date, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        }

        assert!(matches!(
            parse_kline_body("null"),
            Err(ProviderError::DataNotAvailable(_))
        ));
    }
}
