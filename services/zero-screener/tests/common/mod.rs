//! Shared mock sources for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};

use zero_screener::data::{
    Candle, DataProvider, Exchange, FundamentalSnapshot, ListingRecord, ProviderError,
    QuoteSnapshot, SourceRecord, UniverseSource,
};
use zero_screener::screener::ScreenerConfig;

// ============================================================================
// Market fixtures
// ============================================================================

/// Values of one instrument as a source reports them.
#[derive(Debug, Clone)]
pub struct StockSpec {
    pub code: String,
    pub name: String,
    pub price: Option<f64>,
    pub change_pct: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub traded_value: Option<f64>,
    pub earnings_multiple: Option<f64>,
    pub book_multiple: Option<f64>,
    pub market_cap: Option<f64>,
}

impl StockSpec {
    /// An instrument that passes every default hard filter.
    pub fn healthy(code: &str, seed: usize) -> Self {
        Self {
            code: code.to_string(),
            name: format!("样本{}", seed),
            price: Some(10.0 + (seed % 50) as f64),
            change_pct: Some(((seed * 37) % 200) as f64 / 20.0 - 5.0),
            turnover_rate: Some((seed % 13) as f64 * 0.4 + 0.1),
            traded_value: Some(1e8 + seed as f64 * 1e5),
            earnings_multiple: Some(5.0 + (seed % 40) as f64),
            book_multiple: Some(1.0 + (seed % 7) as f64 * 0.3),
            market_cap: Some(1e10 + seed as f64 * 1e7),
        }
    }

    pub fn symbol(&self) -> String {
        format!("{}.{}", self.code, Exchange::from_code(&self.code))
    }

    pub fn listing(&self) -> ListingRecord {
        ListingRecord {
            code: self.code.clone(),
            name: self.name.clone(),
            last_price: self.price,
        }
    }

    pub fn record(&self, source: &str) -> SourceRecord {
        let symbol = self.symbol();
        let mut quote = QuoteSnapshot::empty(&symbol, source);
        quote.price = self.price;
        quote.change_pct = self.change_pct;
        quote.turnover_rate = self.turnover_rate;
        quote.traded_value = self.traded_value;
        quote.volume = self.traded_value.zip(self.price).map(|(v, p)| v / p);
        quote.timestamp = Utc.with_ymd_and_hms(2024, 1, 5, 7, 0, 0).unwrap();
        let mut fundamental = FundamentalSnapshot::empty(&symbol, source);
        fundamental.earnings_multiple = self.earnings_multiple;
        fundamental.book_multiple = self.book_multiple;
        fundamental.market_cap = self.market_cap;
        SourceRecord { quote, fundamental }
    }
}

/// 5,484 instruments of which exactly 2,690 survive the default filters.
///
/// | index range | defect | eliminated by |
/// |-------------|--------|---------------|
/// | 0..150      | ST name | not_special_treatment |
/// | 150..450    | price 2.5 | price_floor |
/// | 450..1450   | cap 1e9 | market_cap_floor |
/// | 1450..2450  | PE -5 | positive_earnings |
/// | 2450..2794  | traded value 1e7 | traded_value_floor |
pub fn scenario_market() -> Vec<StockSpec> {
    (0..5484)
        .map(|i| {
            let mut stock = StockSpec::healthy(&format!("{}", 600000 + i), i);
            match i {
                0..=149 => stock.name = format!("ST样本{}", i),
                150..=449 => stock.price = Some(2.5),
                450..=1449 => stock.market_cap = Some(1e9),
                1450..=2449 => stock.earnings_multiple = Some(-5.0),
                2450..=2793 => stock.traded_value = Some(1e7),
                _ => {}
            }
            stock
        })
        .collect()
}

/// `count` healthy instruments.
pub fn healthy_market(count: usize) -> Vec<StockSpec> {
    (0..count)
        .map(|i| StockSpec::healthy(&format!("{}", 600000 + i), i))
        .collect()
}

/// Deterministic daily candles; the trend depends on the code.
pub fn candles_for(symbol: &str, count: usize) -> Vec<Candle> {
    let seed: u64 = symbol
        .split('.')
        .next()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let slope = ((seed % 17) as f64 - 8.0) * 0.01;
    let start = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
    (0..count)
        .map(|i| {
            let close = 10.0 + i as f64 * slope + ((i + seed as usize) % 5) as f64 * 0.05;
            Candle {
                date: start + chrono::Days::new(i as u64),
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 1e6,
            }
        })
        .collect()
}

// ============================================================================
// Mock source
// ============================================================================

/// In-process source serving fixed stocks, with failure injection and call counting.
pub struct MockSource {
    name: &'static str,
    stocks: HashMap<String, StockSpec>,
    listing: Vec<ListingRecord>,
    total: Option<usize>,
    history_days: usize,
    /// Snapshot calls that fail before the source recovers
    snapshot_failures: AtomicU32,
    snapshot_error: ProviderError,
    candles_fail: bool,
    page_delay: Option<Duration>,
    pub snapshot_calls: AtomicU32,
    pub candle_calls: AtomicU32,
    pub page_calls: AtomicU32,
}

impl MockSource {
    pub fn new(name: &'static str, stocks: &[StockSpec]) -> Self {
        Self {
            name,
            stocks: stocks.iter().map(|s| (s.symbol(), s.clone())).collect(),
            listing: stocks.iter().map(StockSpec::listing).collect(),
            total: Some(stocks.len()),
            history_days: 120,
            snapshot_failures: AtomicU32::new(0),
            snapshot_error: ProviderError::Network("mock network failure".into()),
            candles_fail: false,
            page_delay: None,
            snapshot_calls: AtomicU32::new(0),
            candle_calls: AtomicU32::new(0),
            page_calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `count` snapshot calls with `error`.
    pub fn failing_snapshots(self, count: u32, error: ProviderError) -> Self {
        Self {
            snapshot_failures: AtomicU32::new(count),
            snapshot_error: error,
            ..self
        }
    }

    pub fn failing_candles(self) -> Self {
        Self {
            candles_fail: true,
            ..self
        }
    }

    pub fn with_history(self, days: usize) -> Self {
        Self {
            history_days: days,
            ..self
        }
    }

    pub fn with_page_delay(self, delay: Duration) -> Self {
        Self {
            page_delay: Some(delay),
            ..self
        }
    }

    pub fn with_total(self, total: Option<usize>) -> Self {
        Self { total, ..self }
    }

    pub fn total_calls(&self) -> u32 {
        self.snapshot_calls.load(Ordering::SeqCst)
            + self.candle_calls.load(Ordering::SeqCst)
            + self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataProvider for MockSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_snapshots(&self, symbols: &[String]) -> Result<Vec<SourceRecord>, ProviderError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .snapshot_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(self.snapshot_error.clone());
        }
        Ok(symbols
            .iter()
            .filter_map(|s| self.stocks.get(s))
            .map(|stock| stock.record(self.name))
            .collect())
    }

    async fn fetch_daily_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ProviderError> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        if self.candles_fail {
            return Err(ProviderError::Unavailable("mock kline outage".into()));
        }
        Ok(candles_for(symbol, self.history_days.min(limit)))
    }
}

#[async_trait]
impl UniverseSource for MockSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn total_count(&self) -> Result<Option<usize>, ProviderError> {
        Ok(self.total)
    }

    async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ListingRecord>, ProviderError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.page_delay {
            tokio::time::sleep(delay).await;
        }
        let start = (page - 1) * page_size;
        Ok(self.listing.iter().skip(start).take(page_size).cloned().collect())
    }
}

// ============================================================================
// Config
// ============================================================================

/// Default config with fast retries and generous limits for in-process sources.
pub fn test_config() -> ScreenerConfig {
    let mut config = ScreenerConfig::default();
    for source in [&mut config.data.primary, &mut config.data.secondary] {
        source.rate_limit_rpm = 6_000_000;
        source.backoff_base_ms = 1;
    }
    config.data.primary.name = "primary".into();
    config.data.secondary.name = "secondary".into();
    config
}
