//! Market data module for A-shares.
//!
//! Provides typed snapshots, the source traits and the multi-source
//! market data provider used by every screening stage.
//!
//! # Data Sources
//! - **Tencent** (Primary): full quote lines with price, valuation multiples and market cap
//! - **Sina** (Secondary): paged listing for the universe, realtime quotes, daily K-lines

mod provider;
mod rate_limiter;
mod market_data;
mod tencent;
mod sina;

pub use provider::{DataProvider, ListingRecord, ProviderError, SourceRecord, UniverseSource};
pub use rate_limiter::{shared_limiter, RateLimiter, RequestBudget, SharedRateLimiter};
pub use market_data::{FetchStatus, MarketBatch, MarketDataProvider, SubBatchReport};
pub use tencent::TencentAdapter;
pub use sina::SinaAdapter;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Board and Exchange
// ============================================================================

/// Exchange an instrument is listed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    /// Shanghai Stock Exchange
    SH,
    /// Shenzhen Stock Exchange
    SZ,
    /// Beijing Stock Exchange
    BJ,
}

impl Exchange {
    /// Derive the exchange from a 6-digit code.
    pub fn from_code(code: &str) -> Self {
        if code.starts_with(['4', '8']) || code.starts_with("92") {
            Self::BJ
        } else if code.starts_with(['6', '5', '9']) {
            Self::SH
        } else {
            Self::SZ
        }
    }

    /// Lowercase prefix used by the quote feeds (e.g. `sh600519`).
    pub fn feed_prefix(&self) -> &'static str {
        match self {
            Self::SH => "sh",
            Self::SZ => "sz",
            Self::BJ => "bj",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SH => write!(f, "SH"),
            Self::SZ => write!(f, "SZ"),
            Self::BJ => write!(f, "BJ"),
        }
    }
}

/// Board classification, which determines trading rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Board {
    /// Main board (SH 60x / SZ 00x)
    Main,
    /// ChiNext (创业板, 300/301)
    ChiNext,
    /// STAR Market (科创板, 688)
    Star,
    /// Beijing Stock Exchange (北交所)
    Beijing,
}

impl Board {
    /// Classify a 6-digit code.
    pub fn from_code(code: &str) -> Self {
        if code.starts_with("688") {
            Self::Star
        } else if code.starts_with("300") || code.starts_with("301") {
            Self::ChiNext
        } else if code.starts_with(['4', '8']) || code.starts_with("92") {
            Self::Beijing
        } else {
            Self::Main
        }
    }

    /// Daily price-limit band as a fraction.
    pub fn price_limit(&self) -> f64 {
        match self {
            Self::Main => 0.10,
            Self::ChiNext | Self::Star => 0.20,
            Self::Beijing => 0.30,
        }
    }

    /// Minimum order lot in shares.
    pub fn lot_size(&self) -> u32 {
        match self {
            Self::Star => 200,
            _ => 100,
        }
    }
}

impl std::fmt::Display for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "主板"),
            Self::ChiNext => write!(f, "创业板"),
            Self::Star => write!(f, "科创板"),
            Self::Beijing => write!(f, "北交所"),
        }
    }
}

/// Trading rules attached to an instrument by its board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingRules {
    /// Daily price-limit band (fraction, e.g. 0.10)
    pub price_limit: f64,
    /// Minimum lot size in shares
    pub lot_size: u32,
}

impl From<Board> for TradingRules {
    fn from(board: Board) -> Self {
        Self {
            price_limit: board.price_limit(),
            lot_size: board.lot_size(),
        }
    }
}

// ============================================================================
// Instrument
// ============================================================================

/// Listing status as observed in the universe listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    /// Normal trading
    Active,
    /// Special treatment (ST / *ST), still tradable
    SpecialTreatment,
    /// No trade price today
    Suspended,
    /// In delisting arrangement (退市整理)
    Delisted,
}

impl ListingStatus {
    /// Classify from the display name and the listing price.
    ///
    /// Delisting takes precedence over suspension, which takes precedence over ST.
    pub fn classify(name: &str, last_price: Option<f64>) -> Self {
        if name.contains('退') {
            Self::Delisted
        } else if !matches!(last_price, Some(p) if p > 0.0) {
            Self::Suspended
        } else if name.to_uppercase().contains("ST") {
            Self::SpecialTreatment
        } else {
            Self::Active
        }
    }

    /// Whether the instrument can be traded today.
    pub fn is_tradable(&self) -> bool {
        matches!(self, Self::Active | Self::SpecialTreatment)
    }
}

/// A listed instrument. Immutable once loaded for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Symbol in standard format (e.g. "600519.SH")
    pub symbol: String,
    /// 6-digit code
    pub code: String,
    /// Display name
    pub name: String,
    /// Exchange
    pub exchange: Exchange,
    /// Board
    pub board: Board,
    /// Listing status
    pub status: ListingStatus,
    /// Board-specific trading rules
    pub rules: TradingRules,
}

impl Instrument {
    /// Build an instrument from a 6-digit code.
    pub fn new(code: impl Into<String>, name: impl Into<String>, status: ListingStatus) -> Self {
        let code = code.into();
        let exchange = Exchange::from_code(&code);
        let board = Board::from_code(&code);
        Self {
            symbol: format!("{}.{}", code, exchange),
            code,
            name: name.into(),
            exchange,
            board,
            status,
            rules: TradingRules::from(board),
        }
    }

    /// Build an instrument from a raw listing row.
    pub fn from_listing(record: &ListingRecord) -> Self {
        let status = ListingStatus::classify(&record.name, record.last_price);
        Self::new(record.code.clone(), record.name.clone(), status)
    }

    /// Code as used by the quote feeds (e.g. "sh600519").
    pub fn feed_code(&self) -> String {
        format!("{}{}", self.exchange.feed_prefix(), self.code)
    }

    /// Whether the instrument carries the special-treatment marker.
    pub fn is_special_treatment(&self) -> bool {
        self.status == ListingStatus::SpecialTreatment
    }
}

/// Extract the 6-digit code from "600519.SH", "sh600519" or "600519".
pub fn normalize_code(symbol: &str) -> &str {
    let s = symbol.split('.').next().unwrap_or(symbol);
    s.trim_start_matches(|c: char| c.is_ascii_alphabetic())
}

// ============================================================================
// Fields and Snapshots
// ============================================================================

/// A data field resolved by the market data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Price,
    ChangePct,
    Volume,
    TradedValue,
    TurnoverRate,
    EarningsMultiple,
    BookMultiple,
    MarketCap,
}

impl Field {
    /// All fields in resolution order.
    pub const ALL: [Field; 8] = [
        Field::Price,
        Field::ChangePct,
        Field::Volume,
        Field::TradedValue,
        Field::TurnoverRate,
        Field::EarningsMultiple,
        Field::BookMultiple,
        Field::MarketCap,
    ];

    /// Fields cross-validated against the secondary source.
    pub const CRITICAL: [Field; 3] = [Field::Price, Field::EarningsMultiple, Field::MarketCap];

    pub fn is_critical(&self) -> bool {
        Self::CRITICAL.contains(self)
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Price => "price",
            Self::ChangePct => "change_pct",
            Self::Volume => "volume",
            Self::TradedValue => "traded_value",
            Self::TurnoverRate => "turnover_rate",
            Self::EarningsMultiple => "earnings_multiple",
            Self::BookMultiple => "book_multiple",
            Self::MarketCap => "market_cap",
        };
        write!(f, "{}", name)
    }
}

/// Quote fields for one instrument from one source.
///
/// Units: price in yuan, change in percent, volume in shares,
/// traded value in yuan, turnover in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub price: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume: Option<f64>,
    pub traded_value: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl QuoteSnapshot {
    /// Empty snapshot for a symbol.
    pub fn empty(symbol: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            price: None,
            change_pct: None,
            volume: None,
            traded_value: None,
            turnover_rate: None,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

/// Fundamental fields for one instrument from one source.
///
/// Market cap in yuan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalSnapshot {
    pub symbol: String,
    pub market_cap: Option<f64>,
    pub earnings_multiple: Option<f64>,
    pub book_multiple: Option<f64>,
    pub source: String,
}

impl FundamentalSnapshot {
    /// Empty snapshot for a symbol.
    pub fn empty(symbol: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            market_cap: None,
            earnings_multiple: None,
            book_multiple: None,
            source: source.into(),
        }
    }
}

/// Cross-validated values disagree beyond the configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDiscrepancy {
    pub field: Field,
    pub primary_source: String,
    pub primary_value: f64,
    pub secondary_source: String,
    pub secondary_value: f64,
    /// `|p - s| / max(|p|, |s|)`
    pub relative_diff: f64,
}

/// A field that no source could supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUnavailable {
    pub field: Field,
    pub reason: String,
}

/// Relative difference between two readings of the same field.
pub fn relative_diff(primary: f64, secondary: f64) -> f64 {
    let scale = primary.abs().max(secondary.abs());
    if scale == 0.0 {
        0.0
    } else {
        (primary - secondary).abs() / scale
    }
}

/// Resolved per-instrument data after fallback and cross-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub instrument: Instrument,
    pub quote: QuoteSnapshot,
    pub fundamental: FundamentalSnapshot,
    /// Fields taken from the secondary source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filled_from_secondary: Vec<Field>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discrepancies: Vec<SourceDiscrepancy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<DataUnavailable>,
}

impl MarketSnapshot {
    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }

    /// Read a resolved field.
    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::Price => self.quote.price,
            Field::ChangePct => self.quote.change_pct,
            Field::Volume => self.quote.volume,
            Field::TradedValue => self.quote.traded_value,
            Field::TurnoverRate => self.quote.turnover_rate,
            Field::EarningsMultiple => self.fundamental.earnings_multiple,
            Field::BookMultiple => self.fundamental.book_multiple,
            Field::MarketCap => self.fundamental.market_cap,
        }
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.discrepancies.is_empty()
    }
}

// ============================================================================
// Candles
// ============================================================================

/// Daily OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}
