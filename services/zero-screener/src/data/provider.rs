//! Data provider abstraction for multi-source market data.
//!
//! Defines the `DataProvider` trait that quote sources implement and the
//! `UniverseSource` trait for paged instrument listings. Both return
//! typed values; raw payloads never leave the adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::{Candle, Field, FundamentalSnapshot, QuoteSnapshot};

// ============================================================================
// Provider Error
// ============================================================================

/// Errors specific to data providers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network error (connection failed, reset)
    Network(String),
    /// Request exceeded its time budget
    Timeout { millis: u64 },
    /// Rate limit exceeded
    RateLimited { retry_after_secs: Option<u64> },
    /// Source answered but had nothing for the request
    DataNotAvailable(String),
    /// Provider is temporarily unavailable (5xx)
    Unavailable(String),
    /// Response could not be decoded
    InvalidResponse(String),
    /// Invalid request parameters
    InvalidRequest(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Timeout { millis } => write!(f, "Request timed out after {}ms", millis),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(secs) = retry_after_secs {
                    write!(f, ", retry after {} seconds", secs)?;
                }
                Ok(())
            }
            Self::DataNotAvailable(msg) => write!(f, "Data not available: {}", msg),
            Self::Unavailable(msg) => write!(f, "Provider unavailable: {}", msg),
            Self::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Check if the error is recoverable (worth retrying on the same source)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::Unavailable(_)
                | Self::DataNotAvailable(_)
        )
    }

    /// Map a reqwest transport error.
    pub fn from_transport(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network("Request timeout".into())
        } else if e.is_connect() {
            Self::Network("Connection failed".into())
        } else {
            Self::Network(e.to_string())
        }
    }

    /// Map a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, retry_after_secs: Option<u64>) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited { retry_after_secs }
        } else if status.is_server_error() {
            Self::Unavailable(format!("HTTP {}", status))
        } else {
            Self::InvalidRequest(format!("HTTP {}", status))
        }
    }
}

// ============================================================================
// HTTP helpers
// ============================================================================

/// Build the HTTP client shared by an adapter.
pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("Mozilla/5.0 (compatible; zero-screener/0.1)")
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// GET a URL and return the decoded body, mapping HTTP failures to `ProviderError`.
pub(crate) async fn http_get_text(
    client: &reqwest::Client,
    url: &str,
    referer: Option<&str>,
) -> Result<String, ProviderError> {
    let mut request = client.get(url);
    if let Some(referer) = referer {
        request = request.header(reqwest::header::REFERER, referer);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        return Err(ProviderError::from_status(status, retry_after));
    }

    response
        .text()
        .await
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to read body: {}", e)))
}

// ============================================================================
// Records
// ============================================================================

/// Quote and fundamental snapshot pair returned by one source for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub quote: QuoteSnapshot,
    pub fundamental: FundamentalSnapshot,
}

impl SourceRecord {
    pub fn symbol(&self) -> &str {
        &self.quote.symbol
    }

    pub fn source(&self) -> &str {
        &self.quote.source
    }

    /// Read one field from this source's snapshots.
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
}

/// One row of the paged universe listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    /// 6-digit code
    pub code: String,
    /// Display name
    pub name: String,
    /// Last trade price; zero or absent when suspended
    pub last_price: Option<f64>,
}

// ============================================================================
// Traits
// ============================================================================

/// Trait for market data providers.
///
/// Both the primary and the secondary source implement this trait so the
/// market data provider can retry, fall back and cross-validate uniformly.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Get the provider name (e.g., "tencent", "sina")
    fn name(&self) -> &'static str;

    /// Fetch quote and fundamental snapshots for a batch of symbols.
    ///
    /// Symbols are in standard format ("600519.SH"). Symbols the source
    /// does not know are simply absent from the result.
    async fn fetch_snapshots(&self, symbols: &[String]) -> Result<Vec<SourceRecord>, ProviderError>;

    /// Fetch up to `limit` most recent daily candles, oldest first.
    async fn fetch_daily_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ProviderError>;
}

/// Paged listing of all instruments.
#[async_trait]
pub trait UniverseSource: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Total number of listed instruments, when the source reports it.
    async fn total_count(&self) -> Result<Option<usize>, ProviderError>;

    /// Fetch one page (1-based).
    async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ListingRecord>, ProviderError>;
}
