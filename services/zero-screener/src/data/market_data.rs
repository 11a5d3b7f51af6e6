//! Multi-source market data provider.
//!
//! Resolves the fields needed by filtering and scoring for a batch of
//! instruments:
//!
//! 1. The batch is split into fixed-size sub-batches, fetched concurrently
//!    under the shared [`RequestBudget`].
//! 2. The primary source is retried with exponential backoff; if it keeps
//!    failing the whole sub-batch falls back to the secondary source.
//! 3. The secondary source is queried even when the primary succeeds, and
//!    critical fields are cross-validated. Disagreements become
//!    [`SourceDiscrepancy`] flags, not failures.
//! 4. A field neither source supplies is recorded as [`DataUnavailable`];
//!    nothing is interpolated.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::provider::{DataProvider, ProviderError, SourceRecord};
use super::rate_limiter::RequestBudget;
use super::{
    relative_diff, Candle, DataUnavailable, Field, FundamentalSnapshot, Instrument,
    MarketSnapshot, QuoteSnapshot, SourceDiscrepancy,
};
use crate::screener::config::{DataSourcesConfig, SourceConfig};

// ============================================================================
// Fetch Status
// ============================================================================

/// Outcome of fetching one sub-batch (or one series).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// Primary source answered
    Success,
    /// Source failed after every allowed attempt
    RetryableFailure,
    /// Primary failed, secondary served the request
    FallbackUsed,
    /// No source could serve the request
    Unavailable,
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RetryableFailure => write!(f, "retryable_failure"),
            Self::FallbackUsed => write!(f, "fallback_used"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Result of a retried call against one source.
#[derive(Debug)]
struct Attempted<T> {
    status: FetchStatus,
    value: Vec<T>,
    attempts: u32,
    last_error: Option<String>,
}

impl<T> Attempted<T> {
    fn succeeded(&self) -> bool {
        self.status == FetchStatus::Success
    }
}

// ============================================================================
// Batch Results
// ============================================================================

/// Diagnostics for one sub-batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubBatchReport {
    /// Position of the sub-batch in the input batch
    pub index: usize,
    /// Instruments in the sub-batch
    pub size: usize,
    /// Final status
    pub status: FetchStatus,
    /// Attempts made against the primary source
    pub primary_attempts: u32,
    /// Whether the secondary answered for cross-validation
    pub validated: bool,
    /// Last primary error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_error: Option<String>,
}

/// Resolved snapshots for a batch, in input order.
#[derive(Debug, Clone)]
pub struct MarketBatch {
    pub snapshots: Vec<MarketSnapshot>,
    pub reports: Vec<SubBatchReport>,
}

impl MarketBatch {
    /// Number of sub-batches that ended with `status`.
    pub fn count_status(&self, status: FetchStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }

    /// Number of instruments carrying at least one discrepancy flag.
    pub fn discrepancy_count(&self) -> usize {
        self.snapshots.iter().filter(|s| s.has_discrepancy()).count()
    }
}

// ============================================================================
// Market Data Provider
// ============================================================================

/// Fetches market data with retry, fallback and cross-validation.
pub struct MarketDataProvider {
    primary: Arc<dyn DataProvider>,
    secondary: Arc<dyn DataProvider>,
    budget: Arc<RequestBudget>,
    config: DataSourcesConfig,
}

impl MarketDataProvider {
    pub fn new(
        primary: Arc<dyn DataProvider>,
        secondary: Arc<dyn DataProvider>,
        budget: Arc<RequestBudget>,
        config: DataSourcesConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            budget,
            config,
        }
    }

    pub fn budget(&self) -> &Arc<RequestBudget> {
        &self.budget
    }

    /// Resolve snapshots for every instrument of the batch.
    ///
    /// Never fails as a whole: instruments no source could serve carry
    /// `DataUnavailable` records for every field.
    pub async fn fetch_batch(&self, instruments: &[Instrument]) -> MarketBatch {
        let size = self.config.sub_batch_size.max(1);
        let concurrency = self.config.max_concurrency.max(1);

        let mut results: Vec<(SubBatchReport, Vec<MarketSnapshot>)> =
            stream::iter(instruments.chunks(size).enumerate())
                .map(|(index, chunk)| self.fetch_sub_batch(index, chunk))
                .buffer_unordered(concurrency)
                .collect()
                .await;

        // Completion order is arbitrary; restore input order
        results.sort_by_key(|(report, _)| report.index);

        let mut snapshots = Vec::with_capacity(instruments.len());
        let mut reports = Vec::with_capacity(results.len());
        for (report, batch) in results {
            reports.push(report);
            snapshots.extend(batch);
        }

        let batch = MarketBatch { snapshots, reports };
        info!(
            instruments = instruments.len(),
            sub_batches = batch.reports.len(),
            success = batch.count_status(FetchStatus::Success),
            fallback = batch.count_status(FetchStatus::FallbackUsed),
            unavailable = batch.count_status(FetchStatus::Unavailable),
            discrepancies = batch.discrepancy_count(),
            "Market data batch resolved"
        );
        batch
    }

    async fn fetch_sub_batch(
        &self,
        index: usize,
        instruments: &[Instrument],
    ) -> (SubBatchReport, Vec<MarketSnapshot>) {
        let symbols: Vec<String> = instruments.iter().map(|i| i.symbol.clone()).collect();
        let symbols = symbols.as_slice();

        // Secondary is always queried: fallback when the primary fails,
        // cross-validation when it succeeds.
        let (primary, secondary) = tokio::join!(
            self.call_with_retry(&self.primary, &self.config.primary, |p| async move {
                p.fetch_snapshots(symbols).await
            }),
            self.call_with_retry(&self.secondary, &self.config.secondary, |p| async move {
                p.fetch_snapshots(symbols).await
            }),
        );

        let status = match (primary.succeeded(), secondary.succeeded()) {
            (true, _) => FetchStatus::Success,
            (false, true) => FetchStatus::FallbackUsed,
            (false, false) => FetchStatus::Unavailable,
        };

        match status {
            FetchStatus::FallbackUsed => warn!(
                sub_batch = index,
                size = instruments.len(),
                attempts = primary.attempts,
                error = primary.last_error.as_deref().unwrap_or("empty response"),
                "Primary source failed, using secondary for whole sub-batch"
            ),
            FetchStatus::Unavailable => warn!(
                sub_batch = index,
                size = instruments.len(),
                primary_error = primary.last_error.as_deref().unwrap_or("empty response"),
                secondary_error = secondary.last_error.as_deref().unwrap_or("empty response"),
                "Both sources failed for sub-batch"
            ),
            _ => {
                if !secondary.succeeded() {
                    debug!(sub_batch = index, "Secondary unavailable, sub-batch not cross-validated");
                }
            }
        }

        let primary_by_symbol: HashMap<&str, &SourceRecord> =
            primary.value.iter().map(|r| (r.symbol(), r)).collect();
        let secondary_by_symbol: HashMap<&str, &SourceRecord> =
            secondary.value.iter().map(|r| (r.symbol(), r)).collect();

        let snapshots = instruments
            .iter()
            .map(|instrument| {
                self.resolve(
                    instrument,
                    primary_by_symbol.get(instrument.symbol.as_str()).copied(),
                    secondary_by_symbol.get(instrument.symbol.as_str()).copied(),
                    status,
                )
            })
            .collect();

        let report = SubBatchReport {
            index,
            size: instruments.len(),
            status,
            primary_attempts: primary.attempts,
            validated: primary.succeeded() && secondary.succeeded(),
            primary_error: primary.last_error,
        };
        (report, snapshots)
    }

    /// Merge both sources' records for one instrument.
    fn resolve(
        &self,
        instrument: &Instrument,
        primary: Option<&SourceRecord>,
        secondary: Option<&SourceRecord>,
        status: FetchStatus,
    ) -> MarketSnapshot {
        let source = primary
            .or(secondary)
            .map(|r| r.source().to_string())
            .unwrap_or_else(|| self.primary.name().to_string());
        let timestamp = primary
            .or(secondary)
            .map(|r| r.quote.timestamp)
            .unwrap_or_else(chrono::Utc::now);

        let mut quote = QuoteSnapshot::empty(&instrument.symbol, &source);
        quote.timestamp = timestamp;
        let mut fundamental = FundamentalSnapshot::empty(&instrument.symbol, &source);

        let mut filled_from_secondary = Vec::new();
        let mut discrepancies = Vec::new();
        let mut unavailable = Vec::new();

        for field in Field::ALL {
            let p = primary.and_then(|r| r.get(field));
            let s = secondary.and_then(|r| r.get(field));

            if field.is_critical() {
                if let (Some(pv), Some(sv)) = (p, s) {
                    let diff = relative_diff(pv, sv);
                    if diff > self.config.discrepancy_threshold {
                        warn!(
                            symbol = %instrument.symbol,
                            field = %field,
                            primary = pv,
                            secondary = sv,
                            relative_diff = diff,
                            "Source discrepancy"
                        );
                        discrepancies.push(SourceDiscrepancy {
                            field,
                            primary_source: self.primary.name().to_string(),
                            primary_value: pv,
                            secondary_source: self.secondary.name().to_string(),
                            secondary_value: sv,
                            relative_diff: diff,
                        });
                    }
                }
            }

            let value = match (p, s) {
                (Some(v), _) => Some(v),
                (None, Some(v)) => {
                    filled_from_secondary.push(field);
                    Some(v)
                }
                (None, None) => {
                    let reason = if status == FetchStatus::Unavailable {
                        "no source responded".to_string()
                    } else {
                        format!(
                            "not reported by {} or {}",
                            self.primary.name(),
                            self.secondary.name()
                        )
                    };
                    unavailable.push(DataUnavailable { field, reason });
                    None
                }
            };

            set_field(&mut quote, &mut fundamental, field, value);
        }

        MarketSnapshot {
            instrument: instrument.clone(),
            quote,
            fundamental,
            filled_from_secondary,
            discrepancies,
            unavailable,
        }
    }

    /// Fetch daily candles for one symbol, falling back to the secondary.
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<(Vec<Candle>, FetchStatus), String> {
        let primary = self
            .call_with_retry(&self.primary, &self.config.primary, |p| async move {
                p.fetch_daily_candles(symbol, limit).await
            })
            .await;
        if primary.succeeded() {
            return Ok((primary.value, FetchStatus::Success));
        }

        debug!(
            symbol,
            error = primary.last_error.as_deref().unwrap_or("empty response"),
            "Primary candles failed, trying secondary"
        );

        let secondary = self
            .call_with_retry(&self.secondary, &self.config.secondary, |p| async move {
                p.fetch_daily_candles(symbol, limit).await
            })
            .await;
        if secondary.succeeded() {
            return Ok((secondary.value, FetchStatus::FallbackUsed));
        }

        Err(format!(
            "{}: {}; {}: {}",
            self.primary.name(),
            primary.last_error.as_deref().unwrap_or("empty response"),
            self.secondary.name(),
            secondary.last_error.as_deref().unwrap_or("empty response"),
        ))
    }

    /// Call one source with bounded retries and exponential backoff.
    ///
    /// An empty result counts as a failed attempt. Non-recoverable errors
    /// stop retrying immediately.
    async fn call_with_retry<T, F, Fut>(
        &self,
        provider: &Arc<dyn DataProvider>,
        policy: &SourceConfig,
        request_fn: F,
    ) -> Attempted<T>
    where
        F: Fn(Arc<dyn DataProvider>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, ProviderError>>,
    {
        let name = provider.name();
        let mut attempts = 0;
        let mut last_error = None;
        let mut retry_after: Option<Duration> = None;

        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                let delay = policy.backoff(attempt).max(retry_after.take().unwrap_or_default());
                debug!(
                    provider = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                );
                tokio::time::sleep(delay).await;
            }

            attempts += 1;
            match self.budget.call(name, request_fn(Arc::clone(provider))).await {
                Ok(value) if !value.is_empty() => {
                    return Attempted {
                        status: FetchStatus::Success,
                        value,
                        attempts,
                        last_error: None,
                    };
                }
                Ok(_) => {
                    last_error = Some("empty response".to_string());
                }
                Err(e) => {
                    let recoverable = e.is_recoverable();
                    if let ProviderError::RateLimited {
                        retry_after_secs: Some(secs),
                    } = &e
                    {
                        retry_after = Some(Duration::from_secs(*secs));
                    }
                    last_error = Some(e.to_string());
                    if !recoverable {
                        debug!(provider = name, error = %e, "Non-recoverable error, not retrying");
                        break;
                    }
                }
            }
        }

        Attempted {
            status: FetchStatus::RetryableFailure,
            value: Vec::new(),
            attempts,
            last_error,
        }
    }
}

fn set_field(
    quote: &mut QuoteSnapshot,
    fundamental: &mut FundamentalSnapshot,
    field: Field,
    value: Option<f64>,
) {
    match field {
        Field::Price => quote.price = value,
        Field::ChangePct => quote.change_pct = value,
        Field::Volume => quote.volume = value,
        Field::TradedValue => quote.traded_value = value,
        Field::TurnoverRate => quote.turnover_rate = value,
        Field::EarningsMultiple => fundamental.earnings_multiple = value,
        Field::BookMultiple => fundamental.book_multiple = value,
        Field::MarketCap => fundamental.market_cap = value,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ListingStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves fixed records, optionally failing the first `failures` calls.
    struct FixedProvider {
        name: &'static str,
        records: Vec<SourceRecord>,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FixedProvider {
        fn new(name: &'static str, records: Vec<SourceRecord>, failures: u32) -> Self {
            Self {
                name,
                records,
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DataProvider for FixedProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_snapshots(
            &self,
            symbols: &[String],
        ) -> Result<Vec<SourceRecord>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProviderError::Network("flaky".into()));
            }
            Ok(self
                .records
                .iter()
                .filter(|r| symbols.iter().any(|s| s == r.symbol()))
                .cloned()
                .collect())
        }

        async fn fetch_daily_candles(
            &self,
            _symbol: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn record(source: &str, symbol: &str, price: Option<f64>, pe: Option<f64>) -> SourceRecord {
        let mut quote = QuoteSnapshot::empty(symbol, source);
        quote.price = price;
        quote.change_pct = Some(1.0);
        let mut fundamental = FundamentalSnapshot::empty(symbol, source);
        fundamental.earnings_multiple = pe;
        fundamental.market_cap = Some(1e10);
        SourceRecord { quote, fundamental }
    }

    fn provider(primary: FixedProvider, secondary: FixedProvider) -> MarketDataProvider {
        let mut config = DataSourcesConfig::default();
        config.primary.backoff_base_ms = 1;
        config.secondary.backoff_base_ms = 1;
        config.sub_batch_size = 2;
        MarketDataProvider::new(
            Arc::new(primary),
            Arc::new(secondary),
            Arc::new(RequestBudget::new(4, Duration::from_secs(5))),
            config,
        )
    }

    fn instruments(codes: &[&str]) -> Vec<Instrument> {
        codes
            .iter()
            .map(|c| Instrument::new(*c, "测试", ListingStatus::Active))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_field_filled_from_secondary() {
        let primary = FixedProvider::new("p", vec![record("p", "600000.SH", Some(10.0), None)], 0);
        let secondary =
            FixedProvider::new("s", vec![record("s", "600000.SH", Some(10.1), Some(8.0))], 0);
        let mdp = provider(primary, secondary);

        let batch = mdp.fetch_batch(&instruments(&["600000"])).await;
        let snap = &batch.snapshots[0];
        assert_eq!(snap.get(Field::Price), Some(10.0));
        assert_eq!(snap.get(Field::EarningsMultiple), Some(8.0));
        assert!(snap.filled_from_secondary.contains(&Field::EarningsMultiple));
        assert!(!snap.has_discrepancy());
        assert_eq!(batch.reports[0].status, FetchStatus::Success);
        assert!(batch.reports[0].validated);
    }

    #[tokio::test]
    async fn test_field_missing_everywhere_is_unavailable() {
        let primary = FixedProvider::new("p", vec![record("p", "600000.SH", Some(10.0), None)], 0);
        let secondary = FixedProvider::new("s", vec![record("s", "600000.SH", Some(10.0), None)], 0);
        let mdp = provider(primary, secondary);

        let batch = mdp.fetch_batch(&instruments(&["600000"])).await;
        let snap = &batch.snapshots[0];
        assert_eq!(snap.get(Field::EarningsMultiple), None);
        assert!(snap
            .unavailable
            .iter()
            .any(|u| u.field == Field::EarningsMultiple));
    }

    #[tokio::test]
    async fn test_sub_batches_keep_input_order() {
        let codes = ["600000", "600001", "600002", "600003", "600004"];
        let records: Vec<_> = codes
            .iter()
            .map(|c| record("p", &format!("{}.SH", c), Some(10.0), Some(10.0)))
            .collect();
        let primary = FixedProvider::new("p", records.clone(), 0);
        let secondary = FixedProvider::new("s", records, 0);
        let mdp = provider(primary, secondary);

        let batch = mdp.fetch_batch(&instruments(&codes)).await;
        let symbols: Vec<_> = batch.snapshots.iter().map(|s| s.symbol().to_string()).collect();
        assert_eq!(
            symbols,
            vec!["600000.SH", "600001.SH", "600002.SH", "600003.SH", "600004.SH"]
        );
        assert_eq!(batch.reports.len(), 3);
        assert!(batch.reports.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[tokio::test]
    async fn test_flaky_primary_recovers_within_retries() {
        let primary =
            FixedProvider::new("p", vec![record("p", "600000.SH", Some(10.0), Some(9.0))], 2);
        let secondary =
            FixedProvider::new("s", vec![record("s", "600000.SH", Some(10.0), Some(9.0))], 0);
        let mdp = provider(primary, secondary);

        let batch = mdp.fetch_batch(&instruments(&["600000"])).await;
        assert_eq!(batch.reports[0].status, FetchStatus::Success);
        assert_eq!(batch.reports[0].primary_attempts, 3);
        assert!(batch.snapshots[0].filled_from_secondary.is_empty());
    }
}
