//! Enrichment stage.
//!
//! Takes the top K of the pass-1 ranking, fetches daily candles for those
//! finalists only, recomputes momentum from the trend indicators and
//! re-ranks before truncating to N. The candidate set only ever shrinks.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::{FetchStatus, MarketDataProvider};

use super::config::EnrichmentConfig;
use super::filter::Exclusion;
use super::scoring::{QualityFlag, ScoredInstrument, ScoringEngine};
use super::technical::TechnicalIndicators;

/// Finalists after enrichment, plus stage diagnostics.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentOutcome {
    /// Top N, ranked
    pub finalists: Vec<ScoredInstrument>,
    /// Instruments taken into the stage (min(K, ranked))
    pub considered: usize,
    /// Finalists with indicators computed
    pub enriched: usize,
    /// Finalists whose candles came from the secondary source
    pub fallback: usize,
    /// Finalists without usable candles
    pub unavailable: usize,
    /// Finalists dropped by the missing-data policy
    pub excluded: Vec<Exclusion>,
}

/// Enrichment over the pass-1 ranking.
pub struct EnrichmentStage {
    provider: Arc<MarketDataProvider>,
    config: EnrichmentConfig,
}

impl EnrichmentStage {
    pub fn new(provider: Arc<MarketDataProvider>, config: EnrichmentConfig) -> Self {
        Self { provider, config }
    }

    /// Enrich the top K of `ranked` and keep the best `top_n`.
    pub async fn run(
        &self,
        ranked: Vec<ScoredInstrument>,
        scoring: &ScoringEngine,
        top_n: usize,
    ) -> EnrichmentOutcome {
        let mut finalists = ranked;
        finalists.truncate(self.config.top_k);
        let considered = finalists.len();

        info!(
            finalists = considered,
            history_days = self.config.history_days,
            "Fetching history for finalists"
        );

        let fetched = self.fetch_indicators(&finalists).await;

        let mut enriched = 0;
        let mut fallback = 0;
        let mut unavailable = 0;
        let mut momentum = Vec::with_capacity(finalists.len());

        for (instrument, (technicals, status)) in finalists.iter_mut().zip(fetched) {
            if status == FetchStatus::FallbackUsed {
                fallback += 1;
            }
            let metric = technicals.as_ref().and_then(TechnicalIndicators::momentum_metric);
            if technicals.is_some() {
                enriched += 1;
            }
            if metric.is_none() {
                unavailable += 1;
                instrument.flags.push(QualityFlag::EnrichmentUnavailable);
                instrument.flags.sort();
                instrument.flags.dedup();
            }
            instrument.technicals = technicals;
            momentum.push(metric);
        }

        let rescored = scoring.rescore_momentum(finalists, &momentum);
        let mut finalists = rescored.ranked;
        finalists.truncate(top_n);

        info!(
            considered,
            enriched,
            fallback,
            unavailable,
            excluded = rescored.excluded.len(),
            output = finalists.len(),
            "Enrichment complete"
        );

        EnrichmentOutcome {
            finalists,
            considered,
            enriched,
            fallback,
            unavailable,
            excluded: rescored.excluded,
        }
    }

    /// Candles and indicators per finalist, in input order.
    async fn fetch_indicators(
        &self,
        finalists: &[ScoredInstrument],
    ) -> Vec<(Option<TechnicalIndicators>, FetchStatus)> {
        let history_days = self.config.history_days;
        let concurrency = self.provider.budget().max_concurrency();

        let mut results: Vec<(usize, Option<TechnicalIndicators>, FetchStatus)> =
            stream::iter(finalists.iter().enumerate())
                .map(|(index, instrument)| async move {
                    let symbol = instrument.symbol();
                    match self.provider.fetch_candles(symbol, history_days).await {
                        Ok((candles, status)) => {
                            let technicals = TechnicalIndicators::compute(&candles);
                            if technicals.is_none() {
                                debug!(symbol, candles = candles.len(), "Too few candles for indicators");
                            }
                            (index, technicals, status)
                        }
                        Err(error) => {
                            warn!(symbol, error = %error, "History unavailable for finalist");
                            (index, None, FetchStatus::Unavailable)
                        }
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        results.sort_by_key(|(index, _, _)| *index);
        results.into_iter().map(|(_, t, s)| (t, s)).collect()
    }
}
