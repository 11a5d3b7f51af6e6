//! Screener engine module.
//!
//! The central orchestrator of a screening run. Stages run in order over
//! an immutable configuration; each consumes the previous stage's output
//! and produces a new, smaller candidate list.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use zero_common::validation::Validate;

use crate::data::{
    DataProvider, FetchStatus, MarketDataProvider, RequestBudget, SinaAdapter, TencentAdapter,
    UniverseSource,
};
use crate::error::{Result, ScreenerError};

use super::config::{DataSourcesConfig, ScreenerConfig};
use super::enrichment::EnrichmentStage;
use super::filter::HardFilterStage;
use super::report::{
    EnrichmentSummary, MarketDataSummary, RankedOutput, RunMetadata, UniverseSummary,
};
use super::scoring::ScoringEngine;
use super::universe::UniverseLoader;

// ============================================================================
// Screener Engine
// ============================================================================

/// The main screener engine.
///
/// Orchestrates a full market run:
/// 1. Load and sanity-check the universe
/// 2. Resolve market data with fallback and cross-validation
/// 3. Apply hard filters
/// 4. Score and rank (pass 1)
/// 5. Enrich the top K, re-rank, keep the top N
pub struct ScreenerEngine {
    config: ScreenerConfig,
    universe: UniverseLoader,
    market_data: Arc<MarketDataProvider>,
    filter: HardFilterStage,
    scoring: ScoringEngine,
    enrichment: EnrichmentStage,
}

impl ScreenerEngine {
    /// Create an engine over explicit sources.
    ///
    /// The configuration is validated here, before any network I/O.
    pub fn new(
        config: ScreenerConfig,
        universe: Arc<dyn UniverseSource>,
        primary: Arc<dyn DataProvider>,
        secondary: Arc<dyn DataProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let budget = Arc::new(build_budget(
            &config.data,
            primary.name(),
            secondary.name(),
            universe.name(),
        ));

        let market_data = Arc::new(MarketDataProvider::new(
            primary,
            secondary,
            Arc::clone(&budget),
            config.data.clone(),
        ));

        Ok(Self {
            universe: UniverseLoader::new(universe, budget, config.universe.clone()),
            filter: HardFilterStage::new(&config.filters),
            scoring: ScoringEngine::new(config.weights, config.missing_data_policy),
            enrichment: EnrichmentStage::new(
                Arc::clone(&market_data),
                config.enrichment.clone(),
            ),
            market_data,
            config,
        })
    }

    /// Create an engine over the configured Tencent (primary) and Sina
    /// (secondary and listing) endpoints.
    pub fn with_default_sources(config: ScreenerConfig) -> Result<Self> {
        config.validate()?;

        let primary = Arc::new(TencentAdapter::from_config(&config.data.primary));
        let sina = Arc::new(SinaAdapter::from_config(&config.data.secondary));
        Self::new(config, sina.clone(), primary, sina)
    }

    pub fn config(&self) -> &ScreenerConfig {
        &self.config
    }

    /// Run the pipeline to completion.
    ///
    /// Returns the complete ranked output or a run-level error; nothing is
    /// published here.
    pub async fn run(&self) -> Result<RankedOutput> {
        let started_at = Utc::now();
        let run_id = zero_common::logging::generate_trace_id();

        info!(run_id = %run_id, "Starting full market screening run");

        // Phase 1: Universe
        let universe = self.universe.load().await?;
        info!(
            run_id = %run_id,
            universe = universe.len(),
            retrieved = universe.retrieved,
            "Phase 1 (Universe) complete"
        );

        // Phase 2: Market data
        let batch = self.market_data.fetch_batch(&universe.instruments).await;
        let market_data = MarketDataSummary {
            sub_batches: batch.reports.len(),
            fallback: batch.count_status(FetchStatus::FallbackUsed),
            unavailable: batch.count_status(FetchStatus::Unavailable),
            discrepancies: batch.discrepancy_count(),
        };
        info!(
            run_id = %run_id,
            snapshots = batch.snapshots.len(),
            fallback = market_data.fallback,
            unavailable = market_data.unavailable,
            discrepancies = market_data.discrepancies,
            "Phase 2 (Market data) complete"
        );

        // Phase 3: Hard filters
        let filtered = self.filter.apply(batch.snapshots);
        info!(
            run_id = %run_id,
            input = universe.len(),
            passed = filtered.survivors.len(),
            excluded = filtered.exclusions.len(),
            "Phase 3 (Hard filter) complete"
        );
        let filter_survivors = filtered.survivors.len();

        // Phase 4: Scoring
        let scored = self.scoring.score(filtered.survivors);
        info!(
            run_id = %run_id,
            ranked = scored.ranked.len(),
            excluded = scored.excluded.len(),
            policy = %self.config.missing_data_policy,
            "Phase 4 (Scoring) complete"
        );
        let scored_count = scored.ranked.len();

        // Phase 5: Enrichment
        let enriched = self
            .enrichment
            .run(scored.ranked, &self.scoring, self.config.output.top_n)
            .await;
        info!(
            run_id = %run_id,
            considered = enriched.considered,
            output = enriched.finalists.len(),
            "Phase 5 (Enrichment) complete"
        );

        let completed_at = Utc::now();
        let duration_secs = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let metadata = RunMetadata {
            run_id,
            started_at,
            completed_at,
            duration_secs,
            universe: UniverseSummary {
                retrieved: universe.retrieved,
                expected: universe.expected,
                excluded: universe.excluded,
                size: universe.len(),
            },
            market_data,
            filter_stages: filtered.stages,
            filter_survivors,
            scored: scored_count,
            scoring_excluded: scored.excluded.len(),
            enrichment: EnrichmentSummary {
                considered: enriched.considered,
                enriched: enriched.enriched,
                fallback: enriched.fallback,
                unavailable: enriched.unavailable,
                excluded: enriched.excluded.len(),
            },
            weights: self.config.weights,
            missing_data_policy: self.config.missing_data_policy,
            thresholds: self.config.filters.clone(),
            top_k: self.config.enrichment.top_k,
            top_n: self.config.output.top_n,
            holdings: self.config.holdings.clone(),
        };

        let output = RankedOutput::new(metadata, &enriched.finalists);
        info!(
            run_id = %output.metadata.run_id,
            rows = output.rows.len(),
            duration = format!("{:.1}s", duration_secs),
            "{}",
            output.summary()
        );

        Ok(output)
    }

    /// Run until completion or until `shutdown` resolves.
    ///
    /// On shutdown the in-flight run is dropped and
    /// [`ScreenerError::Cancelled`] is returned.
    pub async fn run_until_cancelled<F>(&self, shutdown: F) -> Result<RankedOutput>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                warn!("Screening run cancelled");
                Err(ScreenerError::Cancelled)
            }
        }
    }
}

/// Resolve once `signal` reports a shutdown request.
///
/// A signal that fails to register never resolves, so the run is not
/// mistaken for a cancelled one.
pub async fn shutdown_on<F, E>(signal: F)
where
    F: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    match signal.await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

/// One budget for every source of the run.
fn build_budget(
    config: &DataSourcesConfig,
    primary: &str,
    secondary: &str,
    universe: &str,
) -> RequestBudget {
    let mut budget = RequestBudget::new(config.max_concurrency, config.primary.timeout())
        .with_source(primary, config.primary.rate_limit_rpm, config.primary.timeout())
        .with_source(secondary, config.secondary.rate_limit_rpm, config.secondary.timeout());

    // A listing source that is not one of the quote sources shares the
    // secondary's limits.
    if universe != primary && universe != secondary {
        budget = budget.with_source(
            universe,
            config.secondary.rate_limit_rpm,
            config.secondary.timeout(),
        );
    }
    budget
}
