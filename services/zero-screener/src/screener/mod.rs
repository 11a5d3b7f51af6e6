//! Full Market Screener Module.
//!
//! Scans the entire A-share market and ranks it by a five-factor
//! composite score.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                  全市场筛选流水线                                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌─────────────┐     ┌─────────────┐     ┌─────────────┐           │
//! │  │  股票池     │────▶│  行情数据   │────▶│  硬性筛选   │           │
//! │  │  Universe   │     │ MarketData  │     │  Filters    │           │
//! │  └─────────────┘     └─────────────┘     └──────┬──────┘           │
//! │                                                 │                   │
//! │  ┌─────────────┐     ┌─────────────┐     ┌──────▼──────┐           │
//! │  │  排名输出   │◀────│  技术增强   │◀────│  因子打分   │           │
//! │  │  Output     │     │  Top K      │     │  Scoring    │           │
//! │  └─────────────┘     └─────────────┘     └─────────────┘           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use zero_screener::screener::{ScreenerEngine, ScreenerConfig};
//!
//! let engine = ScreenerEngine::with_default_sources(ScreenerConfig::default())?;
//! let output = engine.run().await?;
//! output.publish(&engine.config().output.output_dir, &engine.config().output.formats)?;
//! ```

pub mod config;
pub mod engine;
pub mod enrichment;
pub mod filter;
pub mod report;
pub mod scoring;
pub mod technical;
pub mod universe;

pub use config::{
    DataSourcesConfig, EnrichmentConfig, FactorWeights, FilterConfig, MissingDataPolicy,
    OutputConfig, ScreenerConfig, SourceConfig, UniverseConfig,
};
pub use engine::{shutdown_on, ScreenerEngine};
pub use enrichment::{EnrichmentOutcome, EnrichmentStage};
pub use filter::{Exclusion, ExclusionReason, FilterOutcome, FilterResult, HardFilter, HardFilterStage};
pub use report::{RankedOutput, RankedRow, ReportFormat, RunMetadata};
pub use scoring::{
    percentile_ranks, rank, FactorDimension, FactorScore, QualityFlag, ScoredInstrument,
    ScoringEngine, ScoringOutcome,
};
pub use technical::TechnicalIndicators;
pub use universe::{Universe, UniverseLoader};
