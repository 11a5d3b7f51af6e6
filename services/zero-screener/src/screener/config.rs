//! Screener configuration module.
//!
//! Defines configuration structures for the full market screener. The
//! whole tree is read once per run and passed down by reference; no stage
//! reads process-wide state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use zero_common::validation::{Validate, ValidationError, ValidationResult};

use super::report::ReportFormat;
use super::scoring::FactorDimension;

/// Allowed deviation of the weight sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

// ============================================================================
// Main Screener Configuration
// ============================================================================

/// Configuration for the full market screener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    /// Factor weights (must sum to 1.0)
    #[serde(default)]
    pub weights: FactorWeights,

    /// How a missing factor input is handled
    #[serde(default)]
    pub missing_data_policy: MissingDataPolicy,

    /// Hard filter thresholds
    #[serde(default)]
    pub filters: FilterConfig,

    /// Universe loading
    #[serde(default)]
    pub universe: UniverseConfig,

    /// Enrichment stage
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Data sources, batching and cross-validation
    #[serde(default)]
    pub data: DataSourcesConfig,

    /// Current holdings, echoed into the output for downstream consumers.
    #[serde(default)]
    pub holdings: Vec<String>,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            missing_data_policy: MissingDataPolicy::default(),
            filters: FilterConfig::default(),
            universe: UniverseConfig::default(),
            enrichment: EnrichmentConfig::default(),
            output: OutputConfig::default(),
            data: DataSourcesConfig::default(),
            holdings: Vec::new(),
        }
    }
}

impl ScreenerConfig {
    /// Type the `screener` section of the shared config.
    pub fn from_common(config: &zero_common::Config) -> anyhow::Result<Self> {
        config.section("screener")
    }
}

impl Validate for ScreenerConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for section in [
            self.weights.validate(),
            self.filters.validate(),
            self.universe.validate(),
            self.data.validate(),
        ] {
            if let Err(e) = section {
                errors.push(e);
            }
        }

        if self.output.top_n == 0 {
            errors.push(ValidationError::invalid("output.top_n", "must be at least 1"));
        }
        if self.enrichment.top_k < self.output.top_n {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "enrichment.top_k ({}) must not be smaller than output.top_n ({})",
                    self.enrichment.top_k, self.output.top_n
                ),
            });
        }
        if self.enrichment.history_days < MIN_HISTORY_DAYS {
            errors.push(ValidationError::invalid(
                "enrichment.history_days",
                format!("must be at least {}", MIN_HISTORY_DAYS),
            ));
        }
        if self.output.formats.is_empty() {
            errors.push(ValidationError::invalid("output.formats", "at least one format required"));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.output.formats.iter().find(|f| !seen.insert(**f)) {
            errors.push(ValidationError::invalid(
                "output.formats",
                format!("format {} listed more than once", dup),
            ));
        }

        ValidationError::collect(errors)
    }
}

// ============================================================================
// Factor Weights
// ============================================================================

/// Weight of each factor dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorWeights {
    #[serde(default = "default_growth_weight")]
    pub growth: f64,
    #[serde(default = "default_valuation_weight")]
    pub valuation: f64,
    #[serde(default = "default_quality_weight")]
    pub quality: f64,
    #[serde(default = "default_safety_weight")]
    pub safety: f64,
    #[serde(default = "default_momentum_weight")]
    pub momentum: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            growth: default_growth_weight(),
            valuation: default_valuation_weight(),
            quality: default_quality_weight(),
            safety: default_safety_weight(),
            momentum: default_momentum_weight(),
        }
    }
}

fn default_growth_weight() -> f64 {
    0.30
}

fn default_valuation_weight() -> f64 {
    0.25
}

fn default_quality_weight() -> f64 {
    0.20
}

fn default_safety_weight() -> f64 {
    0.15
}

fn default_momentum_weight() -> f64 {
    0.10
}

impl FactorWeights {
    pub fn get(&self, dimension: FactorDimension) -> f64 {
        match dimension {
            FactorDimension::Growth => self.growth,
            FactorDimension::Valuation => self.valuation,
            FactorDimension::Quality => self.quality,
            FactorDimension::Safety => self.safety,
            FactorDimension::Momentum => self.momentum,
        }
    }

    pub fn sum(&self) -> f64 {
        FactorDimension::ALL.iter().map(|d| self.get(*d)).sum()
    }
}

impl Validate for FactorWeights {
    fn validate(&self) -> ValidationResult<()> {
        for dimension in FactorDimension::ALL {
            let w = self.get(dimension);
            if !w.is_finite() || w < 0.0 {
                return Err(ValidationError::invalid(
                    format!("weights.{}", dimension),
                    format!("must be a non-negative number, got {}", w),
                ));
            }
        }

        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ValidationError::invalid(
                "weights",
                format!("must sum to 1.0, got {}", sum),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Missing Data Policy
// ============================================================================

/// Treatment of an instrument whose raw input for a dimension is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    /// Drop the dimension and renormalize weights over the remaining ones.
    #[default]
    Redistribute,
    /// Exclude the instrument from the ranking.
    Exclude,
}

impl std::fmt::Display for MissingDataPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redistribute => write!(f, "redistribute"),
            Self::Exclude => write!(f, "exclude"),
        }
    }
}

// ============================================================================
// Filter Configuration
// ============================================================================

/// Hard filter thresholds. Money amounts are in yuan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Exclude ST (Special Treatment) stocks
    #[serde(default = "default_true")]
    pub exclude_special_treatment: bool,

    /// Minimum last price (yuan)
    #[serde(default = "default_min_price")]
    pub min_price: f64,

    /// Minimum market cap (yuan)
    #[serde(default = "default_min_market_cap")]
    pub min_market_cap: f64,

    /// Require a positive earnings multiple
    #[serde(default = "default_true")]
    pub require_positive_earnings: bool,

    /// Minimum traded value today (yuan)
    #[serde(default = "default_min_traded_value")]
    pub min_traded_value: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_special_treatment: true,
            min_price: default_min_price(),
            min_market_cap: default_min_market_cap(),
            require_positive_earnings: true,
            min_traded_value: default_min_traded_value(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_price() -> f64 {
    3.0
}

fn default_min_market_cap() -> f64 {
    5_000_000_000.0 // 50亿
}

fn default_min_traded_value() -> f64 {
    50_000_000.0 // 5000万
}

impl Validate for FilterConfig {
    fn validate(&self) -> ValidationResult<()> {
        for (field, value) in [
            ("filters.min_price", self.min_price),
            ("filters.min_market_cap", self.min_market_cap),
            ("filters.min_traded_value", self.min_traded_value),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::invalid(
                    field,
                    format!("must be a non-negative number, got {}", value),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Universe Configuration
// ============================================================================

/// Universe loading and sanity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Records per listing page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Hard cap on pages fetched
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Expected universe size; the source's reported total is used when unset
    #[serde(default)]
    pub expected_size: Option<usize>,

    /// Allowed relative deviation from the expected size
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: f64,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            expected_size: None,
            size_tolerance: default_size_tolerance(),
        }
    }
}

fn default_page_size() -> usize {
    80
}

fn default_max_pages() -> usize {
    100
}

fn default_size_tolerance() -> f64 {
    0.05
}

impl Validate for UniverseConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.page_size == 0 {
            return Err(ValidationError::invalid("universe.page_size", "must be at least 1"));
        }
        if self.max_pages == 0 {
            return Err(ValidationError::invalid("universe.max_pages", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.size_tolerance) {
            return Err(ValidationError::invalid(
                "universe.size_tolerance",
                format!("must be in [0, 1), got {}", self.size_tolerance),
            ));
        }
        if self.expected_size == Some(0) {
            return Err(ValidationError::invalid("universe.expected_size", "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Enrichment Configuration
// ============================================================================

/// Closes needed for the 60-day moving average.
pub const MIN_HISTORY_DAYS: usize = 60;

/// Enrichment stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Finalists taken from the pass-1 ranking (K)
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Daily candles requested per finalist
    #[serde(default = "default_history_days")]
    pub history_days: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            history_days: default_history_days(),
        }
    }
}

fn default_top_k() -> usize {
    200
}

fn default_history_days() -> usize {
    120
}

// ============================================================================
// Output Configuration
// ============================================================================

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Final output size (N)
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Directory the artifact is published to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Formats written on publish; JSON is the canonical artifact
    #[serde(default = "default_formats")]
    pub formats: Vec<ReportFormat>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            output_dir: default_output_dir(),
            formats: default_formats(),
        }
    }
}

fn default_top_n() -> usize {
    50
}

fn default_output_dir() -> PathBuf {
    zero_common::config::config_dir().join("reports").join("screener")
}

fn default_formats() -> Vec<ReportFormat> {
    vec![ReportFormat::Json, ReportFormat::Markdown]
}

// ============================================================================
// Data Source Configuration
// ============================================================================

/// Data sources, batching and cross-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourcesConfig {
    /// Primary quote source
    #[serde(default = "default_primary")]
    pub primary: SourceConfig,

    /// Secondary source (universe listing, fallback, validation)
    #[serde(default = "default_secondary")]
    pub secondary: SourceConfig,

    /// Instruments per sub-batch request
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,

    /// Maximum in-flight requests across all stages
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Relative difference above which a discrepancy is flagged
    #[serde(default = "default_discrepancy_threshold")]
    pub discrepancy_threshold: f64,
}

impl Default for DataSourcesConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            secondary: default_secondary(),
            sub_batch_size: default_sub_batch_size(),
            max_concurrency: default_max_concurrency(),
            discrepancy_threshold: default_discrepancy_threshold(),
        }
    }
}

fn default_primary() -> SourceConfig {
    SourceConfig {
        name: "tencent".into(),
        quote_url: "http://qt.gtimg.cn".into(),
        kline_url: "https://web.ifzq.gtimg.cn".into(),
        listing_url: None,
        ..SourceConfig::default()
    }
}

fn default_secondary() -> SourceConfig {
    SourceConfig {
        name: "sina".into(),
        quote_url: "http://hq.sinajs.cn".into(),
        kline_url: "https://quotes.sina.cn".into(),
        listing_url: Some("http://vip.stock.finance.sina.com.cn".into()),
        ..SourceConfig::default()
    }
}

fn default_sub_batch_size() -> usize {
    50
}

fn default_max_concurrency() -> usize {
    6
}

fn default_discrepancy_threshold() -> f64 {
    0.05
}

impl Validate for DataSourcesConfig {
    fn validate(&self) -> ValidationResult<()> {
        self.primary.validate_as("data.primary")?;
        self.secondary.validate_as("data.secondary")?;

        if self.primary.name == self.secondary.name {
            return Err(ValidationError::Conflict {
                reason: format!("primary and secondary source are both '{}'", self.primary.name),
            });
        }
        if self.sub_batch_size == 0 {
            return Err(ValidationError::invalid("data.sub_batch_size", "must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(ValidationError::invalid("data.max_concurrency", "must be at least 1"));
        }
        if !(self.discrepancy_threshold > 0.0 && self.discrepancy_threshold < 1.0) {
            return Err(ValidationError::invalid(
                "data.discrepancy_threshold",
                format!("must be in (0, 1), got {}", self.discrepancy_threshold),
            ));
        }
        Ok(())
    }
}

/// Endpoint, throttling and retry settings for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name used in logs and snapshots
    pub name: String,

    /// Realtime quote endpoint base
    pub quote_url: String,

    /// Daily K-line endpoint base
    pub kline_url: String,

    /// Paged listing endpoint base (universe source only)
    #[serde(default)]
    pub listing_url: Option<String>,

    /// Requests per minute
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,

    /// Per-request timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry; doubles per retry (milliseconds)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            quote_url: String::new(),
            kline_url: String::new(),
            listing_url: None,
            rate_limit_rpm: default_rate_limit_rpm(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_rate_limit_rpm() -> u32 {
    300
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF_MS: u64 = 30_000;

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }

    fn validate_as(&self, prefix: &str) -> ValidationResult<()> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: format!("{}.name", prefix),
            });
        }
        for (field, url) in [("quote_url", &self.quote_url), ("kline_url", &self.kline_url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ValidationError::invalid(
                    format!("{}.{}", prefix, field),
                    format!("not an http(s) URL: '{}'", url),
                ));
            }
        }
        if self.rate_limit_rpm == 0 {
            return Err(ValidationError::invalid(
                format!("{}.rate_limit_rpm", prefix),
                "must be at least 1",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::invalid(
                format!("{}.timeout_secs", prefix),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ScreenerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enrichment.top_k, 200);
        assert_eq!(config.output.top_n, 50);
        assert_eq!(config.data.sub_batch_size, 50);
        assert_eq!(config.missing_data_policy, MissingDataPolicy::Redistribute);
    }

    #[test]
    fn test_default_weights() {
        let w = FactorWeights::default();
        assert_eq!(w.growth, 0.30);
        assert_eq!(w.valuation, 0.25);
        assert_eq!(w.quality, 0.20);
        assert_eq!(w.safety, 0.15);
        assert_eq!(w.momentum, 0.10);
        assert!((w.sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = ScreenerConfig::default();
        config.weights.growth = 0.35;
        match config.validate() {
            Err(ValidationError::InvalidValue { field, .. }) => assert_eq!(field, "weights"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = ScreenerConfig::default();
        config.weights.growth = -0.1;
        config.weights.valuation = 0.65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_top_k_smaller_than_top_n_rejected() {
        let mut config = ScreenerConfig::default();
        config.enrichment.top_k = 10;
        config.output.top_n = 20;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Conflict { .. })
        ));
    }

    #[test]
    fn test_duplicate_output_format_rejected() {
        let mut config = ScreenerConfig::default();
        config.output.formats = vec![ReportFormat::Json, ReportFormat::Json];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("output.formats"));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = ScreenerConfig::default();
        config.filters.min_price = -1.0;
        config.output.top_n = 0;
        assert!(matches!(config.validate(), Err(ValidationError::Multiple(v)) if v.len() == 2));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "weights": {"growth": 0.2, "valuation": 0.2, "quality": 0.2, "safety": 0.2, "momentum": 0.2},
            "missing_data_policy": "exclude",
            "output": {"top_n": 20},
            "holdings": ["600519.SH"]
        }"#;
        let config: ScreenerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.missing_data_policy, MissingDataPolicy::Exclude);
        assert_eq!(config.output.top_n, 20);
        assert_eq!(config.filters.min_price, 3.0);
        assert_eq!(config.data.primary.name, "tencent");
        assert_eq!(config.holdings, vec!["600519.SH".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles() {
        let source = SourceConfig {
            backoff_base_ms: 100,
            ..default_primary()
        };
        assert_eq!(source.backoff(1), Duration::from_millis(100));
        assert_eq!(source.backoff(2), Duration::from_millis(200));
        assert_eq!(source.backoff(3), Duration::from_millis(400));
        assert_eq!(source.backoff(40), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_same_source_twice_rejected() {
        let mut config = ScreenerConfig::default();
        config.data.secondary.name = "tencent".into();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Conflict { .. })
        ));
    }

    #[test]
    fn test_from_common_section() {
        let common: zero_common::Config =
            serde_json::from_str(r#"{"screener": {"enrichment": {"top_k": 100}}}"#).unwrap();
        let config = ScreenerConfig::from_common(&common).unwrap();
        assert_eq!(config.enrichment.top_k, 100);
    }
}
