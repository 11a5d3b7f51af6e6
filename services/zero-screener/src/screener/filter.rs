//! Hard filter stage for the screener.
//!
//! Implements the eligibility funnel as a conjunction of independent
//! predicates, cheapest first:
//! 1. Not special treatment (ST / *ST)
//! 2. Price floor
//! 3. Market cap floor
//! 4. Positive earnings multiple
//! 5. Traded value floor
//!
//! An instrument lacking the field a predicate needs is excluded with the
//! reason recorded; it never passes or fails by default.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::{Field, MarketSnapshot};

use super::config::FilterConfig;
use super::scoring::FactorDimension;

// ============================================================================
// Exclusions
// ============================================================================

/// Why an instrument left the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Marked special treatment
    SpecialTreatment,
    /// No source supplied a field the predicate needs
    MissingField { field: Field, detail: String },
    /// Value below the configured floor
    BelowFloor { field: Field, value: f64, floor: f64 },
    /// Earnings multiple is zero or negative
    NonPositiveEarnings { value: f64 },
    /// A factor input is missing and the policy excludes such instruments
    MissingFactor { dimension: FactorDimension },
    /// No factor dimension could be scored
    NoFactorAvailable,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpecialTreatment => write!(f, "special treatment"),
            Self::MissingField { field, detail } => write!(f, "{} unavailable: {}", field, detail),
            Self::BelowFloor { field, value, floor } => {
                write!(f, "{} {} below floor {}", field, value, floor)
            }
            Self::NonPositiveEarnings { value } => {
                write!(f, "earnings multiple {} not positive", value)
            }
            Self::MissingFactor { dimension } => write!(f, "{} factor unavailable", dimension),
            Self::NoFactorAvailable => write!(f, "no factor available"),
        }
    }
}

/// One excluded instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub symbol: String,
    /// Predicate or stage that dropped it
    pub stage: String,
    pub reason: ExclusionReason,
}

impl Exclusion {
    pub fn new(symbol: impl Into<String>, stage: impl Into<String>, reason: ExclusionReason) -> Self {
        Self {
            symbol: symbol.into(),
            stage: stage.into(),
            reason,
        }
    }

    /// Whether the exclusion came from missing data rather than a failed test.
    pub fn is_missing_data(&self) -> bool {
        matches!(
            self.reason,
            ExclusionReason::MissingField { .. }
                | ExclusionReason::MissingFactor { .. }
                | ExclusionReason::NoFactorAvailable
        )
    }
}

// ============================================================================
// Hard Filters
// ============================================================================

/// A single eligibility predicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HardFilter {
    NotSpecialTreatment,
    /// Minimum last price (yuan)
    PriceFloor(f64),
    /// Minimum market cap (yuan)
    MarketCapFloor(f64),
    PositiveEarnings,
    /// Minimum traded value (yuan)
    TradedValueFloor(f64),
}

impl HardFilter {
    /// Enabled predicates, cheapest first.
    pub fn from_config(config: &FilterConfig) -> Vec<HardFilter> {
        let mut filters = Vec::with_capacity(5);
        if config.exclude_special_treatment {
            filters.push(Self::NotSpecialTreatment);
        }
        filters.push(Self::PriceFloor(config.min_price));
        filters.push(Self::MarketCapFloor(config.min_market_cap));
        if config.require_positive_earnings {
            filters.push(Self::PositiveEarnings);
        }
        filters.push(Self::TradedValueFloor(config.min_traded_value));
        filters
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotSpecialTreatment => "not_special_treatment",
            Self::PriceFloor(_) => "price_floor",
            Self::MarketCapFloor(_) => "market_cap_floor",
            Self::PositiveEarnings => "positive_earnings",
            Self::TradedValueFloor(_) => "traded_value_floor",
        }
    }

    /// Field the predicate reads from the snapshot.
    pub fn required_field(&self) -> Option<Field> {
        match self {
            Self::NotSpecialTreatment => None,
            Self::PriceFloor(_) => Some(Field::Price),
            Self::MarketCapFloor(_) => Some(Field::MarketCap),
            Self::PositiveEarnings => Some(Field::EarningsMultiple),
            Self::TradedValueFloor(_) => Some(Field::TradedValue),
        }
    }

    /// Test one snapshot.
    pub fn check(&self, snapshot: &MarketSnapshot) -> Result<(), ExclusionReason> {
        if let Self::NotSpecialTreatment = self {
            return if snapshot.instrument.is_special_treatment() {
                Err(ExclusionReason::SpecialTreatment)
            } else {
                Ok(())
            };
        }

        let Some(field) = self.required_field() else {
            return Ok(());
        };
        let value = snapshot.get(field).ok_or_else(|| ExclusionReason::MissingField {
            field,
            detail: snapshot
                .unavailable
                .iter()
                .find(|u| u.field == field)
                .map(|u| u.reason.clone())
                .unwrap_or_else(|| "not reported".to_string()),
        })?;

        match *self {
            Self::PositiveEarnings if value <= 0.0 => {
                Err(ExclusionReason::NonPositiveEarnings { value })
            }
            Self::PriceFloor(floor) | Self::MarketCapFloor(floor) | Self::TradedValueFloor(floor)
                if value < floor =>
            {
                Err(ExclusionReason::BelowFloor { field, value, floor })
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for HardFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSpecialTreatment => write!(f, "not ST"),
            Self::PriceFloor(v) => write!(f, "price >= {}", v),
            Self::MarketCapFloor(v) => write!(f, "market cap >= {}", v),
            Self::PositiveEarnings => write!(f, "PE > 0"),
            Self::TradedValueFloor(v) => write!(f, "traded value >= {}", v),
        }
    }
}

// ============================================================================
// Filter Result
// ============================================================================

/// Survivor counts of one predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterResult {
    /// Predicate name
    pub stage: String,
    /// Instruments entering the predicate
    pub input: usize,
    /// Instruments that passed
    pub passed: usize,
    /// Instruments eliminated (including `missing`)
    pub eliminated: usize,
    /// Eliminated because the required field was unavailable
    pub missing: usize,
    /// Elimination rate (%)
    pub elimination_rate: f64,
}

impl FilterResult {
    pub fn new(stage: impl Into<String>, input_count: usize, passed_count: usize) -> Self {
        let eliminated = input_count.saturating_sub(passed_count);
        let elimination_rate = if input_count > 0 {
            (eliminated as f64 / input_count as f64) * 100.0
        } else {
            0.0
        };

        Self {
            stage: stage.into(),
            input: input_count,
            passed: passed_count,
            eliminated,
            missing: 0,
            elimination_rate,
        }
    }

    pub fn with_missing(mut self, missing: usize) -> Self {
        self.missing = missing;
        self
    }
}

/// Survivors plus diagnostics.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Survivors in input order
    pub survivors: Vec<MarketSnapshot>,
    /// One entry per predicate, in application order
    pub stages: Vec<FilterResult>,
    pub exclusions: Vec<Exclusion>,
}

// ============================================================================
// Hard Filter Stage
// ============================================================================

/// Applies every enabled predicate in sequence.
pub struct HardFilterStage {
    filters: Vec<HardFilter>,
}

impl HardFilterStage {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            filters: HardFilter::from_config(config),
        }
    }

    /// Run the funnel over the snapshots.
    pub fn apply(&self, snapshots: Vec<MarketSnapshot>) -> FilterOutcome {
        let mut survivors = snapshots;
        let mut stages = Vec::with_capacity(self.filters.len());
        let mut exclusions = Vec::new();

        for filter in &self.filters {
            let input = survivors.len();
            let mut missing = 0;
            let mut passed = Vec::with_capacity(input);

            for snapshot in survivors {
                match filter.check(&snapshot) {
                    Ok(()) => passed.push(snapshot),
                    Err(reason) => {
                        if matches!(reason, ExclusionReason::MissingField { .. }) {
                            missing += 1;
                        }
                        debug!(
                            symbol = snapshot.symbol(),
                            filter = filter.name(),
                            reason = %reason,
                            "Excluded by hard filter"
                        );
                        exclusions.push(Exclusion::new(snapshot.symbol(), filter.name(), reason));
                    }
                }
            }

            let result = FilterResult::new(filter.name(), input, passed.len()).with_missing(missing);
            info!(
                filter = filter.name(),
                rule = %filter,
                input = result.input,
                passed = result.passed,
                eliminated = result.eliminated,
                missing = result.missing,
                "Hard filter applied"
            );
            stages.push(result);
            survivors = passed;
        }

        FilterOutcome {
            survivors,
            stages,
            exclusions,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
