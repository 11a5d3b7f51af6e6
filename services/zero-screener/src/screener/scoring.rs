//! Factor scoring module for the screener.
//!
//! Turns filter survivors into one composite ranking over five factor
//! dimensions:
//!
//! | Dimension | Raw metric | Direction |
//! |-----------|------------|-----------|
//! | growth    | change % + turnover rate | higher |
//! | valuation | earnings multiple × book multiple | lower |
//! | quality   | book multiple / earnings multiple × 100 (implied ROE) | higher |
//! | safety    | ln(market cap) + 0.5 × ln(traded value) | higher |
//! | momentum  | change % (pass 1), trend vs MA20/MA60 (enriched) | higher |
//!
//! Raw values become positional percentiles within the population that has
//! a value for the dimension; the composite is the weighted sum of
//! percentiles, so it always lies in `[0, 100]`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use crate::data::{Board, MarketSnapshot, SourceDiscrepancy};

use super::config::{FactorWeights, MissingDataPolicy};
use super::filter::{Exclusion, ExclusionReason};
use super::technical::TechnicalIndicators;

// ============================================================================
// Factor Dimension
// ============================================================================

/// One of the five scoring dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorDimension {
    Growth,
    Valuation,
    Quality,
    Safety,
    Momentum,
}

impl FactorDimension {
    /// All dimensions in output order.
    pub const ALL: [FactorDimension; 5] = [
        FactorDimension::Growth,
        FactorDimension::Valuation,
        FactorDimension::Quality,
        FactorDimension::Safety,
        FactorDimension::Momentum,
    ];

    /// Whether a larger raw value is more favorable.
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Self::Valuation)
    }

    /// Pass-1 raw metric from a market snapshot.
    pub fn raw_value(&self, snapshot: &MarketSnapshot) -> Option<f64> {
        let q = &snapshot.quote;
        let f = &snapshot.fundamental;
        let positive = |v: Option<f64>| v.filter(|x| *x > 0.0);

        let raw = match self {
            Self::Growth => Some(q.change_pct? + q.turnover_rate?),
            Self::Valuation => Some(positive(f.earnings_multiple)? * positive(f.book_multiple)?),
            Self::Quality => {
                Some(positive(f.book_multiple)? / positive(f.earnings_multiple)? * 100.0)
            }
            Self::Safety => {
                Some(positive(f.market_cap)?.ln() + 0.5 * positive(q.traded_value)?.ln())
            }
            Self::Momentum => q.change_pct,
        };
        raw.filter(|v| v.is_finite())
    }

    fn index(&self) -> usize {
        match self {
            Self::Growth => 0,
            Self::Valuation => 1,
            Self::Quality => 2,
            Self::Safety => 3,
            Self::Momentum => 4,
        }
    }
}

impl std::fmt::Display for FactorDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Growth => write!(f, "growth"),
            Self::Valuation => write!(f, "valuation"),
            Self::Quality => write!(f, "quality"),
            Self::Safety => write!(f, "safety"),
            Self::Momentum => write!(f, "momentum"),
        }
    }
}

// ============================================================================
// Percentile Ranks
// ============================================================================

/// Positional percentile of each present value within its population.
///
/// Entries are `(symbol, raw)`. Present values are sorted ascending with
/// ties broken by ascending symbol; the value at position `i` gets
/// `i / (n - 1) * 100`, and a lone value gets 50. When lower is better the
/// result is inverted. Absent values stay `None` and do not count toward `n`.
pub fn percentile_ranks(entries: &[(&str, Option<f64>)], higher_is_better: bool) -> Vec<Option<f64>> {
    let mut present: Vec<(usize, &str, f64)> = entries
        .iter()
        .enumerate()
        .filter_map(|(i, (symbol, raw))| raw.filter(|v| v.is_finite()).map(|v| (i, *symbol, v)))
        .collect();

    present.sort_by(|a, b| a.2.total_cmp(&b.2).then_with(|| a.1.cmp(b.1)));

    let mut ranks = vec![None; entries.len()];
    let n = present.len();
    for (position, (index, _, _)) in present.into_iter().enumerate() {
        let pct = if n == 1 {
            50.0
        } else {
            position as f64 / (n - 1) as f64 * 100.0
        };
        ranks[index] = Some(if higher_is_better { pct } else { 100.0 - pct });
    }
    ranks
}

// ============================================================================
// Scores
// ============================================================================

/// Score of one instrument on one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub dimension: FactorDimension,
    /// Raw metric; `None` when an input was unavailable
    pub raw: Option<f64>,
    /// Percentile in [0, 100] over instruments with a raw value
    pub percentile: Option<f64>,
    /// Configured weight
    pub weight: f64,
    /// Weight after redistribution over available dimensions
    pub effective_weight: f64,
    /// `effective_weight * percentile`
    pub contribution: f64,
}

impl FactorScore {
    fn new(dimension: FactorDimension, raw: Option<f64>, weight: f64) -> Self {
        Self {
            dimension,
            raw,
            percentile: None,
            weight,
            effective_weight: 0.0,
            contribution: 0.0,
        }
    }
}

/// Data-quality marker carried into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Sources disagreed on a critical field beyond the threshold
    Discrepancy,
    /// At least one dimension was dropped and its weight redistributed
    PartialFactor,
    /// Historical candles could not be fetched for enrichment
    EnrichmentUnavailable,
}

impl std::fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discrepancy => write!(f, "discrepancy"),
            Self::PartialFactor => write!(f, "partial_factor"),
            Self::EnrichmentUnavailable => write!(f, "enrichment_unavailable"),
        }
    }
}

/// An instrument with its factor breakdown and composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredInstrument {
    pub snapshot: MarketSnapshot,
    /// One score per dimension, in [`FactorDimension::ALL`] order
    pub factors: Vec<FactorScore>,
    /// Composite score in [0, 100]
    pub composite: f64,
    pub flags: Vec<QualityFlag>,
    /// Present after enrichment
    pub technicals: Option<TechnicalIndicators>,
}

impl ScoredInstrument {
    pub fn symbol(&self) -> &str {
        self.snapshot.symbol()
    }

    pub fn name(&self) -> &str {
        &self.snapshot.instrument.name
    }

    pub fn board(&self) -> Board {
        self.snapshot.instrument.board
    }

    pub fn factor(&self, dimension: FactorDimension) -> &FactorScore {
        &self.factors[dimension.index()]
    }

    pub fn discrepancies(&self) -> &[SourceDiscrepancy] {
        &self.snapshot.discrepancies
    }

    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.flags.contains(&flag)
    }

    fn set_flag(&mut self, flag: QualityFlag, on: bool) {
        self.flags.retain(|f| *f != flag);
        if on {
            self.flags.push(flag);
            self.flags.sort();
        }
    }
}

/// Ranked instruments plus those the scoring dropped.
#[derive(Debug, Clone, Default)]
pub struct ScoringOutcome {
    /// Composite descending, ties by ascending symbol
    pub ranked: Vec<ScoredInstrument>,
    pub excluded: Vec<Exclusion>,
}

// ============================================================================
// Scoring Engine
// ============================================================================

/// Stage name recorded on scoring exclusions.
const STAGE: &str = "scoring";

/// Percentile-weighted composite scoring.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    weights: FactorWeights,
    policy: MissingDataPolicy,
}

impl ScoringEngine {
    pub fn new(weights: FactorWeights, policy: MissingDataPolicy) -> Self {
        Self { weights, policy }
    }

    pub fn weights(&self) -> &FactorWeights {
        &self.weights
    }

    pub fn policy(&self) -> MissingDataPolicy {
        self.policy
    }

    /// Pass 1: score every survivor on snapshot data and rank.
    pub fn score(&self, snapshots: Vec<MarketSnapshot>) -> ScoringOutcome {
        let mut scored: Vec<ScoredInstrument> = snapshots
            .into_iter()
            .map(|snapshot| {
                let factors = FactorDimension::ALL
                    .iter()
                    .map(|d| FactorScore::new(*d, d.raw_value(&snapshot), self.weights.get(*d)))
                    .collect();
                let flags = if snapshot.has_discrepancy() {
                    vec![QualityFlag::Discrepancy]
                } else {
                    Vec::new()
                };
                ScoredInstrument {
                    snapshot,
                    factors,
                    composite: 0.0,
                    flags,
                    technicals: None,
                }
            })
            .collect();

        let dropped = self.drop_incomplete(&mut scored);
        for dimension in FactorDimension::ALL {
            assign_percentiles(&mut scored, dimension);
        }

        self.compose_all(scored, dropped)
    }

    /// Replace the momentum raw values of `finalists` and re-rank them.
    ///
    /// Momentum percentiles are recomputed over the finalists; the other
    /// dimensions keep their pass-1 percentiles. `momentum` is aligned with
    /// `finalists`.
    pub fn rescore_momentum(
        &self,
        finalists: Vec<ScoredInstrument>,
        momentum: &[Option<f64>],
    ) -> ScoringOutcome {
        let mut finalists = finalists;
        for (instrument, raw) in finalists.iter_mut().zip(momentum) {
            let score = &mut instrument.factors[FactorDimension::Momentum.index()];
            score.raw = raw.filter(|v| v.is_finite());
        }
        let dropped = self.drop_incomplete(&mut finalists);
        assign_percentiles(&mut finalists, FactorDimension::Momentum);

        self.compose_all(finalists, dropped)
    }

    /// Under [`MissingDataPolicy::Exclude`], remove instruments lacking any
    /// raw metric so they take no part in the percentile population.
    fn drop_incomplete(&self, scored: &mut Vec<ScoredInstrument>) -> Vec<Exclusion> {
        if self.policy != MissingDataPolicy::Exclude {
            return Vec::new();
        }
        let mut excluded = Vec::new();
        scored.retain(|instrument| {
            match instrument.factors.iter().find(|f| f.raw.is_none()) {
                Some(missing) => {
                    let reason = ExclusionReason::MissingFactor {
                        dimension: missing.dimension,
                    };
                    debug!(symbol = instrument.symbol(), reason = %reason, "Excluded from ranking");
                    excluded.push(Exclusion::new(instrument.symbol(), STAGE, reason));
                    false
                }
                None => true,
            }
        });
        excluded
    }

    /// Composite score of one instrument from its percentiles.
    ///
    /// Fills effective weights and contributions. Returns the reason the
    /// instrument cannot be ranked, if any.
    pub fn compose(&self, factors: &mut [FactorScore]) -> Result<f64, ExclusionReason> {
        let missing: Vec<FactorDimension> = factors
            .iter()
            .filter(|f| f.percentile.is_none())
            .map(|f| f.dimension)
            .collect();

        if self.policy == MissingDataPolicy::Exclude {
            if let Some(dimension) = missing.first() {
                return Err(ExclusionReason::MissingFactor {
                    dimension: *dimension,
                });
            }
        }

        let available_weight: f64 = factors
            .iter()
            .filter(|f| f.percentile.is_some())
            .map(|f| f.weight)
            .sum();
        if available_weight <= 0.0 {
            return Err(ExclusionReason::NoFactorAvailable);
        }

        let mut composite = 0.0;
        for factor in factors.iter_mut() {
            match factor.percentile {
                Some(pct) => {
                    factor.effective_weight = factor.weight / available_weight;
                    factor.contribution = factor.effective_weight * pct;
                    composite += factor.contribution;
                }
                None => {
                    factor.effective_weight = 0.0;
                    factor.contribution = 0.0;
                }
            }
        }

        Ok(composite.clamp(0.0, 100.0))
    }

    fn compose_all(
        &self,
        scored: Vec<ScoredInstrument>,
        mut excluded: Vec<Exclusion>,
    ) -> ScoringOutcome {
        let mut ranked = Vec::with_capacity(scored.len());

        for mut instrument in scored {
            match self.compose(&mut instrument.factors) {
                Ok(composite) => {
                    instrument.composite = composite;
                    let partial = instrument.factors.iter().any(|f| f.percentile.is_none());
                    instrument.set_flag(QualityFlag::PartialFactor, partial);
                    ranked.push(instrument);
                }
                Err(reason) => {
                    debug!(symbol = instrument.symbol(), reason = %reason, "Excluded from ranking");
                    excluded.push(Exclusion::new(instrument.symbol(), STAGE, reason));
                }
            }
        }

        ScoringOutcome {
            ranked: rank(ranked),
            excluded,
        }
    }
}

/// Order by composite descending, then symbol ascending.
pub fn rank(mut scored: Vec<ScoredInstrument>) -> Vec<ScoredInstrument> {
    scored.sort_by(compare_ranked);
    scored
}

fn compare_ranked(a: &ScoredInstrument, b: &ScoredInstrument) -> Ordering {
    b.composite
        .total_cmp(&a.composite)
        .then_with(|| a.symbol().cmp(b.symbol()))
}

fn assign_percentiles(scored: &mut [ScoredInstrument], dimension: FactorDimension) {
    let index = dimension.index();
    let ranks = {
        let entries: Vec<(&str, Option<f64>)> = scored
            .iter()
            .map(|s| (s.symbol(), s.factors[index].raw))
            .collect();
        percentile_ranks(&entries, dimension.higher_is_better())
    };
    for (instrument, pct) in scored.iter_mut().zip(ranks) {
        instrument.factors[index].percentile = pct;
    }
}

// ============================================================================
// Tests
// ============================================================================
