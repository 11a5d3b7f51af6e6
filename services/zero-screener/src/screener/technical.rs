//! Technical indicators for enrichment.
//!
//! Computed from daily closes, oldest first. Moving averages and the
//! trend distances feed the enriched momentum factor; the rest is carried
//! into the output for readers.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::data::Candle;

/// Fewest closes for which indicators are computed at all.
pub const MIN_CLOSES: usize = 20;

const RSI_PERIOD: usize = 14;

/// Weight of the MA20 distance in the enriched momentum metric.
const MOMENTUM_MA20_WEIGHT: f64 = 0.6;
const MOMENTUM_MA60_WEIGHT: f64 = 0.4;

/// Indicators for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    /// Closes used
    pub closes: usize,
    pub last_close: f64,
    pub ma5: f64,
    pub ma20: f64,
    /// Needs at least 60 closes
    pub ma60: Option<f64>,
    /// Simple-average RSI over 14 days
    pub rsi14: Option<f64>,
    /// Last close vs MA20 (%)
    pub vs_ma20_pct: f64,
    /// Last close vs MA60 (%)
    pub vs_ma60_pct: Option<f64>,
    pub period_high: f64,
    pub period_low: f64,
    /// Last close vs period high (%), zero or negative
    pub off_high_pct: f64,
}

impl TechnicalIndicators {
    /// Compute from candles sorted oldest first.
    ///
    /// Returns `None` with fewer than [`MIN_CLOSES`] usable closes.
    pub fn compute(candles: &[Candle]) -> Option<Self> {
        let closes: Vec<f64> = candles
            .iter()
            .map(|c| c.close)
            .filter(|c| c.is_finite() && *c > 0.0)
            .collect();
        if closes.len() < MIN_CLOSES {
            return None;
        }

        let last_close = *closes.last()?;
        let ma5 = moving_average(&closes, 5)?;
        let ma20 = moving_average(&closes, 20)?;
        let ma60 = moving_average(&closes, 60);

        let period_high = closes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let period_low = closes.iter().copied().fold(f64::INFINITY, f64::min);

        Some(Self {
            closes: closes.len(),
            last_close,
            ma5,
            ma20,
            ma60,
            rsi14: rsi(&closes, RSI_PERIOD),
            vs_ma20_pct: pct_distance(last_close, ma20),
            vs_ma60_pct: ma60.map(|ma| pct_distance(last_close, ma)),
            period_high,
            period_low,
            off_high_pct: pct_distance(last_close, period_high),
        })
    }

    /// Enriched momentum: `0.6 * vs_ma20 + 0.4 * vs_ma60`.
    ///
    /// `None` without the 60-day average.
    pub fn momentum_metric(&self) -> Option<f64> {
        let vs_ma60 = self.vs_ma60_pct?;
        Some(MOMENTUM_MA20_WEIGHT * self.vs_ma20_pct + MOMENTUM_MA60_WEIGHT * vs_ma60)
    }
}

/// Mean of the last `period` values.
fn moving_average(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().mean())
}

/// RSI from simple averages of the last `period` changes.
fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }

    let window = &closes[closes.len() - period - 1..];
    let (gains, losses) = window
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold((0.0, 0.0), |(g, l), diff| {
            if diff > 0.0 {
                (g + diff, l)
            } else {
                (g, l - diff)
            }
        });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn pct_distance(value: f64, reference: f64) -> f64 {
    (value - reference) / reference * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle {
                date: start + chrono::Days::new(i as u64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_too_few_closes() {
        assert!(TechnicalIndicators::compute(&candles(&[10.0; 19])).is_none());
        assert!(TechnicalIndicators::compute(&candles(&[10.0; 20])).is_some());
    }

    #[test]
    fn test_rising_series() {
        let closes: Vec<f64> = (1..=80).map(|i| i as f64).collect();
        let t = TechnicalIndicators::compute(&candles(&closes)).unwrap();

        assert_eq!(t.closes, 80);
        assert_eq!(t.last_close, 80.0);
        assert!((t.ma5 - 78.0).abs() < 1e-9);
        assert!((t.ma20 - 70.5).abs() < 1e-9);
        assert!((t.ma60.unwrap() - 50.5).abs() < 1e-9);
        assert_eq!(t.rsi14, Some(100.0));
        assert_eq!(t.period_high, 80.0);
        assert_eq!(t.period_low, 1.0);
        assert_eq!(t.off_high_pct, 0.0);

        let expected = 0.6 * (80.0 - 70.5) / 70.5 * 100.0 + 0.4 * (80.0 - 50.5) / 50.5 * 100.0;
        assert!((t.momentum_metric().unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_no_ma60_no_momentum() {
        let closes: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let t = TechnicalIndicators::compute(&candles(&closes)).unwrap();
        assert_eq!(t.ma60, None);
        assert_eq!(t.vs_ma60_pct, None);
        assert_eq!(t.momentum_metric(), None);
    }

    #[test]
    fn test_rsi_mixed_moves() {
        // alternating +1 / -1 over 14 changes: equal gains and losses
        let mut closes = vec![10.0];
        for i in 0..14 {
            let last = *closes.last().unwrap();
            closes.push(if i % 2 == 0 { last + 1.0 } else { last - 1.0 });
        }
        assert!((rsi(&closes, 14).unwrap() - 50.0).abs() < 1e-9);
        assert_eq!(rsi(&closes[..10], 14), None);
    }

    #[test]
    fn test_off_high() {
        let mut closes = vec![10.0; 30];
        closes[10] = 20.0;
        let t = TechnicalIndicators::compute(&candles(&closes)).unwrap();
        assert_eq!(t.period_high, 20.0);
        assert!((t.off_high_pct + 50.0).abs() < 1e-9);
    }
}
