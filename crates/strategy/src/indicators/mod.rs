//! Pure indicator functions.
//!
//! Every function maps a bar window to series aligned 1:1 with the input.
//! Points before an indicator's lookback are `None`, and so is every point of
//! a window shorter than the lookback. Nothing is carried between calls, so
//! recomputing over the same window always yields the same bits.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use adx::{adx, AdxSeries};
pub use atr::atr;
pub use bollinger::{bollinger, BollingerSeries};
pub use ema::ema;
pub use macd::{macd, MacdSeries};
pub use rsi::rsi;
pub use sma::sma;

use chrono::{DateTime, Utc};

use common::{Bar, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// Output of one indicator over one bar window.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSeries {
    name: &'static str,
    lookback: usize,
    points: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    pub(crate) fn new(
        name: &'static str,
        lookback: usize,
        bars: &[Bar],
        values: Vec<Option<f64>>,
    ) -> Self {
        debug_assert_eq!(bars.len(), values.len());
        let points = bars
            .iter()
            .zip(values)
            .map(|(bar, value)| IndicatorPoint {
                timestamp: bar.timestamp,
                value: value.filter(|v| v.is_finite()),
            })
            .collect();
        Self {
            name,
            lookback,
            points,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bars needed before the first defined point.
    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[IndicatorPoint] {
        &self.points
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.points.get(index).and_then(|p| p.value)
    }

    /// Value at the newest bar.
    pub fn last(&self) -> Result<f64> {
        self.points
            .last()
            .and_then(|p| p.value)
            .ok_or_else(|| self.insufficient(self.lookback))
    }

    /// The newest `n` values, oldest first. All of them must be defined.
    pub fn tail(&self, n: usize) -> Result<Vec<f64>> {
        let required = self.lookback + n.saturating_sub(1);
        if n == 0 || self.points.len() < n {
            return Err(self.insufficient(required));
        }
        self.points[self.points.len() - n..]
            .iter()
            .map(|p| p.value.ok_or_else(|| self.insufficient(required)))
            .collect()
    }

    /// `(previous, current)` values at the two newest bars.
    pub fn last_two(&self) -> Result<(f64, f64)> {
        let n = self.points.len();
        if n < 2 {
            return Err(self.insufficient(self.lookback + 1));
        }
        match (self.points[n - 2].value, self.points[n - 1].value) {
            (Some(prev), Some(curr)) => Ok((prev, curr)),
            _ => Err(self.insufficient(self.lookback + 1)),
        }
    }

    fn insufficient(&self, required: usize) -> Error {
        Error::InsufficientData {
            indicator: self.name,
            required,
            available: self.points.len(),
        }
    }
}

pub(crate) fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Wilder smoothing seeded with the mean of the first `period` values.
/// The first defined output is at index `period - 1`.
pub(crate) fn wilder_values(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let p = period as f64;
    let mut avg = values[..period].iter().sum::<f64>() / p;
    out[period - 1] = Some(avg);
    for (i, &v) in values.iter().enumerate().skip(period) {
        avg = (avg * (p - 1.0) + v) / p;
        out[i] = Some(avg);
    }
    out
}

/// Shifts `values` right by `offset`, padding the front with `None`.
pub(crate) fn pad_front(values: Vec<Option<f64>>, offset: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; offset];
    out.extend(values);
    out
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{Duration, TimeZone, Utc};

    use common::Bar;

    /// Bars with the given closes; high/low sit one unit around the close.
    pub fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                symbol: "BTCUSDT".into(),
                timestamp: start + Duration::hours(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1_000.0,
            })
            .collect()
    }

    pub fn ohlc(rows: &[(f64, f64, f64)]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        rows.iter()
            .enumerate()
            .map(|(i, &(high, low, close))| Bar {
                symbol: "BTCUSDT".into(),
                timestamp: start + Duration::hours(i as i64),
                open: close,
                high,
                low,
                close,
                volume: 1_000.0,
            })
            .collect()
    }
}
