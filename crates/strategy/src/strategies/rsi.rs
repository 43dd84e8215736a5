use common::{Bar, Result};

use super::{ensure, param_f64, param_usize, Params, Vote};
use crate::indicators::rsi;

/// Buy oversold, sell overbought.
#[derive(Debug, Clone, PartialEq)]
pub struct RsiReversal {
    pub period: usize,
    pub overbought: f64,
    pub oversold: f64,
}

impl RsiReversal {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Result<Self> {
        ensure(period >= 2, "RSI period must be >= 2")?;
        ensure(
            0.0 < oversold && oversold < overbought && overbought < 100.0,
            "RSI thresholds must satisfy 0 < oversold < overbought < 100",
        )?;
        Ok(Self {
            period,
            overbought,
            oversold,
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(
            param_usize(params, "period", 14)?,
            param_f64(params, "overbought", 70.0)?,
            param_f64(params, "oversold", 30.0)?,
        )
    }

    pub fn min_bars(&self) -> usize {
        self.period + 1
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let value = rsi(bars, self.period).last()?;
        Ok(self.vote(value))
    }

    /// Strength grows with the distance past a threshold; a reading exactly
    /// on a threshold carries no strength and votes flat.
    pub(crate) fn vote(&self, value: f64) -> Vote {
        if value < self.oversold {
            Vote::long((self.oversold - value) / self.oversold)
        } else if value > self.overbought {
            Vote::short((value - self.overbought) / (100.0 - self.overbought))
        } else {
            Vote::flat()
        }
    }
}

/// Closes within this fraction of the window extreme count as a new extreme.
const PRICE_BAND: f64 = 0.02;
/// RSI must sit at least this fraction away from its own window extreme.
const RSI_MARGIN: f64 = 0.05;

/// Price pressing the edge of its recent range while RSI is not.
///
/// Bullish when the close is at the window low but RSI is clearly above its
/// window low, bearish on the mirror. Votes carry a fixed strength.
#[derive(Debug, Clone, PartialEq)]
pub struct RsiDivergence {
    pub period: usize,
    pub lookback: usize,
    pub strength: f64,
}

impl RsiDivergence {
    pub fn new(period: usize, lookback: usize, strength: f64) -> Result<Self> {
        ensure(period >= 2, "RSI period must be >= 2")?;
        ensure(lookback >= 2, "lookback must be >= 2")?;
        ensure(
            strength > 0.0 && strength <= 1.0,
            "strength must be in (0, 1]",
        )?;
        Ok(Self {
            period,
            lookback,
            strength,
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(
            param_usize(params, "period", 14)?,
            param_usize(params, "lookback", 10)?,
            param_f64(params, "strength", 0.7)?,
        )
    }

    pub fn min_bars(&self) -> usize {
        self.period + self.lookback
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let values = rsi(bars, self.period).tail(self.lookback)?;
        let closes: Vec<f64> = bars[bars.len() - self.lookback..]
            .iter()
            .map(|b| b.close)
            .collect();
        let (Some(&close), Some(&value)) = (closes.last(), values.last()) else {
            return Ok(Vote::flat());
        };

        let (price_low, price_high) = extremes(&closes);
        let (rsi_low, rsi_high) = extremes(&values);
        Ok(
            if close <= price_low * (1.0 + PRICE_BAND) && value > rsi_low * (1.0 + RSI_MARGIN) {
                Vote::long(self.strength)
            } else if close >= price_high * (1.0 - PRICE_BAND)
                && value < rsi_high * (1.0 - RSI_MARGIN)
            {
                Vote::short(self.strength)
            } else {
                Vote::flat()
            },
        )
    }
}

fn extremes(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}
