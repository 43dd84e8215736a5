use common::{Bar, Direction, Result};

use super::{ensure, param_f64, param_usize, MacdCross, Params, RsiReversal, Vote};
use crate::indicators::ema;

/// Votes from price-vs-EMA, RSI and a MACD cross; acts when enough agree.
#[derive(Debug, Clone, PartialEq)]
pub struct Combined {
    pub ema_period: usize,
    pub rsi: RsiReversal,
    pub macd: MacdCross,
    pub min_confirmations: usize,
}

const VOTERS: f64 = 3.0;

impl Combined {
    pub fn from_params(params: &Params) -> Result<Self> {
        let s = Self {
            ema_period: param_usize(params, "ema_period", 20)?,
            rsi: RsiReversal::new(
                param_usize(params, "rsi_period", 14)?,
                param_f64(params, "rsi_overbought", 70.0)?,
                param_f64(params, "rsi_oversold", 30.0)?,
            )?,
            macd: MacdCross::new(
                param_usize(params, "macd_fast", 12)?,
                param_usize(params, "macd_slow", 26)?,
                param_usize(params, "macd_signal", 9)?,
            )?,
            min_confirmations: param_usize(params, "min_confirmations", 2)?,
        };
        ensure(
            s.min_confirmations <= 3,
            "min_confirmations cannot exceed the three voters",
        )?;
        Ok(s)
    }

    pub fn min_bars(&self) -> usize {
        self.ema_period
            .max(self.rsi.min_bars())
            .max(self.macd.min_bars())
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let trend = ema(bars, self.ema_period).last()?;
        let price = bars.last().map(|b| b.close).unwrap_or(trend);
        let ema_vote = if price > trend {
            Direction::Long
        } else if price < trend {
            Direction::Short
        } else {
            Direction::Flat
        };
        let votes = [ema_vote, self.rsi.decide(bars)?.direction, self.macd.decide(bars)?.direction];

        let longs = votes.iter().filter(|d| **d == Direction::Long).count();
        let shorts = votes.iter().filter(|d| **d == Direction::Short).count();
        let long_ok = longs >= self.min_confirmations;
        let short_ok = shorts >= self.min_confirmations;

        Ok(match (long_ok, short_ok) {
            (true, false) => Vote::long(longs as f64 / VOTERS),
            (false, true) => Vote::short(shorts as f64 / VOTERS),
            (true, true) if longs > shorts => Vote::long(longs as f64 / VOTERS),
            (true, true) if shorts > longs => Vote::short(shorts as f64 / VOTERS),
            _ => Vote::flat(),
        })
    }
}
