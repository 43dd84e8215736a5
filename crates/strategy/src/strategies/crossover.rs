use common::{Bar, Direction, Result};

use super::{cross, ensure, param_str, param_usize, relative_gap, Params, Vote};
use crate::indicators::{ema, macd, sma, IndicatorSeries};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaType {
    Sma,
    Ema,
}

/// Fast/slow moving-average crossover.
#[derive(Debug, Clone, PartialEq)]
pub struct MaCrossover {
    pub fast_period: usize,
    pub slow_period: usize,
    pub ma_type: MaType,
}

impl MaCrossover {
    pub fn new(fast_period: usize, slow_period: usize, ma_type: MaType) -> Result<Self> {
        ensure(fast_period > 0, "fast_period must be positive")?;
        ensure(
            fast_period < slow_period,
            "fast_period must be less than slow_period",
        )?;
        Ok(Self {
            fast_period,
            slow_period,
            ma_type,
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        let ma_type = match param_str(params, "ma_type", "ema")? {
            "ema" => MaType::Ema,
            "sma" => MaType::Sma,
            other => {
                return Err(common::Error::Config(format!(
                    "ma_type must be 'ema' or 'sma', got '{other}'"
                )))
            }
        };
        Self::new(
            param_usize(params, "fast_period", 10)?,
            param_usize(params, "slow_period", 20)?,
            ma_type,
        )
    }

    /// Two consecutive slow values are needed to see a cross.
    pub fn min_bars(&self) -> usize {
        self.slow_period + 1
    }

    fn average(&self, bars: &[Bar], period: usize) -> IndicatorSeries {
        match self.ma_type {
            MaType::Sma => sma(bars, period),
            MaType::Ema => ema(bars, period),
        }
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let (prev_fast, curr_fast) = self.average(bars, self.fast_period).last_two()?;
        let (prev_slow, curr_slow) = self.average(bars, self.slow_period).last_two()?;

        let strength = relative_gap(curr_fast, curr_slow)
            .map(|gap| (gap * 100.0).min(1.0))
            .unwrap_or(0.0);
        Ok(match cross(prev_fast, prev_slow, curr_fast, curr_slow) {
            Direction::Long => Vote::long(strength),
            Direction::Short => Vote::short(strength),
            Direction::Flat => Vote::flat(),
        })
    }
}

/// MACD line crossing its signal line.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdCross {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

impl MacdCross {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self> {
        ensure(fast > 0 && signal > 0, "MACD periods must be positive")?;
        ensure(fast < slow, "MACD fast period must be less than slow period")?;
        Ok(Self { fast, slow, signal })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(
            param_usize(params, "fast", 12)?,
            param_usize(params, "slow", 26)?,
            param_usize(params, "signal", 9)?,
        )
    }

    pub fn min_bars(&self) -> usize {
        self.slow + self.signal
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let m = macd(bars, self.fast, self.slow, self.signal);
        let (prev_macd, curr_macd) = m.macd.last_two()?;
        let (prev_sig, curr_sig) = m.signal.last_two()?;

        let strength = relative_gap(curr_macd, curr_sig)
            .map(|gap| gap.min(1.0))
            .unwrap_or(0.5);
        Ok(match cross(prev_macd, prev_sig, curr_macd, curr_sig) {
            Direction::Long => Vote::long(strength),
            Direction::Short => Vote::short(strength),
            Direction::Flat => Vote::flat(),
        })
    }
}

/// MACD histogram crossing zero.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdHistogram {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

impl MacdHistogram {
    pub fn from_params(params: &Params) -> Result<Self> {
        let MacdCross { fast, slow, signal } = MacdCross::from_params(params)?;
        Ok(Self { fast, slow, signal })
    }

    pub fn min_bars(&self) -> usize {
        self.slow + self.signal
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let m = macd(bars, self.fast, self.slow, self.signal);
        let (prev, curr) = m.histogram.last_two()?;
        let line = m.macd.last()?;

        let strength = if line == 0.0 {
            0.5
        } else {
            (curr.abs() / line.abs()).min(1.0)
        };
        Ok(match cross(prev, 0.0, curr, 0.0) {
            Direction::Long => Vote::long(strength),
            Direction::Short => Vote::short(strength),
            Direction::Flat => Vote::flat(),
        })
    }
}
