use common::{Bar, Result};

use super::{ensure, param_f64, param_usize, Params, Vote};
use crate::indicators::{bollinger, rsi};

/// Fade closes outside the Bollinger Bands when RSI agrees the move is extreme.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanReversion {
    pub bb_period: usize,
    pub bb_std: f64,
    pub rsi_period: usize,
    /// Distance from 50 that counts as an extreme RSI reading.
    pub rsi_extreme: f64,
}

impl MeanReversion {
    pub fn from_params(params: &Params) -> Result<Self> {
        let s = Self {
            bb_period: param_usize(params, "bb_period", 20)?,
            bb_std: param_f64(params, "bb_std", 2.0)?,
            rsi_period: param_usize(params, "rsi_period", 14)?,
            rsi_extreme: param_f64(params, "rsi_extreme", 20.0)?,
        };
        ensure(s.bb_period >= 2, "bb_period must be >= 2")?;
        ensure(s.bb_std > 0.0, "bb_std must be positive")?;
        ensure(
            (0.0..50.0).contains(&s.rsi_extreme),
            "rsi_extreme must be within 0..50",
        )?;
        Ok(s)
    }

    pub fn min_bars(&self) -> usize {
        self.bb_period.max(self.rsi_period + 1)
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let bands = bollinger(bars, self.bb_period, self.bb_std);
        let upper = bands.upper.last()?;
        let lower = bands.lower.last()?;
        let rsi_value = rsi(bars, self.rsi_period).last()?;
        let price = bars.last().map(|b| b.close).unwrap_or(lower);

        if price <= lower && rsi_value < 50.0 - self.rsi_extreme && lower > 0.0 {
            Ok(Vote::long(((lower - price) / lower * 10.0 + 0.3).min(1.0)))
        } else if price >= upper && rsi_value > 50.0 + self.rsi_extreme && upper > 0.0 {
            Ok(Vote::short(((price - upper) / upper * 10.0 + 0.3).min(1.0)))
        } else {
            Ok(Vote::flat())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::testutil::bars_from_closes;
    use common::Direction;

    fn strategy() -> MeanReversion {
        MeanReversion::from_params(&Params::new()).unwrap()
    }

    #[test]
    fn capitulation_below_lower_band_is_long() {
        let mut closes = vec![100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 101.0];
        closes.extend([100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0]);
        closes.extend([98.0, 96.0, 94.0, 92.0, 88.0]);
        let vote = strategy().decide(&bars_from_closes(&closes)).unwrap();
        assert_eq!(vote.direction, Direction::Long);
        assert!(vote.strength >= 0.3);
    }

    #[test]
    fn blow_off_above_upper_band_is_short() {
        let mut closes = vec![100.0, 99.0, 100.0, 99.0, 100.0, 99.0, 100.0, 99.0];
        closes.extend([100.0, 99.0, 100.0, 99.0, 100.0, 99.0, 100.0]);
        closes.extend([102.0, 104.0, 106.0, 108.0, 112.0]);
        let vote = strategy().decide(&bars_from_closes(&closes)).unwrap();
        assert_eq!(vote.direction, Direction::Short);
    }

    #[test]
    fn quiet_market_is_flat() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 2) as f64).collect();
        assert_eq!(
            strategy().decide(&bars_from_closes(&closes)).unwrap(),
            Vote::flat()
        );
    }
}
