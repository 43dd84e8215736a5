use common::{Bar, Result};

use super::{ensure, param_f64, param_usize, Params, Vote};
use crate::indicators::{adx, atr, ema};

/// EMA trend direction confirmed by ADX strength and the DI lines.
/// A window without any true range (no volatility) never trends.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendFollowing {
    pub short_ema: usize,
    pub long_ema: usize,
    pub adx_period: usize,
    pub adx_threshold: f64,
    pub atr_period: usize,
}

impl TrendFollowing {
    pub fn from_params(params: &Params) -> Result<Self> {
        let s = Self {
            short_ema: param_usize(params, "short_ema", 10)?,
            long_ema: param_usize(params, "long_ema", 50)?,
            adx_period: param_usize(params, "adx_period", 14)?,
            adx_threshold: param_f64(params, "adx_threshold", 25.0)?,
            atr_period: param_usize(params, "atr_period", 14)?,
        };
        ensure(s.short_ema > 0, "short_ema must be positive")?;
        ensure(s.short_ema < s.long_ema, "short_ema must be less than long_ema")?;
        ensure(
            s.adx_period > 0 && s.atr_period > 0,
            "adx_period and atr_period must be positive",
        )?;
        ensure(
            (0.0..=100.0).contains(&s.adx_threshold),
            "adx_threshold must be within 0..=100",
        )?;
        Ok(s)
    }

    pub fn min_bars(&self) -> usize {
        self.long_ema
            .max(2 * self.adx_period)
            .max(self.atr_period + 1)
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let short = ema(bars, self.short_ema).last()?;
        let long = ema(bars, self.long_ema).last()?;
        let trend = adx(bars, self.adx_period);
        let strength = trend.adx.last()?;
        let plus_di = trend.plus_di.last()?;
        let minus_di = trend.minus_di.last()?;
        let volatility = atr(bars, self.atr_period).last()?;
        let price = bars.last().map(|b| b.close).unwrap_or(short);

        if strength < self.adx_threshold || volatility <= 0.0 {
            return Ok(Vote::flat());
        }
        let conviction = (strength / 50.0).min(1.0);
        if short > long && plus_di > minus_di && price > short {
            Ok(Vote::long(conviction))
        } else if short < long && minus_di > plus_di && price < short {
            Ok(Vote::short(conviction))
        } else {
            Ok(Vote::flat())
        }
    }
}
