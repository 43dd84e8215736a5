use common::{Bar, Result};

use super::{ensure, param_usize, Params, Vote};
use crate::indicators::sma;

/// Short, medium and long SMAs stacked in order, with price above the short one.
#[derive(Debug, Clone, PartialEq)]
pub struct TripleMa {
    pub short_period: usize,
    pub medium_period: usize,
    pub long_period: usize,
}

impl TripleMa {
    pub fn from_params(params: &Params) -> Result<Self> {
        let s = Self {
            short_period: param_usize(params, "short_period", 5)?,
            medium_period: param_usize(params, "medium_period", 10)?,
            long_period: param_usize(params, "long_period", 20)?,
        };
        ensure(
            s.short_period < s.medium_period && s.medium_period < s.long_period,
            "triple_ma periods must be strictly increasing",
        )?;
        Ok(s)
    }

    pub fn min_bars(&self) -> usize {
        self.long_period
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        let short = sma(bars, self.short_period).last()?;
        let medium = sma(bars, self.medium_period).last()?;
        let long = sma(bars, self.long_period).last()?;
        // last() succeeded, so the window is non-empty
        let price = bars.last().map(|b| b.close).unwrap_or(short);

        if long == 0.0 {
            return Ok(Vote::flat());
        }
        if short > medium && medium > long && price > short {
            Ok(Vote::long(((short - long) / long * 10.0).min(1.0)))
        } else if short < medium && medium < long && price < short {
            Ok(Vote::short(((long - short) / long * 10.0).min(1.0)))
        } else {
            Ok(Vote::flat())
        }
    }
}
