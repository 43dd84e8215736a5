//! Rule sets that turn a bar window into a directional vote.
//!
//! Each rule is a plain parameter struct with `min_bars` and `decide`.
//! [`StrategyKind`] is the closed set of rules, built by name from
//! [`STRATEGY_TABLE`].

mod combined;
mod crossover;
mod mean_reversion;
mod rsi;
mod trend_following;
mod triple_ma;

pub use combined::Combined;
pub use crossover::{MaCrossover, MaType, MacdCross, MacdHistogram};
pub use mean_reversion::MeanReversion;
pub use rsi::{RsiDivergence, RsiReversal};
pub use trend_following::TrendFollowing;
pub use triple_ma::TripleMa;

use std::collections::HashMap;

use common::{Bar, Direction, Error, Result};

use crate::config::StrategyConfig;
use crate::Strategy;

pub type Params = HashMap<String, toml::Value>;

/// Direction plus strength, before it is stamped with symbol and time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote {
    pub direction: Direction,
    pub strength: f64,
}

impl Vote {
    pub fn long(strength: f64) -> Self {
        Self {
            direction: Direction::Long,
            strength,
        }
    }

    pub fn short(strength: f64) -> Self {
        Self {
            direction: Direction::Short,
            strength,
        }
    }

    pub fn flat() -> Self {
        Self {
            direction: Direction::Flat,
            strength: 0.0,
        }
    }
}

/// Crossover rule shared by every two-line strategy. Equality on the current
/// bar is never a cross.
pub(crate) fn cross(prev_a: f64, prev_b: f64, curr_a: f64, curr_b: f64) -> Direction {
    if prev_a <= prev_b && curr_a > curr_b {
        Direction::Long
    } else if prev_a >= prev_b && curr_a < curr_b {
        Direction::Short
    } else {
        Direction::Flat
    }
}

/// `|a − b| / |b|`, or `None` when `b` is zero.
pub(crate) fn relative_gap(a: f64, b: f64) -> Option<f64> {
    if b == 0.0 {
        None
    } else {
        Some((a - b).abs() / b.abs())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyKind {
    MaCrossover(MaCrossover),
    Rsi(RsiReversal),
    RsiDivergence(RsiDivergence),
    Macd(MacdCross),
    MacdHistogram(MacdHistogram),
    TripleMa(TripleMa),
    TrendFollowing(TrendFollowing),
    MeanReversion(MeanReversion),
    Combined(Combined),
}

type Builder = fn(&Params) -> Result<StrategyKind>;

/// Every strategy type a config file may name.
pub const STRATEGY_TABLE: &[(&str, Builder)] = &[
    ("ma_crossover", |p| Ok(StrategyKind::MaCrossover(MaCrossover::from_params(p)?))),
    ("rsi", |p| Ok(StrategyKind::Rsi(RsiReversal::from_params(p)?))),
    ("rsi_divergence", |p| Ok(StrategyKind::RsiDivergence(RsiDivergence::from_params(p)?))),
    ("macd", |p| Ok(StrategyKind::Macd(MacdCross::from_params(p)?))),
    ("macd_histogram", |p| Ok(StrategyKind::MacdHistogram(MacdHistogram::from_params(p)?))),
    ("triple_ma", |p| Ok(StrategyKind::TripleMa(TripleMa::from_params(p)?))),
    ("trend_following", |p| Ok(StrategyKind::TrendFollowing(TrendFollowing::from_params(p)?))),
    ("mean_reversion", |p| Ok(StrategyKind::MeanReversion(MeanReversion::from_params(p)?))),
    ("combined", |p| Ok(StrategyKind::Combined(Combined::from_params(p)?))),
];

impl StrategyKind {
    pub fn build(type_name: &str, params: &Params) -> Result<Self> {
        let (_, builder) = STRATEGY_TABLE
            .iter()
            .find(|(name, _)| *name == type_name)
            .ok_or_else(|| Error::Config(format!("unknown strategy type '{type_name}'")))?;
        builder(params)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StrategyKind::MaCrossover(_) => "ma_crossover",
            StrategyKind::Rsi(_) => "rsi",
            StrategyKind::RsiDivergence(_) => "rsi_divergence",
            StrategyKind::Macd(_) => "macd",
            StrategyKind::MacdHistogram(_) => "macd_histogram",
            StrategyKind::TripleMa(_) => "triple_ma",
            StrategyKind::TrendFollowing(_) => "trend_following",
            StrategyKind::MeanReversion(_) => "mean_reversion",
            StrategyKind::Combined(_) => "combined",
        }
    }

    pub fn min_bars(&self) -> usize {
        match self {
            StrategyKind::MaCrossover(s) => s.min_bars(),
            StrategyKind::Rsi(s) => s.min_bars(),
            StrategyKind::RsiDivergence(s) => s.min_bars(),
            StrategyKind::Macd(s) => s.min_bars(),
            StrategyKind::MacdHistogram(s) => s.min_bars(),
            StrategyKind::TripleMa(s) => s.min_bars(),
            StrategyKind::TrendFollowing(s) => s.min_bars(),
            StrategyKind::MeanReversion(s) => s.min_bars(),
            StrategyKind::Combined(s) => s.min_bars(),
        }
    }

    pub fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        match self {
            StrategyKind::MaCrossover(s) => s.decide(bars),
            StrategyKind::Rsi(s) => s.decide(bars),
            StrategyKind::RsiDivergence(s) => s.decide(bars),
            StrategyKind::Macd(s) => s.decide(bars),
            StrategyKind::MacdHistogram(s) => s.decide(bars),
            StrategyKind::TripleMa(s) => s.decide(bars),
            StrategyKind::TrendFollowing(s) => s.decide(bars),
            StrategyKind::MeanReversion(s) => s.decide(bars),
            StrategyKind::Combined(s) => s.decide(bars),
        }
    }
}

/// A configured strategy: a rule plus the name it reports signals under.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyInstance {
    name: String,
    kind: StrategyKind,
}

impl StrategyInstance {
    pub fn new(name: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn from_config(cfg: &StrategyConfig) -> Result<Self> {
        let kind = StrategyKind::build(&cfg.strategy_type, &cfg.params)
            .map_err(|e| Error::Config(format!("strategy '{}': {e}", cfg.display_name())))?;
        Ok(Self::new(cfg.display_name(), kind))
    }

    pub fn kind(&self) -> &StrategyKind {
        &self.kind
    }
}

impl Strategy for StrategyInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_bars(&self) -> usize {
        self.kind.min_bars()
    }

    fn decide(&self, bars: &[Bar]) -> Result<Vote> {
        self.kind.decide(bars)
    }
}

// ─── Parameter helpers ────────────────────────────────────────────────────────

pub(crate) fn param_f64(params: &Params, key: &str, default: f64) -> Result<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(toml::Value::Float(v)) => Ok(*v),
        Some(toml::Value::Integer(v)) => Ok(*v as f64),
        Some(other) => Err(Error::Config(format!("'{key}' must be a number, got {other}"))),
    }
}

pub(crate) fn param_usize(params: &Params, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(toml::Value::Integer(v)) if *v > 0 => Ok(*v as usize),
        Some(other) => Err(Error::Config(format!(
            "'{key}' must be a positive integer, got {other}"
        ))),
    }
}

pub(crate) fn param_str<'a>(params: &'a Params, key: &str, default: &'a str) -> Result<&'a str> {
    match params.get(key) {
        None => Ok(default),
        Some(toml::Value::String(v)) => Ok(v.as_str()),
        Some(other) => Err(Error::Config(format!("'{key}' must be a string, got {other}"))),
    }
}

pub(crate) fn ensure(condition: bool, message: impl Into<String>) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Config(message.into()))
    }
}
