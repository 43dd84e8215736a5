use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use common::{Bar, Error, Result, Signal};

use crate::config::StrategyConfig;
use crate::strategies::StrategyInstance;
use crate::Strategy;

/// Enabled strategies plus a bounded window of recent bars per symbol.
///
/// Indicators are recomputed over the whole window on every evaluation, so
/// two registries with the same `max_history` fed the same bars agree bit for
/// bit regardless of when they were started.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn Strategy>>,
    history: BTreeMap<String, Vec<Bar>>,
    max_history: usize,
}

impl StrategyRegistry {
    pub const DEFAULT_MAX_HISTORY: usize = 200;

    pub fn new(strategies: Vec<Box<dyn Strategy>>, max_history: usize) -> Result<Self> {
        if let Some(s) = strategies.iter().find(|s| s.min_bars() > max_history) {
            return Err(Error::Config(format!(
                "strategy '{}' needs {} bars but lookback_bars is {max_history}",
                s.name(),
                s.min_bars()
            )));
        }
        Ok(Self {
            strategies,
            history: BTreeMap::new(),
            max_history,
        })
    }

    /// Build from config, skipping disabled entries.
    pub fn from_config(configs: &[StrategyConfig], max_history: usize) -> Result<Self> {
        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
        for cfg in configs {
            if !cfg.enabled {
                info!(name = %cfg.display_name(), "Strategy disabled, skipping");
                continue;
            }
            let strategy = StrategyInstance::from_config(cfg)?;
            info!(
                name = %strategy.name(),
                kind = strategy.kind().type_name(),
                min_bars = strategy.min_bars(),
                "Registered strategy"
            );
            strategies.push(Box::new(strategy));
        }
        Self::new(strategies, max_history)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Append one closed bar. Timestamps must strictly increase per symbol.
    pub fn push_bar(&mut self, bar: Bar) -> Result<()> {
        validate(&bar)?;
        let window = self.history.entry(bar.symbol.clone()).or_default();
        if let Some(last) = window.last() {
            if bar.timestamp <= last.timestamp {
                return Err(Error::InvalidBars(format!(
                    "{} bar at {} does not follow {}",
                    bar.symbol, bar.timestamp, last.timestamp
                )));
            }
        }
        window.push(bar);
        if window.len() > self.max_history {
            let excess = window.len() - self.max_history;
            window.drain(..excess);
        }
        Ok(())
    }

    pub fn window(&self, symbol: &str) -> &[Bar] {
        self.history.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest(&self, symbol: &str) -> Option<&Bar> {
        self.history.get(symbol).and_then(|w| w.last())
    }

    pub fn latest_timestamp(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.latest(symbol).map(|b| b.timestamp)
    }

    /// One signal per strategy for the newest bar of `symbol`, in registration
    /// order. Empty when no bars are known yet.
    pub fn evaluate(&self, symbol: &str) -> Vec<Signal> {
        let window = self.window(symbol);
        self.strategies
            .iter()
            .filter_map(|s| s.evaluate(window))
            .collect()
    }
}

fn validate(bar: &Bar) -> Result<()> {
    let prices = [bar.open, bar.high, bar.low, bar.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) || !bar.volume.is_finite() {
        return Err(Error::InvalidBars(format!(
            "{} bar at {} has non-positive or non-finite values",
            bar.symbol, bar.timestamp
        )));
    }
    if bar.high < bar.low {
        return Err(Error::InvalidBars(format!(
            "{} bar at {} has high below low",
            bar.symbol, bar.timestamp
        )));
    }
    Ok(())
}
