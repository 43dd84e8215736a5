pub mod aggregator;
pub mod config;
pub mod indicators;
pub mod registry;
pub mod strategies;

pub use aggregator::{aggregate, AggregationPolicy, AGGREGATE_SOURCE};
pub use config::StrategyConfig;
pub use registry::StrategyRegistry;
pub use strategies::{StrategyInstance, StrategyKind, Vote, STRATEGY_TABLE};

use tracing::debug;

use common::{Bar, Error, Result, Signal};

/// All strategy implementations must satisfy this trait.
pub trait Strategy: Send + Sync {
    /// Name stamped on every signal this strategy emits.
    fn name(&self) -> &str;

    /// Bars required before `decide` can return anything but insufficient data.
    fn min_bars(&self) -> usize;

    /// Apply the rule set to a window of closed bars, oldest first.
    fn decide(&self, bars: &[Bar]) -> Result<Vote>;

    /// Signal for the newest bar of `bars`. Missing data degrades to a flat
    /// signal; an empty window yields `None`.
    fn evaluate(&self, bars: &[Bar]) -> Option<Signal> {
        let last = bars.last()?;
        let vote = match self.decide(bars) {
            Ok(vote) => vote,
            Err(Error::InsufficientData {
                indicator,
                required,
                available,
            }) => {
                debug!(
                    strategy = %self.name(),
                    indicator,
                    required,
                    available,
                    "Insufficient data, emitting flat"
                );
                Vote::flat()
            }
            Err(e) => {
                debug!(strategy = %self.name(), error = %e, "Strategy evaluation failed, emitting flat");
                Vote::flat()
            }
        };
        Some(Signal::new(
            &last.symbol,
            last.timestamp,
            vote.direction,
            vote.strength,
            self.name(),
        ))
    }
}
