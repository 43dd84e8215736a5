use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Direction, Signal};

/// Source name stamped on aggregated decisions.
pub const AGGREGATE_SOURCE: &str = "aggregate";

/// How per-strategy signals become one decision.
///
/// ```toml
/// [aggregation]
/// policy = "min_confirmations"
/// min_confirmations = 2
/// ```
/// or
/// ```toml
/// [aggregation]
/// policy = "weighted_strength"
/// threshold = 0.5
/// weights = { trend = 2.0, rsi = 1.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// At least this many strategies must agree on a direction.
    MinConfirmations {
        #[serde(default = "default_min_confirmations")]
        min_confirmations: usize,
    },
    /// Weight-normalized strength sum per direction must reach `threshold`.
    /// Strategies missing from `weights` weigh 1.0.
    WeightedStrength {
        threshold: f64,
        #[serde(default)]
        weights: BTreeMap<String, f64>,
    },
}

fn default_min_confirmations() -> usize {
    1
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        AggregationPolicy::MinConfirmations {
            min_confirmations: default_min_confirmations(),
        }
    }
}

/// Combine one tick's signals for one symbol.
///
/// Returns `None` when there are no signals at all (no enabled strategies).
/// When both directions qualify with equal support the decision is flat.
pub fn aggregate(
    symbol: &str,
    timestamp: DateTime<Utc>,
    signals: &[Signal],
    policy: &AggregationPolicy,
) -> Option<Signal> {
    if signals.is_empty() {
        return None;
    }

    let (direction, strength) = match policy {
        AggregationPolicy::MinConfirmations { min_confirmations } => {
            by_confirmations(signals, (*min_confirmations).max(1))
        }
        AggregationPolicy::WeightedStrength { threshold, weights } => {
            by_weight(signals, *threshold, weights)
        }
    };

    Some(Signal::new(
        symbol,
        timestamp,
        direction,
        strength,
        AGGREGATE_SOURCE,
    ))
}

fn by_confirmations(signals: &[Signal], min: usize) -> (Direction, f64) {
    let side = |d: Direction| -> Vec<f64> {
        signals
            .iter()
            .filter(|s| s.direction == d)
            .map(|s| s.strength)
            .collect()
    };
    let longs = side(Direction::Long);
    let shorts = side(Direction::Short);
    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;

    let long_ok = longs.len() >= min;
    let short_ok = shorts.len() >= min;
    match (long_ok, short_ok) {
        (true, false) => (Direction::Long, mean(&longs)),
        (false, true) => (Direction::Short, mean(&shorts)),
        (true, true) if longs.len() > shorts.len() => (Direction::Long, mean(&longs)),
        (true, true) if shorts.len() > longs.len() => (Direction::Short, mean(&shorts)),
        _ => (Direction::Flat, 0.0),
    }
}

fn by_weight(
    signals: &[Signal],
    threshold: f64,
    weights: &BTreeMap<String, f64>,
) -> (Direction, f64) {
    let weight = |s: &Signal| weights.get(&s.source).copied().unwrap_or(1.0).max(0.0);
    let total: f64 = signals.iter().map(|s| weight(s)).sum();
    if total <= 0.0 {
        return (Direction::Flat, 0.0);
    }

    let score = |d: Direction| -> f64 {
        signals
            .iter()
            .filter(|s| s.direction == d)
            .map(|s| weight(s) * s.strength)
            .sum::<f64>()
            / total
    };
    let long = score(Direction::Long);
    let short = score(Direction::Short);

    match (long >= threshold, short >= threshold) {
        (true, false) => (Direction::Long, long),
        (false, true) => (Direction::Short, short),
        (true, true) if long > short => (Direction::Long, long),
        (true, true) if short > long => (Direction::Short, short),
        _ => (Direction::Flat, 0.0),
    }
}
