use rust_decimal::Decimal;

use common::{Bar, OrderIntent, PortfolioState, Result, TraceEvent};
use risk::{price_from_f64, RiskManager};
use strategy::{aggregate, AggregationPolicy, StrategyRegistry};

use crate::config::TradingConfig;

/// Outcome of one symbol on one bar: what happened, and at most one intent
/// for the Order Manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickDecision {
    pub events: Vec<TraceEvent>,
    pub intent: Option<OrderIntent>,
}

/// Bars in, order intents out. Pure and synchronous; shared unchanged by the
/// backtest and the live loop.
pub struct DecisionPipeline {
    registry: StrategyRegistry,
    policy: AggregationPolicy,
    risk: RiskManager,
}

impl DecisionPipeline {
    pub fn new(registry: StrategyRegistry, policy: AggregationPolicy, risk: RiskManager) -> Self {
        Self {
            registry,
            policy,
            risk,
        }
    }

    pub fn from_config(cfg: &TradingConfig) -> Result<Self> {
        Ok(Self::new(
            StrategyRegistry::from_config(&cfg.strategies, cfg.lookback_bars)?,
            cfg.aggregation.clone(),
            RiskManager::new(cfg.risk.clone()),
        ))
    }

    pub fn push_bar(&mut self, bar: Bar) -> Result<()> {
        self.registry.push_bar(bar)
    }

    pub fn latest(&self, symbol: &str) -> Option<&Bar> {
        self.registry.latest(symbol)
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Decide for the newest bar of `symbol` against a portfolio snapshot.
    ///
    /// A protective exit, when one triggers, replaces strategy evaluation for
    /// this bar. Flat decisions stop before the Risk Manager.
    pub fn evaluate(&self, symbol: &str, snapshot: &PortfolioState) -> TickDecision {
        let Some(bar) = self.registry.latest(symbol) else {
            return TickDecision::default();
        };
        let mut events = Vec::new();

        if let Some(position) = snapshot.positions.get(symbol) {
            if !snapshot.has_open_order_for(symbol) {
                if let Some((trigger, intent)) = self.risk.protective_exit(position, bar) {
                    events.push(TraceEvent::ProtectiveExit {
                        symbol: symbol.to_string(),
                        timestamp: bar.timestamp,
                        trigger,
                        price: intent.reference_price,
                    });
                    events.push(TraceEvent::IntentApproved(intent.clone()));
                    return TickDecision {
                        events,
                        intent: Some(intent),
                    };
                }
            }
        }

        let signals = self.registry.evaluate(symbol);
        events.extend(signals.iter().cloned().map(TraceEvent::Signal));

        let Some(decision) = aggregate(symbol, bar.timestamp, &signals, &self.policy) else {
            return TickDecision {
                events,
                intent: None,
            };
        };
        events.push(TraceEvent::Decision(decision.clone()));
        if !decision.is_actionable() {
            return TickDecision {
                events,
                intent: None,
            };
        }

        let price = price_from_f64(bar.close).unwrap_or(Decimal::ZERO);
        let intent = match self.risk.evaluate(&decision, snapshot, price) {
            Ok(intent) => {
                events.push(TraceEvent::IntentApproved(intent.clone()));
                Some(intent)
            }
            Err(rejection) => {
                events.push(TraceEvent::IntentRejected(rejection));
                None
            }
        };
        TickDecision { events, intent }
    }
}
