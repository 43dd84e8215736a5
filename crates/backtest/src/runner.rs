use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use common::{Bar, Error, OrderIntent, PortfolioState, Position, Result, TraceEvent};
use engine::{DecisionPipeline, OrderManager, RetryPolicy, TradingConfig};
use paper::{SimulatedExchange, SimulationCosts};
use risk::price_from_f64;

use crate::metrics::{EquityPoint, Metrics};

const ORDER_ID_PREFIX: &str = "bt";

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub bars_processed: usize,
    pub metrics: Metrics,
    pub equity_curve: Vec<EquityPoint>,
    pub final_state: PortfolioState,
    /// Signals, decisions, verdicts, orders and fills in the order they happened.
    pub trace: Vec<TraceEvent>,
    /// BLAKE3 of the trace's JSON. Equal inputs give equal digests.
    pub digest: String,
}

/// Replays bars through the same pipeline and Order Manager the live loop
/// uses, against a [`SimulatedExchange`].
pub struct Backtester {
    cfg: TradingConfig,
    initial_cash: Decimal,
    costs: SimulationCosts,
}

impl Backtester {
    pub fn new(cfg: TradingConfig, initial_cash: Decimal, costs: SimulationCosts) -> Self {
        Self {
            cfg,
            initial_cash,
            costs,
        }
    }

    /// Bars may cover several symbols; they are replayed in timestamp order,
    /// ties broken by symbol. Each bar runs: fills from the previous bar's
    /// orders, day roll, mark, pipeline, submission.
    pub async fn run(&self, mut bars: Vec<Bar>) -> Result<BacktestReport> {
        if bars.is_empty() {
            return Err(Error::InvalidBars("no bars to replay".into()));
        }
        bars.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let offset = self.cfg.schedule.offset();
        let first_day = bars[0].timestamp.with_timezone(&offset).date_naive();
        let sim = SimulatedExchange::new(self.initial_cash, self.costs.clone());
        let mut om = OrderManager::new(self.initial_cash, first_day, ORDER_ID_PREFIX)
            .with_position_limit(self.cfg.risk.max_open_positions);
        let mut pipeline = DecisionPipeline::from_config(&self.cfg)?;
        let retry = RetryPolicy::default();

        let mut trace = Vec::new();
        let mut curve = Vec::new();
        let mut last_bars: BTreeMap<String, Bar> = BTreeMap::new();
        let bars_processed = bars.len();

        for bar in bars {
            let symbol = bar.symbol.clone();
            let timestamp = bar.timestamp;

            sim.on_bar(&bar).await;
            apply_fills(&sim, &mut om).await?;
            om.roll_day(timestamp, offset);
            if let Some(price) = price_from_f64(bar.close) {
                om.mark(&symbol, price);
            }
            pipeline.push_bar(bar.clone())?;
            last_bars.insert(symbol.clone(), bar);

            if !self.cfg.backtest.respect_trading_hours || self.cfg.schedule.is_trading_time(timestamp) {
                let decision = pipeline.evaluate(&symbol, om.state());
                for event in decision.events {
                    om.record(event);
                }
                if let Some(intent) = decision.intent {
                    submit(&mut om, intent, &sim, &retry).await?;
                }
            }

            trace.extend(om.drain_events());
            record_equity(&mut curve, timestamp, om.state().equity());
        }

        if self.cfg.backtest.liquidate_at_end {
            liquidate(&mut om, &pipeline, &sim, &retry, &last_bars).await?;
            trace.extend(om.drain_events());
            if let Some(last) = last_bars.values().map(|b| b.timestamp).max() {
                record_equity(&mut curve, last, om.state().equity());
            }
        }

        let metrics = Metrics::compute(
            self.initial_cash,
            &curve,
            &trace,
            self.cfg.backtest.periods_per_year,
        );
        let digest = trace_digest(&trace)?;
        info!(
            bars = bars_processed,
            trades = metrics.trades,
            final_equity = %metrics.final_equity,
            total_return = metrics.total_return,
            max_drawdown = metrics.max_drawdown,
            digest = %digest,
            "Backtest complete"
        );

        Ok(BacktestReport {
            bars_processed,
            metrics,
            equity_curve: curve,
            final_state: om.snapshot(),
            trace,
            digest,
        })
    }
}

pub fn trace_digest(trace: &[TraceEvent]) -> Result<String> {
    let canonical = serde_json::to_vec(trace)?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}

async fn apply_fills(sim: &SimulatedExchange, om: &mut OrderManager) -> Result<()> {
    use common::ExchangeClient;

    for fill in sim.poll_fills().await? {
        om.on_fill(fill)?;
    }
    Ok(())
}

/// Refusals at submission are part of the trace, not failures of the run.
async fn submit(
    om: &mut OrderManager,
    intent: OrderIntent,
    sim: &SimulatedExchange,
    retry: &RetryPolicy,
) -> Result<()> {
    match om.submit(intent, sim, retry).await {
        Ok(_) | Err(Error::RiskRejected(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Cancel unfilled orders, then close every position at its symbol's last close.
async fn liquidate(
    om: &mut OrderManager,
    pipeline: &DecisionPipeline,
    sim: &SimulatedExchange,
    retry: &RetryPolicy,
    last_bars: &BTreeMap<String, Bar>,
) -> Result<()> {
    for order in om.open_orders() {
        let at = last_bars
            .get(&order.symbol)
            .map_or(order.updated_at, |b| b.timestamp);
        om.cancel(&order.id, sim, retry, at).await?;
    }

    let positions: Vec<Position> = om.state().positions.values().cloned().collect();
    for position in positions {
        let Some(bar) = last_bars.get(&position.symbol) else {
            continue;
        };
        let Some(price) = price_from_f64(bar.close) else {
            continue;
        };
        let intent = pipeline.risk().liquidation(&position, bar.timestamp, price);
        submit(om, intent, sim, retry).await?;
        sim.settle_at_close(bar).await;
    }
    apply_fills(sim, om).await
}

fn record_equity(curve: &mut Vec<EquityPoint>, timestamp: DateTime<Utc>, equity: Decimal) {
    match curve.last_mut() {
        Some(last) if last.timestamp == timestamp => last.equity = equity,
        _ => curve.push(EquityPoint { timestamp, equity }),
    }
}
