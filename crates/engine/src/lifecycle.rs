use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use common::{Bar, EngineCommand, EngineState, ExchangeClient, Result};
use risk::price_from_f64;

use crate::config::TradingConfig;
use crate::pipeline::DecisionPipeline;
use crate::retry::RetryPolicy;
use crate::service::OrderManagerHandle;

/// Cloneable handle for whoever controls the engine (signal handler, main).
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    state: Arc<RwLock<EngineState>>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.send(cmd).await;
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }
}

/// The live and paper trading loop.
///
/// Every tick fetches closed bars for all symbols, feeds the new ones to the
/// decision pipeline and hands the resulting intents to the Order Manager.
/// Portfolio state is only ever read through Order Manager snapshots.
pub struct Engine {
    cfg: TradingConfig,
    pipeline: DecisionPipeline,
    market: Arc<dyn ExchangeClient>,
    retry: RetryPolicy,
    orders: OrderManagerHandle,
    state: Arc<RwLock<EngineState>>,
    current: EngineState,
    command_rx: mpsc::Receiver<EngineCommand>,
    /// Open time of the newest bar already pushed, per symbol.
    last_seen: BTreeMap<String, DateTime<Utc>>,
    ticks: u64,
}

impl Engine {
    pub fn new(
        cfg: TradingConfig,
        market: Arc<dyn ExchangeClient>,
        retry: RetryPolicy,
        orders: OrderManagerHandle,
    ) -> Result<(Self, EngineHandle)> {
        let (command_tx, command_rx) = mpsc::channel(32);
        let state = Arc::new(RwLock::new(EngineState::Stopped));
        let handle = EngineHandle {
            command_tx,
            state: state.clone(),
        };
        let engine = Engine {
            pipeline: DecisionPipeline::from_config(&cfg)?,
            cfg,
            market,
            retry,
            orders,
            state,
            current: EngineState::Stopped,
            command_rx,
            last_seen: BTreeMap::new(),
            ticks: 0,
        };
        Ok((engine, handle))
    }

    /// Drive the engine until `Stop`, a closed command channel, or a fatal
    /// error. Call from `tokio::spawn`.
    pub async fn run(mut self) -> Result<()> {
        info!("Engine initialized in Stopped state. Waiting for Start command.");

        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.cfg.schedule.interval_minutes * 60,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poller: Option<JoinHandle<()>> = None;

        loop {
            let active = matches!(self.current, EngineState::Running | EngineState::Paused);
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(EngineCommand::Start) => {
                        if self.current != EngineState::Stopped {
                            info!(state = %self.current, "Engine already started");
                            continue;
                        }
                        info!(symbols = ?self.cfg.symbols, interval = %self.cfg.interval, "Starting trading loop");
                        if let Err(e) = self.start().await {
                            return self.halt(poller.take(), e).await;
                        }
                        poller = self.spawn_fill_poller();
                        ticker.reset_immediately();
                    }
                    Some(EngineCommand::Stop) | None => {
                        info!("Engine stopping");
                        if let Some(p) = poller.take() {
                            p.abort();
                        }
                        let result = self
                            .orders
                            .shutdown(self.cfg.schedule.cancel_open_orders_on_stop)
                            .await;
                        self.set_state(EngineState::Stopped).await;
                        return result;
                    }
                    Some(EngineCommand::Pause) => {
                        if self.current == EngineState::Running {
                            info!("Engine paused. Bars keep flowing, no new orders.");
                            self.set_state(EngineState::Paused).await;
                        }
                    }
                    Some(EngineCommand::Resume) => {
                        if self.current == EngineState::Paused {
                            info!("Engine resumed");
                            self.set_state(EngineState::Running).await;
                        }
                    }
                },
                _ = ticker.tick(), if active => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        return self.halt(poller.take(), e).await;
                    }
                }
            }
        }
    }

    /// Reconcile with the exchange and switch to `Running`. Ticks from then
    /// on submit orders.
    pub async fn start(&mut self) -> Result<()> {
        self.startup_reconcile().await?;
        self.set_state(EngineState::Running).await;
        Ok(())
    }

    async fn set_state(&mut self, state: EngineState) {
        self.current = state;
        *self.state.write().await = state;
    }

    async fn halt(&mut self, poller: Option<JoinHandle<()>>, e: common::Error) -> Result<()> {
        error!(error = %e, "Fatal error, halting engine");
        if let Some(p) = poller {
            p.abort();
        }
        self.set_state(EngineState::Halted).await;
        if let Err(shutdown) = self.orders.shutdown(false).await {
            warn!(error = %shutdown, "Order manager shutdown after halt failed");
        }
        Err(e)
    }

    async fn startup_reconcile(&self) -> Result<()> {
        match self.orders.reconcile().await {
            Ok(report) if report.is_clean() => {
                info!("Startup reconciliation clean");
                Ok(())
            }
            Ok(report) => {
                warn!(discrepancies = report.discrepancies.len(), "Startup reconciliation corrected local state");
                Ok(())
            }
            Err(e) => escalate(e, "Startup reconciliation failed"),
        }
    }

    fn spawn_fill_poller(&self) -> Option<JoinHandle<()>> {
        let every = self.cfg.schedule.fill_poll_seconds;
        if every == 0 {
            return None;
        }
        let orders = self.orders.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(every));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                orders.request_fill_poll();
            }
        }))
    }

    /// One pass over all symbols. Only fatal errors come back as `Err`.
    ///
    /// New closed bars from every symbol are handled in the same order a
    /// backtest replays them: by open time, ties broken by symbol. Each bar
    /// is decided on its own clock, so trading hours and the day boundary do
    /// not depend on when the tick happens to run. While paused, bars are
    /// still ingested so indicator history stays current.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ticks += 1;
        let trading = self.current == EngineState::Running;
        debug!(tick = self.ticks, trading, "Tick");

        let mut fetched = self.fetch_all().await;
        let mut batch: Vec<(Bar, bool)> = Vec::new();
        for symbol in self.cfg.symbols.clone() {
            let bars = match fetched.remove(&symbol) {
                Some(Ok(bars)) => bars,
                Some(Err(e)) => {
                    escalate(e, "Bar fetch failed, skipping symbol this tick")?;
                    continue;
                }
                None => continue,
            };
            // the first batch is history: only its newest bar is traded
            let warming_up = !self.last_seen.contains_key(&symbol);
            let new_bars = self.new_closed_bars(&symbol, bars, now);
            let last = new_bars.len().saturating_sub(1);
            batch.extend(
                new_bars
                    .into_iter()
                    .enumerate()
                    .map(|(i, bar)| (bar, !warming_up || i == last)),
            );
        }
        batch.sort_by(|(a, _), (b, _)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        for (bar, tradable) in batch {
            self.ingest(bar, trading && tradable).await?;
        }

        if let Err(e) = self.orders.poll_fills().await {
            escalate(e, "Fill poll failed")?;
        }
        let every = u64::from(self.cfg.schedule.reconcile_every_ticks);
        if every > 0 && self.ticks % every == 0 {
            match self.orders.reconcile().await {
                Ok(report) if !report.is_clean() => {
                    warn!(discrepancies = report.discrepancies.len(), "Reconciliation corrected local state")
                }
                Ok(_) => {}
                Err(e) => escalate(e, "Reconciliation failed")?,
            }
        }
        Ok(())
    }

    /// Push one bar and, when `evaluate` is set and the bar falls inside
    /// trading hours, decide on it. Mirrors a backtest step: the venue sees
    /// the bar, fills from earlier bars are applied, then the decision runs.
    async fn ingest(&mut self, bar: Bar, evaluate: bool) -> Result<()> {
        if let Err(e) = self.pipeline.push_bar(bar.clone()) {
            warn!(symbol = %bar.symbol, error = %e, "Bar dropped");
            return Ok(());
        }
        self.last_seen.insert(bar.symbol.clone(), bar.timestamp);
        if let Err(e) = self.market.advance(&bar).await {
            escalate(e, "Venue could not advance to bar")?;
        }
        if !evaluate {
            return Ok(());
        }
        if !self.cfg.schedule.is_trading_time(bar.timestamp) {
            debug!(symbol = %bar.symbol, timestamp = %bar.timestamp, "Bar outside trading hours");
            return Ok(());
        }
        if let Err(e) = self.orders.poll_fills().await {
            escalate(e, "Fill poll failed")?;
        }
        self.decide(&bar).await
    }

    async fn fetch_all(&self) -> BTreeMap<String, Result<Vec<Bar>>> {
        let mut set = JoinSet::new();
        for symbol in &self.cfg.symbols {
            let market = Arc::clone(&self.market);
            let retry = self.retry.clone();
            let symbol = symbol.clone();
            let interval = self.cfg.interval.clone();
            let lookback = self.cfg.lookback_bars;
            set.spawn(async move {
                let bars = retry
                    .run("fetch_bars", || market.fetch_bars(&symbol, &interval, lookback))
                    .await;
                (symbol, bars)
            });
        }
        let mut out = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((symbol, bars)) => {
                    out.insert(symbol, bars);
                }
                Err(e) => error!(error = %e, "Bar fetch task failed"),
            }
        }
        out
    }

    /// Closed bars newer than the last one pushed for `symbol`, oldest first.
    fn new_closed_bars(&self, symbol: &str, mut bars: Vec<Bar>, now: DateTime<Utc>) -> Vec<Bar> {
        let bar_len = self.cfg.bar_duration();
        let after = self.last_seen.get(symbol).copied();
        bars.retain(|b| {
            b.symbol == symbol
                && after.map_or(true, |t| b.timestamp > t)
                && b.timestamp + bar_len <= now
        });
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        bars
    }

    async fn decide(&mut self, bar: &Bar) -> Result<()> {
        let symbol = bar.symbol.as_str();
        let Some(price) = price_from_f64(bar.close) else {
            warn!(symbol, close = bar.close, "Bar has no usable close, skipping");
            return Ok(());
        };
        let snapshot = match self.orders.prepare(symbol, price, bar.timestamp).await {
            Ok(s) => s,
            Err(e) => return escalate(e, "Could not prepare portfolio snapshot"),
        };
        let decision = self.pipeline.evaluate(symbol, &snapshot);
        if decision.events.is_empty() {
            return Ok(());
        }
        match self.orders.submit(decision.events, decision.intent).await {
            Ok(Some(order)) => {
                info!(order_id = %order.id, symbol, status = %order.status, "Order placed");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => escalate(e, "Order submission failed"),
        }
    }
}

/// Fatal errors propagate; anything else is logged and the loop moves on.
fn escalate(e: common::Error, context: &str) -> Result<()> {
    if e.is_fatal() {
        return Err(e);
    }
    warn!(error = %e, "{context}");
    Ok(())
}
