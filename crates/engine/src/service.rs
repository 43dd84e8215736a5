use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::{
    Error, ExchangeClient, FillEvent, Order, OrderIntent, PortfolioState, Result, TraceEvent,
};

use crate::order_manager::{FillOutcome, OrderManager, ReconcileReport};
use crate::retry::RetryPolicy;
use crate::store::Store;

const COMMAND_BUFFER: usize = 64;

enum Command {
    Prepare {
        symbol: String,
        price: Decimal,
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<PortfolioState>>,
    },
    Snapshot {
        reply: oneshot::Sender<PortfolioState>,
    },
    Submit {
        events: Vec<TraceEvent>,
        intent: Option<OrderIntent>,
        reply: oneshot::Sender<Result<Option<Order>>>,
    },
    PollFills {
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
    Reconcile {
        reply: oneshot::Sender<Result<ReconcileReport>>,
    },
    Shutdown {
        cancel_open: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to the Order Manager actor. All portfolio mutations in a
/// live run go through here, one at a time.
#[derive(Clone)]
pub struct OrderManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl OrderManagerHandle {
    /// Mark `symbol` at `price`, roll the trading day if `now` starts a new
    /// one, and return the resulting snapshot.
    pub async fn prepare(
        &self,
        symbol: &str,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<PortfolioState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Prepare {
            symbol: symbol.to_string(),
            price,
            now,
            reply,
        })
        .await?;
        rx.await.map_err(closed)?
    }

    pub async fn snapshot(&self) -> Result<PortfolioState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(closed)
    }

    /// Record the decision trace of one bar and submit its intent, if any.
    pub async fn submit(
        &self,
        events: Vec<TraceEvent>,
        intent: Option<OrderIntent>,
    ) -> Result<Option<Order>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            events,
            intent,
            reply,
        })
        .await?;
        rx.await.map_err(closed)?
    }

    /// Pull fills from the exchange and apply them. Returns how many were applied.
    pub async fn poll_fills(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PollFills { reply: Some(reply) }).await?;
        rx.await.map_err(closed)?
    }

    /// Fire-and-forget variant for the background poller. Skips the tick if
    /// the queue is full.
    pub fn request_fill_poll(&self) {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            self.tx.try_send(Command::PollFills { reply: None })
        {
            debug!("Order manager busy, skipping fill poll");
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reconcile { reply }).await?;
        rx.await.map_err(closed)?
    }

    /// Drain queued commands, optionally cancel and confirm every open
    /// order, persist, and stop the actor.
    pub async fn shutdown(&self, cancel_open: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { cancel_open, reply }).await?;
        rx.await.map_err(closed)?
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::Other("order manager is not running".into()))
    }
}

fn closed(_: oneshot::error::RecvError) -> Error {
    Error::Other("order manager dropped the request".into())
}

/// The actor owning the [`OrderManager`] in live and paper runs.
pub struct OrderManagerService {
    manager: OrderManager,
    exchange: Arc<dyn ExchangeClient>,
    retry: RetryPolicy,
    store: Option<Store>,
    offset: FixedOffset,
    rx: mpsc::Receiver<Command>,
}

impl OrderManagerService {
    pub fn spawn(
        manager: OrderManager,
        exchange: Arc<dyn ExchangeClient>,
        retry: RetryPolicy,
        store: Option<Store>,
        offset: FixedOffset,
    ) -> (OrderManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let service = Self {
            manager,
            exchange,
            retry,
            store,
            offset,
            rx,
        };
        (OrderManagerHandle { tx }, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        info!(
            open_orders = self.manager.state().open_orders.len(),
            positions = self.manager.state().positions.len(),
            "Order manager running"
        );
        while let Some(cmd) = self.rx.recv().await {
            if let Command::Shutdown { cancel_open, reply } = cmd {
                self.rx.close();
                while let Some(queued) = self.rx.recv().await {
                    self.handle(queued).await;
                }
                let _ = reply.send(self.shutdown(cancel_open).await);
                info!("Order manager stopped");
                return;
            }
            self.handle(cmd).await;
        }
        warn!("Order manager command channel closed");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Prepare {
                symbol,
                price,
                now,
                reply,
            } => {
                self.manager.roll_day(now, self.offset);
                self.manager.mark(&symbol, price);
                let result = self.persist().await.map(|_| self.manager.snapshot());
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.manager.snapshot());
            }
            Command::Submit {
                events,
                intent,
                reply,
            } => {
                let _ = reply.send(self.submit(events, intent).await);
            }
            Command::PollFills { reply } => {
                let result = self.poll_fills().await;
                if let Err(e) = &result {
                    warn!(error = %e, "Fill poll failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Reconcile { reply } => {
                let _ = reply.send(self.reconcile().await);
            }
            Command::Shutdown { reply, .. } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// The pending order is persisted before it goes out, so a crash during
    /// the exchange call leaves it and the advanced id counter on record.
    async fn submit(
        &mut self,
        events: Vec<TraceEvent>,
        intent: Option<OrderIntent>,
    ) -> Result<Option<Order>> {
        for event in events {
            self.manager.record(event);
        }
        let Some(intent) = intent else {
            self.persist().await?;
            return Ok(None);
        };
        let opened = match self.manager.open_order(intent) {
            Ok(order) => order,
            Err(Error::RiskRejected(_)) => {
                self.persist().await?;
                return Ok(None);
            }
            Err(e) => {
                self.persist().await?;
                return Err(e);
            }
        };
        self.persist().await?;

        let result = self
            .manager
            .send_order(&opened.id, self.exchange.as_ref(), &self.retry)
            .await;
        self.persist().await?;
        result.map(Some)
    }

    async fn poll_fills(&mut self) -> Result<usize> {
        let (applied, refused) = self.apply_polled_fills().await?;
        if refused > 0 {
            warn!(refused, "Fills disagree with local state, reconciling now");
            self.correct_from_exchange().await?;
        }
        Ok(applied)
    }

    /// Returns how many fills were applied and how many `on_fill` refused.
    async fn apply_polled_fills(&mut self) -> Result<(usize, usize)> {
        let exchange = Arc::clone(&self.exchange);
        let fills: Vec<FillEvent> = self.retry.run("poll_fills", || exchange.poll_fills()).await?;
        let mut applied = 0;
        let mut refused = 0;
        for fill in fills {
            match self.manager.on_fill(fill) {
                Ok(FillOutcome::Applied(n)) => applied += n,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Fill could not be applied");
                    refused += 1;
                }
            }
        }
        self.persist().await?;
        Ok((applied, refused))
    }

    /// Fills first, so the exchange's open orders and balances are compared
    /// against the most complete local view.
    async fn reconcile(&mut self) -> Result<ReconcileReport> {
        if let Err(e) = self.apply_polled_fills().await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(error = %e, "Fill poll before reconcile failed");
        }
        self.correct_from_exchange().await
    }

    async fn correct_from_exchange(&mut self) -> Result<ReconcileReport> {
        let exchange = Arc::clone(&self.exchange);
        let account = self
            .retry
            .run("account_state", || exchange.account_state())
            .await?;
        let report = self.manager.reconcile(&account, Utc::now());
        self.persist().await?;
        Ok(report)
    }

    async fn shutdown(&mut self, cancel_open: bool) -> Result<()> {
        if cancel_open {
            for order in self.manager.open_orders() {
                let exchange = Arc::clone(&self.exchange);
                match self
                    .manager
                    .cancel(&order.id, exchange.as_ref(), &self.retry, Utc::now())
                    .await
                {
                    Ok(o) => info!(order_id = %o.id, status = %o.status, "Open order handled at shutdown"),
                    Err(e) => error!(order_id = %order.id, error = %e, "Cancel at shutdown failed"),
                }
            }
        }
        if let Err(e) = self.poll_fills().await {
            warn!(error = %e, "Final fill poll failed");
        }
        let remaining = self.manager.state().open_orders.len();
        if remaining > 0 {
            warn!(remaining, "Stopping with open orders; they will be reconciled on restart");
        }
        self.persist().await
    }

    async fn persist(&mut self) -> Result<()> {
        let events = self.manager.drain_events();
        for event in &events {
            log_event(event);
        }
        match &self.store {
            Some(store) => store.persist(&self.manager, &events, Utc::now()).await,
            None => Ok(()),
        }
    }
}

/// Load the persisted manager, or start a fresh one whose order ids carry
/// this deployment's session id, then re-arm fill tracking for open orders.
pub async fn restore_manager(
    store: &Store,
    exchange: &dyn ExchangeClient,
    initial_cash: Decimal,
    today: NaiveDate,
    max_open_positions: usize,
) -> Result<OrderManager> {
    let manager = match store.load_manager().await? {
        Some(manager) => {
            info!(
                prefix = manager.id_prefix(),
                open_orders = manager.state().open_orders.len(),
                "Restored order manager state"
            );
            manager
        }
        None => {
            let session = store.session_id().await?;
            info!(session = %session, cash = %initial_cash, "Starting with a fresh portfolio");
            OrderManager::new(initial_cash, today, session)
        }
    };
    exchange.resume_tracking(&manager.open_orders()).await?;
    Ok(manager.with_position_limit(max_open_positions))
}

/// Live logs carry the same events, in the same JSON shape, as backtest traces.
pub fn log_event(event: &TraceEvent) {
    match serde_json::to_string(event) {
        Ok(json) => match event {
            TraceEvent::Signal(_) => debug!(target: "trace", kind = event.kind(), "{json}"),
            TraceEvent::Discrepancy(_) => warn!(target: "trace", kind = event.kind(), "{json}"),
            _ => info!(target: "trace", kind = event.kind(), "{json}"),
        },
        Err(e) => warn!(kind = event.kind(), error = %e, "Trace event not serializable"),
    }
}
