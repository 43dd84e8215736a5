use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{
    AccountState, CancelOutcome, Direction, Discrepancy, Error, ExchangeClient, FillEvent,
    Order, OrderIntent, OrderSide, OrderStatus, PortfolioState, Position, Rejection,
    RejectionReason, Result, SubmitOutcome, TraceEvent,
};

use crate::retry::RetryPolicy;

pub const STALE_NOT_FOUND: &str = "stale-not-found";

/// What `on_fill` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// This fill plus any buffered successors, in `fill_seq` order.
    Applied(usize),
    /// `(order_id, fill_seq)` was applied before. No-op.
    Duplicate,
    /// Arrived ahead of a missing predecessor; held until the gap closes.
    Buffered,
    /// Order unknown or already closed without this fill.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Single owner of the portfolio: orders, positions, cash and daily counters.
///
/// Every mutation goes through a method here, and every method appends what
/// it did to an in-memory journal that callers drain into the decision trace.
/// Nothing in here reads the wall clock; timestamps come from the intents,
/// fills and the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderManager {
    state: PortfolioState,
    id_prefix: String,
    next_seq: u64,
    /// Fills waiting for a missing predecessor, by order id then `fill_seq`.
    pending_fills: BTreeMap<String, BTreeMap<u64, FillEvent>>,
    /// Last price seen per symbol, used to value positions adopted from the exchange.
    last_prices: BTreeMap<String, Decimal>,
    #[serde(skip)]
    closed_orders: BTreeMap<String, Order>,
    #[serde(skip)]
    max_open_positions: Option<usize>,
    #[serde(skip)]
    journal: Vec<TraceEvent>,
}

impl OrderManager {
    pub fn new(cash: Decimal, trading_day: NaiveDate, id_prefix: impl Into<String>) -> Self {
        Self {
            state: PortfolioState::new(cash, trading_day),
            id_prefix: id_prefix.into(),
            next_seq: 1,
            pending_fills: BTreeMap::new(),
            last_prices: BTreeMap::new(),
            closed_orders: BTreeMap::new(),
            max_open_positions: None,
            journal: Vec::new(),
        }
    }

    /// Re-check the open-position cap at submission time. Risk evaluates
    /// symbols against snapshots, so two entries approved from the same
    /// snapshot are only serialized here.
    pub fn with_position_limit(mut self, max_open_positions: usize) -> Self {
        self.max_open_positions = Some(max_open_positions);
        self
    }

    pub fn state(&self) -> &PortfolioState {
        &self.state
    }

    pub fn snapshot(&self) -> PortfolioState {
        self.state.clone()
    }

    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    pub fn order(&self, id: &str) -> Option<&Order> {
        self.state
            .open_orders
            .get(id)
            .or_else(|| self.closed_orders.get(id))
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.state.open_orders.values().cloned().collect()
    }

    pub fn closed_orders(&self) -> impl Iterator<Item = &Order> {
        self.closed_orders.values()
    }

    /// Append externally produced events (signals, decisions) so the journal
    /// keeps one total order.
    pub fn record(&mut self, event: TraceEvent) {
        self.journal.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.journal)
    }

    // ── Submission ───────────────────────────────────────────────────────────

    /// Create a pending order for `intent` and forward it to the exchange.
    ///
    /// A venue refusal or an exhausted retry budget leaves the order
    /// `rejected` with the reason and still returns `Ok`. A fatal error also
    /// rejects the order, then propagates.
    pub async fn submit(
        &mut self,
        intent: OrderIntent,
        exchange: &dyn ExchangeClient,
        retry: &RetryPolicy,
    ) -> Result<Order> {
        let order = self.open_order(intent)?;
        self.send_order(&order.id, exchange, retry).await
    }

    /// Admit `intent` and record it as a `pending` order under the next
    /// client id. Nothing reaches the exchange yet: a caller that persists
    /// writes this state before [`OrderManager::send_order`], so a crash
    /// mid-submission leaves the order on record for `reconcile`.
    pub fn open_order(&mut self, intent: OrderIntent) -> Result<Order> {
        if !intent.risk_checks_passed {
            return Err(Error::Other(format!(
                "intent for {} did not pass risk checks",
                intent.symbol
            )));
        }
        if let Some(reason) = self.admission_check(&intent) {
            self.journal.push(TraceEvent::IntentRejected(Rejection {
                symbol: intent.symbol.clone(),
                timestamp: intent.timestamp,
                direction: direction_of(&intent),
                reason,
                source: intent.source.clone(),
            }));
            warn!(symbol = %intent.symbol, reason = %reason, "Intent refused at submission");
            return Err(Error::RiskRejected(reason));
        }

        let id = format!("{}-{:08}", self.id_prefix, self.next_seq);
        self.next_seq += 1;
        let order = Order::from_intent(id, &intent);
        self.state.open_orders.insert(order.id.clone(), order.clone());
        self.journal.push(TraceEvent::OrderUpdated(order.clone()));
        Ok(order)
    }

    /// Forward a pending order opened by [`OrderManager::open_order`].
    pub async fn send_order(
        &mut self,
        order_id: &str,
        exchange: &dyn ExchangeClient,
        retry: &RetryPolicy,
    ) -> Result<Order> {
        let order = self
            .state
            .open_orders
            .get(order_id)
            .filter(|o| o.status == OrderStatus::Pending && o.exchange_order_id.is_none())
            .cloned()
            .ok_or_else(|| Error::Other(format!("order {order_id} is not awaiting submission")))?;
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            reduce_only = order.reduce_only,
            "Submitting order"
        );

        let outbound = &order;
        let result = retry
            .run("submit_order", move || exchange.submit_order(outbound))
            .await;

        let at = order.created_at;
        match result {
            Ok(SubmitOutcome::Accepted { exchange_order_id }) => {
                if !order.reduce_only {
                    self.state.entries_today += 1;
                    self.state.last_entry_at = Some(at);
                }
                self.update_order(&order.id, at, |o| {
                    o.exchange_order_id = Some(exchange_order_id);
                })
            }
            Ok(SubmitOutcome::Rejected { reason }) => {
                warn!(order_id = %order.id, reason = %reason, "Order rejected by exchange");
                self.close_order(&order.id, OrderStatus::Rejected, reason, at)
            }
            Err(e) if e.is_fatal() => {
                self.close_order(&order.id, OrderStatus::Rejected, e.to_string(), at)?;
                Err(e)
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Order submission failed");
                self.close_order(&order.id, OrderStatus::Rejected, e.to_string(), at)
            }
        }
    }

    fn admission_check(&self, intent: &OrderIntent) -> Option<RejectionReason> {
        if intent.reduce_only {
            return None;
        }
        let exposed = self.state.exposed_symbols();
        if exposed.contains(intent.symbol.as_str()) {
            return Some(if self.state.has_open_order_for(&intent.symbol) {
                RejectionReason::OrderInFlight
            } else {
                RejectionReason::PositionAlreadyOpen
            });
        }
        match self.max_open_positions {
            Some(max) if exposed.len() >= max => Some(RejectionReason::MaxOpenPositions),
            _ => None,
        }
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// Ask the exchange to cancel an open order. The order only becomes
    /// `canceled` on a confirmed cancel; `NotFound` leaves it for `reconcile`.
    pub async fn cancel(
        &mut self,
        order_id: &str,
        exchange: &dyn ExchangeClient,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let order = self
            .state
            .open_orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| Error::Other(format!("order {order_id} is not open")))?;

        let outbound = &order;
        let outcome = retry
            .run("cancel_order", move || exchange.cancel_order(outbound))
            .await?;
        match outcome {
            CancelOutcome::Canceled => {
                info!(order_id = %order.id, "Order canceled");
                self.close_order(order_id, OrderStatus::Canceled, "canceled by request".into(), now)
            }
            CancelOutcome::NotFound => {
                warn!(order_id = %order.id, "Cancel target not found on exchange, leaving for reconcile");
                Ok(order)
            }
        }
    }

    // ── Fills ────────────────────────────────────────────────────────────────

    /// Apply a fill, idempotent by `(order_id, fill_seq)`.
    ///
    /// Fills are applied in `fill_seq` order only: a gap buffers the event
    /// until its predecessors arrive.
    pub fn on_fill(&mut self, fill: FillEvent) -> Result<FillOutcome> {
        let Some(order) = self.state.open_orders.get(&fill.order_id) else {
            if let Some(closed) = self.closed_orders.get(&fill.order_id) {
                if fill.fill_seq <= closed.last_fill_seq {
                    return Ok(FillOutcome::Duplicate);
                }
            }
            warn!(
                order_id = %fill.order_id,
                fill_seq = fill.fill_seq,
                "Fill for unknown or closed order ignored"
            );
            return Ok(FillOutcome::Ignored);
        };

        if fill.fill_seq <= order.last_fill_seq {
            return Ok(FillOutcome::Duplicate);
        }
        if fill.fill_seq > order.last_fill_seq + 1 {
            self.pending_fills
                .entry(fill.order_id.clone())
                .or_default()
                .entry(fill.fill_seq)
                .or_insert(fill);
            return Ok(FillOutcome::Buffered);
        }

        let order_id = fill.order_id.clone();
        self.apply_fill(fill)?;
        let mut applied = 1;

        while let Some(next) = self.state.open_orders.get(&order_id).map(|o| o.last_fill_seq + 1) {
            let Some(buffered) = self
                .pending_fills
                .get_mut(&order_id)
                .and_then(|b| b.remove(&next))
            else {
                break;
            };
            self.apply_fill(buffered)?;
            applied += 1;
        }

        let closed = !self.state.open_orders.contains_key(&order_id);
        if closed || self.pending_fills.get(&order_id).is_some_and(BTreeMap::is_empty) {
            self.pending_fills.remove(&order_id);
        }
        Ok(FillOutcome::Applied(applied))
    }

    fn apply_fill(&mut self, fill: FillEvent) -> Result<()> {
        if fill.quantity <= Decimal::ZERO || fill.price <= Decimal::ZERO {
            return Err(Error::StateInconsistency(format!(
                "fill {}#{} has non-positive quantity or price",
                fill.order_id, fill.fill_seq
            )));
        }
        let order = self
            .state
            .open_orders
            .get_mut(&fill.order_id)
            .ok_or_else(|| Error::StateInconsistency(format!("order {} vanished", fill.order_id)))?;

        let filled = order.filled_quantity + fill.quantity;
        if filled > order.quantity {
            return Err(Error::StateInconsistency(format!(
                "fill {}#{} overfills {} of {}",
                fill.order_id, fill.fill_seq, filled, order.quantity
            )));
        }
        order.avg_fill_price =
            (order.avg_fill_price * order.filled_quantity + fill.price * fill.quantity) / filled;
        order.filled_quantity = filled;
        order.last_fill_seq = fill.fill_seq;
        order.updated_at = fill.timestamp;
        if order.exchange_order_id.is_none() {
            order.exchange_order_id = fill.exchange_order_id.clone();
        }
        order.status = if filled == order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let order = order.clone();

        let (gross, closes_exposure) = self.apply_to_position(&order, &fill);
        let realized = gross - fill.fee;
        self.state.cash_balance -= order.side.sign() * fill.quantity * fill.price + fill.fee;
        self.state.realized_pnl_today += realized;
        self.last_prices.insert(order.symbol.clone(), fill.price);
        self.touch_peak();

        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            fill_seq = fill.fill_seq,
            quantity = %fill.quantity,
            price = %fill.price,
            realized_pnl = %realized,
            status = %order.status,
            "Fill applied"
        );
        self.journal.push(TraceEvent::FillApplied {
            fill,
            realized_pnl: realized,
            closes_exposure,
        });
        self.journal.push(TraceEvent::OrderUpdated(order.clone()));

        if order.is_terminal() {
            self.state.open_orders.remove(&order.id);
            self.closed_orders.insert(order.id.clone(), order);
        }
        Ok(())
    }

    /// Move the position by the fill. Returns the gross P&L realized on the
    /// closed portion and whether the fill traded against existing exposure.
    /// Averages only when adding in the same direction.
    fn apply_to_position(&mut self, order: &Order, fill: &FillEvent) -> (Decimal, bool) {
        let delta = order.side.sign() * fill.quantity;
        let Some(pos) = self.state.positions.get_mut(&order.symbol) else {
            let mut pos = Position {
                symbol: order.symbol.clone(),
                quantity: delta,
                avg_entry_price: fill.price,
                mark_price: fill.price,
                unrealized_pnl: Decimal::ZERO,
                stop_loss_price: order.stop_loss_price,
                take_profit_price: order.take_profit_price,
                opened_at: fill.timestamp,
            };
            pos.mark(fill.price);
            self.state.positions.insert(order.symbol.clone(), pos);
            return (Decimal::ZERO, false);
        };

        let old = pos.quantity;
        let same_direction = (old > Decimal::ZERO) == (delta > Decimal::ZERO);
        if same_direction {
            let new = old + delta;
            pos.avg_entry_price =
                (pos.avg_entry_price * old.abs() + fill.price * delta.abs()) / new.abs();
            pos.quantity = new;
            if order.stop_loss_price.is_some() {
                pos.stop_loss_price = order.stop_loss_price;
            }
            if order.take_profit_price.is_some() {
                pos.take_profit_price = order.take_profit_price;
            }
            pos.mark(fill.price);
            return (Decimal::ZERO, false);
        }

        let closed = old.abs().min(delta.abs());
        let old_sign = if old > Decimal::ZERO { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
        let realized = (fill.price - pos.avg_entry_price) * closed * old_sign;
        let new = old + delta;
        if new == Decimal::ZERO {
            self.state.positions.remove(&order.symbol);
        } else if (new > Decimal::ZERO) == (old > Decimal::ZERO) {
            pos.quantity = new;
            pos.mark(fill.price);
        } else {
            pos.quantity = new;
            pos.avg_entry_price = fill.price;
            pos.opened_at = fill.timestamp;
            pos.stop_loss_price = order.stop_loss_price;
            pos.take_profit_price = order.take_profit_price;
            pos.mark(fill.price);
        }
        (realized, true)
    }

    // ── Marking & day boundaries ─────────────────────────────────────────────

    /// Revalue `symbol` at `price` and lift the equity peak if needed.
    pub fn mark(&mut self, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        self.last_prices.insert(symbol.to_string(), price);
        if let Some(pos) = self.state.positions.get_mut(symbol) {
            pos.mark(price);
        }
        self.touch_peak();
    }

    fn touch_peak(&mut self) {
        let equity = self.state.equity();
        if equity > self.state.peak_equity {
            self.state.peak_equity = equity;
        }
    }

    /// Reset the daily counters when `now` falls on a later local date than
    /// the current trading day. Returns whether a roll happened.
    pub fn roll_day(&mut self, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        let day = now.with_timezone(&offset).date_naive();
        if day <= self.state.trading_day {
            return false;
        }
        self.state.trading_day = day;
        self.state.day_start_equity = self.state.equity();
        self.state.realized_pnl_today = Decimal::ZERO;
        self.state.entries_today = 0;
        info!(
            trading_day = %day,
            day_start_equity = %self.state.day_start_equity,
            "Trading day rolled"
        );
        self.journal.push(TraceEvent::DayRolled {
            trading_day: day,
            day_start_equity: self.state.day_start_equity,
        });
        true
    }

    // ── Reconciliation ───────────────────────────────────────────────────────

    /// Align local state with the exchange, which is the source of truth.
    ///
    /// Local open orders the exchange does not list become `canceled`
    /// (`stale-not-found`); positions and cash are overwritten with the
    /// remote values. Every correction is logged and reported.
    pub fn reconcile(&mut self, account: &AccountState, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let remote_ids: BTreeSet<&str> = account
            .open_orders
            .iter()
            .map(|o| o.client_order_id.as_str())
            .collect();
        let stale: Vec<(String, String)> = self
            .state
            .open_orders
            .values()
            .filter(|o| !remote_ids.contains(o.id.as_str()))
            .map(|o| (o.id.clone(), o.symbol.clone()))
            .collect();
        for (order_id, symbol) in stale {
            let closed = self.close_order(&order_id, OrderStatus::Canceled, STALE_NOT_FOUND.into(), now);
            debug_assert!(closed.is_ok(), "stale order {order_id} was not open");
            self.pending_fills.remove(&order_id);
            report
                .discrepancies
                .push(Discrepancy::StaleOrder { order_id, symbol });
        }

        for remote in &account.open_orders {
            if !self.state.open_orders.contains_key(&remote.client_order_id) {
                report.discrepancies.push(Discrepancy::UnknownRemoteOrder {
                    client_order_id: remote.client_order_id.clone(),
                    symbol: remote.symbol.clone(),
                });
            }
        }

        let symbols: BTreeSet<String> = self
            .state
            .positions
            .keys()
            .chain(account.positions.keys())
            .cloned()
            .collect();
        for symbol in symbols {
            let local = self
                .state
                .positions
                .get(&symbol)
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            let remote = account.positions.get(&symbol).copied().unwrap_or(Decimal::ZERO);
            if local == remote {
                continue;
            }
            self.correct_position(&symbol, remote, now);
            report.discrepancies.push(Discrepancy::Position {
                symbol,
                local,
                remote,
            });
        }

        if self.state.cash_balance != account.cash_balance {
            report.discrepancies.push(Discrepancy::Cash {
                local: self.state.cash_balance,
                remote: account.cash_balance,
            });
            self.state.cash_balance = account.cash_balance;
        }

        for d in &report.discrepancies {
            warn!(discrepancy = %d, "Reconciliation corrected local state");
            self.journal.push(TraceEvent::Discrepancy(d.clone()));
        }
        if report.is_clean() {
            info!("Reconciliation found no discrepancies");
        }
        report
    }

    fn correct_position(&mut self, symbol: &str, remote: Decimal, now: DateTime<Utc>) {
        if remote == Decimal::ZERO {
            self.state.positions.remove(symbol);
            return;
        }
        let price = self.last_prices.get(symbol).copied();
        match self.state.positions.get_mut(symbol) {
            Some(pos) => {
                pos.quantity = remote;
                let mark = pos.mark_price;
                pos.mark(mark);
            }
            None => {
                let price = price.unwrap_or(Decimal::ZERO);
                self.state.positions.insert(
                    symbol.to_string(),
                    Position {
                        symbol: symbol.to_string(),
                        quantity: remote,
                        avg_entry_price: price,
                        mark_price: price,
                        unrealized_pnl: Decimal::ZERO,
                        stop_loss_price: None,
                        take_profit_price: None,
                        opened_at: now,
                    },
                );
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn update_order<F>(&mut self, id: &str, at: DateTime<Utc>, f: F) -> Result<Order>
    where
        F: FnOnce(&mut Order),
    {
        let order = self
            .state
            .open_orders
            .get_mut(id)
            .ok_or_else(|| Error::Other(format!("order {id} is not open")))?;
        f(order);
        order.updated_at = at;
        let order = order.clone();
        self.journal.push(TraceEvent::OrderUpdated(order.clone()));
        Ok(order)
    }

    fn close_order(
        &mut self,
        id: &str,
        status: OrderStatus,
        reason: String,
        at: DateTime<Utc>,
    ) -> Result<Order> {
        let mut order = self
            .state
            .open_orders
            .remove(id)
            .ok_or_else(|| Error::Other(format!("order {id} is not open")))?;
        order.status = status;
        order.reason = Some(reason);
        order.updated_at = at;
        self.journal.push(TraceEvent::OrderUpdated(order.clone()));
        self.closed_orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }
}

fn direction_of(intent: &OrderIntent) -> Direction {
    match intent.side {
        OrderSide::Buy => Direction::Long,
        OrderSide::Sell => Direction::Short,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use common::{Bar, OrderType, RemoteOrder};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Scripted exchange: answers submits from a queue, records calls.
    #[derive(Default)]
    struct ScriptedExchange {
        submits: Mutex<Vec<Result<SubmitOutcome>>>,
        cancels: Mutex<Vec<CancelOutcome>>,
        submitted: Mutex<Vec<String>>,
    }

    impl ScriptedExchange {
        fn accepting() -> Self {
            Self::default()
        }

        fn answering(outcomes: Vec<Result<SubmitOutcome>>) -> Self {
            Self {
                submits: Mutex::new(outcomes),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        async fn fetch_bars(&self, _: &str, _: &str, _: usize) -> Result<Vec<Bar>> {
            Ok(Vec::new())
        }

        async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome> {
            self.submitted.lock().unwrap().push(order.id.clone());
            let mut queue = self.submits.lock().unwrap();
            if queue.is_empty() {
                Ok(SubmitOutcome::Accepted {
                    exchange_order_id: format!("x-{}", order.id),
                })
            } else {
                queue.remove(0)
            }
        }

        async fn cancel_order(&self, _: &Order) -> Result<CancelOutcome> {
            let mut queue = self.cancels.lock().unwrap();
            Ok(if queue.is_empty() {
                CancelOutcome::Canceled
            } else {
                queue.remove(0)
            })
        }

        async fn poll_fills(&self) -> Result<Vec<FillEvent>> {
            Ok(Vec::new())
        }

        async fn account_state(&self) -> Result<AccountState> {
            Ok(AccountState::default())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap()
    }

    fn manager() -> OrderManager {
        OrderManager::new(dec!(10000), t0().date_naive(), "bt")
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: std::time::Duration::from_millis(200),
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        }
    }

    fn intent(symbol: &str, side: OrderSide, qty: Decimal, reduce_only: bool) -> OrderIntent {
        OrderIntent {
            symbol: symbol.into(),
            timestamp: t0(),
            side,
            quantity: qty,
            order_type: OrderType::Market,
            limit_price: None,
            reference_price: dec!(100),
            stop_loss_price: (!reduce_only).then_some(dec!(98)),
            take_profit_price: (!reduce_only).then_some(dec!(105)),
            reduce_only,
            risk_checks_passed: true,
            source: "test".into(),
        }
    }

    fn fill(order_id: &str, seq: u64, qty: Decimal, price: Decimal) -> FillEvent {
        FillEvent {
            order_id: order_id.into(),
            exchange_order_id: None,
            fill_seq: seq,
            quantity: qty,
            price,
            fee: Decimal::ZERO,
            timestamp: t0() + Duration::hours(seq as i64),
        }
    }

    async fn submitted(om: &mut OrderManager, i: OrderIntent) -> Order {
        om.submit(i, &ScriptedExchange::accepting(), &policy())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submit_assigns_sequential_ids_and_stays_pending() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        let b = submitted(&mut om, intent("ETHUSDT", OrderSide::Buy, dec!(1), false)).await;
        assert_eq!(a.id, "bt-00000001");
        assert_eq!(b.id, "bt-00000002");
        assert_eq!(a.status, OrderStatus::Pending);
        assert_eq!(a.exchange_order_id.as_deref(), Some("x-bt-00000001"));
        assert_eq!(om.state().open_orders.len(), 2);
        assert_eq!(om.state().entries_today, 2);
        assert!(om.state().positions.is_empty());
    }

    #[tokio::test]
    async fn opened_order_is_recorded_before_it_is_sent() {
        let mut om = manager();
        let exchange = ScriptedExchange::accepting();
        let opened = om
            .open_order(intent("BTCUSDT", OrderSide::Buy, dec!(1), false))
            .unwrap();
        assert!(exchange.submitted.lock().unwrap().is_empty());
        assert_eq!(opened.status, OrderStatus::Pending);
        assert!(opened.exchange_order_id.is_none());
        assert_eq!(om.state().entries_today, 0);

        // the id counter already moved, so a restore never reissues it
        let json = serde_json::to_string(&om).unwrap();
        let mut restored: OrderManager = serde_json::from_str(&json).unwrap();
        let next = restored
            .open_order(intent("ETHUSDT", OrderSide::Buy, dec!(1), false))
            .unwrap();
        assert_eq!(next.id, "bt-00000002");

        let sent = om.send_order(&opened.id, &exchange, &policy()).await.unwrap();
        assert_eq!(sent.exchange_order_id.as_deref(), Some("x-bt-00000001"));
        assert_eq!(om.state().entries_today, 1);
        // an order is forwarded once
        assert!(om.send_order(&opened.id, &exchange, &policy()).await.is_err());
        assert_eq!(exchange.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn venue_rejection_transitions_to_rejected() {
        let mut om = manager();
        let exchange = ScriptedExchange::answering(vec![Ok(SubmitOutcome::Rejected {
            reason: "insufficient balance".into(),
        })]);
        let order = om
            .submit(intent("BTCUSDT", OrderSide::Buy, dec!(1), false), &exchange, &policy())
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.reason.as_deref(), Some("insufficient balance"));
        assert!(om.state().open_orders.is_empty());
        assert_eq!(om.state().entries_today, 0);
    }

    #[tokio::test]
    async fn exhausted_transient_errors_reject_without_propagating() {
        let mut om = manager();
        let exchange = ScriptedExchange::answering(vec![
            Err(Error::ExchangeTransient("503".into())),
            Err(Error::ExchangeTransient("503".into())),
        ]);
        let order = om
            .submit(intent("BTCUSDT", OrderSide::Buy, dec!(1), false), &exchange, &policy())
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(exchange.submitted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fatal_errors_propagate_after_rejecting() {
        let mut om = manager();
        let exchange =
            ScriptedExchange::answering(vec![Err(Error::Authentication("bad key".into()))]);
        let result = om
            .submit(intent("BTCUSDT", OrderSide::Buy, dec!(1), false), &exchange, &policy())
            .await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(
            om.order("bt-00000001").map(|o| o.status),
            Some(OrderStatus::Rejected)
        );
    }

    #[tokio::test]
    async fn submission_rechecks_exposure() {
        let mut om = manager().with_position_limit(1);
        submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        let again = om
            .submit(intent("BTCUSDT", OrderSide::Buy, dec!(1), false), &ScriptedExchange::accepting(), &policy())
            .await;
        assert!(matches!(again, Err(Error::RiskRejected(RejectionReason::OrderInFlight))));
        let other = om
            .submit(intent("ETHUSDT", OrderSide::Buy, dec!(1), false), &ScriptedExchange::accepting(), &policy())
            .await;
        assert!(matches!(other, Err(Error::RiskRejected(RejectionReason::MaxOpenPositions))));
        assert_eq!(om.state().open_orders.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_fill_is_applied_once() {
        let mut om = manager();
        let order = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(10), false)).await;

        assert_eq!(om.on_fill(fill(&order.id, 1, dec!(3), dec!(100))).unwrap(), FillOutcome::Applied(1));
        assert_eq!(om.on_fill(fill(&order.id, 1, dec!(3), dec!(100))).unwrap(), FillOutcome::Duplicate);

        let pos = &om.state().positions["BTCUSDT"];
        assert_eq!(pos.quantity, dec!(3));
        let open = &om.state().open_orders[&order.id];
        assert_eq!(open.status, OrderStatus::PartiallyFilled);
        assert_eq!(open.filled_quantity, dec!(3));
        assert_eq!(om.state().cash_balance, dec!(9700));
    }

    #[tokio::test]
    async fn out_of_order_fills_are_buffered() {
        let mut om = manager();
        let order = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(3), false)).await;

        assert_eq!(om.on_fill(fill(&order.id, 3, dec!(1), dec!(102))).unwrap(), FillOutcome::Buffered);
        assert_eq!(om.on_fill(fill(&order.id, 2, dec!(1), dec!(101))).unwrap(), FillOutcome::Buffered);
        assert!(om.state().positions.is_empty());

        assert_eq!(om.on_fill(fill(&order.id, 1, dec!(1), dec!(100))).unwrap(), FillOutcome::Applied(3));
        let closed = om.order(&order.id).unwrap();
        assert_eq!(closed.status, OrderStatus::Filled);
        assert_eq!(closed.avg_fill_price, dec!(101));
        assert_eq!(closed.last_fill_seq, 3);
        assert_eq!(om.state().positions["BTCUSDT"].avg_entry_price, dec!(101));

        let fill_seqs: Vec<u64> = om
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::FillApplied { fill, .. } => Some(fill.fill_seq),
                _ => None,
            })
            .collect();
        assert_eq!(fill_seqs, vec![1, 2, 3]);
        assert_eq!(om.on_fill(fill(&order.id, 2, dec!(1), dec!(101))).unwrap(), FillOutcome::Duplicate);
    }

    #[tokio::test]
    async fn overfill_is_a_state_inconsistency() {
        let mut om = manager();
        let order = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        assert!(matches!(
            om.on_fill(fill(&order.id, 1, dec!(2), dec!(100))),
            Err(Error::StateInconsistency(_))
        ));
        assert!(om.state().positions.is_empty());
    }

    #[tokio::test]
    async fn adding_averages_and_reducing_realizes() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(2), false)).await;
        om.on_fill(fill(&a.id, 1, dec!(2), dec!(100))).unwrap();

        let b = submitted(&mut om, intent("BTCUSDT", OrderSide::Sell, dec!(1), true)).await;
        om.on_fill(fill(&b.id, 1, dec!(1), dec!(110))).unwrap();

        let pos = &om.state().positions["BTCUSDT"];
        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(pos.avg_entry_price, dec!(100));
        assert_eq!(om.state().realized_pnl_today, dec!(10));
        // 10000 - 200 + 110
        assert_eq!(om.state().cash_balance, dec!(9910));
    }

    #[tokio::test]
    async fn weighted_average_on_increase() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(4), false)).await;
        om.on_fill(fill(&a.id, 1, dec!(1), dec!(100))).unwrap();
        om.on_fill(fill(&a.id, 2, dec!(3), dec!(104))).unwrap();
        let pos = &om.state().positions["BTCUSDT"];
        assert_eq!(pos.quantity, dec!(4));
        assert_eq!(pos.avg_entry_price, dec!(103));
        assert_eq!(om.state().realized_pnl_today, Decimal::ZERO);
    }

    #[tokio::test]
    async fn flipping_realizes_then_reopens_at_fill_price() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(2), false)).await;
        om.on_fill(fill(&a.id, 1, dec!(2), dec!(100))).unwrap();
        let b = submitted(&mut om, intent("BTCUSDT", OrderSide::Sell, dec!(5), true)).await;
        om.on_fill(fill(&b.id, 1, dec!(5), dec!(90))).unwrap();

        let pos = &om.state().positions["BTCUSDT"];
        assert_eq!(pos.quantity, dec!(-3));
        assert_eq!(pos.avg_entry_price, dec!(90));
        assert_eq!(pos.direction(), Direction::Short);
        assert_eq!(om.state().realized_pnl_today, dec!(-20));
    }

    #[tokio::test]
    async fn closing_removes_position_and_fees_reduce_pnl() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        let mut f = fill(&a.id, 1, dec!(1), dec!(100));
        f.fee = dec!(0.1);
        om.on_fill(f).unwrap();
        let b = submitted(&mut om, intent("BTCUSDT", OrderSide::Sell, dec!(1), true)).await;
        let mut f = fill(&b.id, 1, dec!(1), dec!(120));
        f.fee = dec!(0.12);
        om.on_fill(f).unwrap();

        assert!(om.state().positions.is_empty());
        assert_eq!(om.state().realized_pnl_today, dec!(19.78));
        assert_eq!(om.state().cash_balance, dec!(10019.78));
        assert_eq!(om.state().equity(), dec!(10019.78));
    }

    #[tokio::test]
    async fn confirmed_cancel_closes_but_not_found_does_not() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        let b = submitted(&mut om, intent("ETHUSDT", OrderSide::Buy, dec!(1), false)).await;

        let exchange = ScriptedExchange {
            cancels: Mutex::new(vec![CancelOutcome::Canceled, CancelOutcome::NotFound]),
            ..ScriptedExchange::default()
        };
        let canceled = om.cancel(&a.id, &exchange, &policy(), t0()).await.unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        let untouched = om.cancel(&b.id, &exchange, &policy(), t0()).await.unwrap();
        assert_eq!(untouched.status, OrderStatus::Pending);
        assert_eq!(om.state().open_orders.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_cancels_stale_orders_and_adopts_remote_positions() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        let b = submitted(&mut om, intent("ETHUSDT", OrderSide::Buy, dec!(2), false)).await;
        om.mark("SOLUSDT", dec!(20));
        om.drain_events();

        let mut account = AccountState {
            cash_balance: dec!(9500),
            ..AccountState::default()
        };
        account.open_orders.push(RemoteOrder {
            client_order_id: b.id.clone(),
            exchange_order_id: Some("x".into()),
            symbol: "ETHUSDT".into(),
            side: OrderSide::Buy,
            quantity: dec!(2),
            filled_quantity: Decimal::ZERO,
        });
        account.open_orders.push(RemoteOrder {
            client_order_id: "manual-1".into(),
            exchange_order_id: None,
            symbol: "BNBUSDT".into(),
            side: OrderSide::Sell,
            quantity: dec!(1),
            filled_quantity: Decimal::ZERO,
        });
        account.positions.insert("SOLUSDT".into(), dec!(5));

        let report = om.reconcile(&account, t0());
        assert_eq!(report.discrepancies.len(), 4);
        assert!(report.discrepancies.contains(&Discrepancy::StaleOrder {
            order_id: a.id.clone(),
            symbol: "BTCUSDT".into()
        }));

        let stale = om.order(&a.id).unwrap();
        assert_eq!(stale.status, OrderStatus::Canceled);
        assert_eq!(stale.reason.as_deref(), Some(STALE_NOT_FOUND));
        assert!(om.state().open_orders.contains_key(&b.id));

        let sol = &om.state().positions["SOLUSDT"];
        assert_eq!(sol.quantity, dec!(5));
        assert_eq!(sol.mark_price, dec!(20));
        assert_eq!(om.state().cash_balance, dec!(9500));

        let discrepancies = om
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, TraceEvent::Discrepancy(_)))
            .count();
        assert_eq!(discrepancies, 4);
    }

    #[tokio::test]
    async fn clean_reconcile_changes_nothing() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        om.on_fill(fill(&a.id, 1, dec!(1), dec!(100))).unwrap();
        let before = om.snapshot();

        let mut account = AccountState {
            cash_balance: before.cash_balance,
            ..AccountState::default()
        };
        account.positions.insert("BTCUSDT".into(), dec!(1));
        assert!(om.reconcile(&account, t0()).is_clean());
        assert_eq!(om.snapshot(), before);
    }

    #[test]
    fn day_rolls_once_per_local_date() {
        let mut om = manager();
        let utc = FixedOffset::east_opt(0).unwrap();
        assert!(!om.roll_day(t0() + Duration::hours(5), utc));
        assert!(om.roll_day(t0() + Duration::days(1), utc));
        assert!(!om.roll_day(t0() + Duration::days(1) + Duration::hours(1), utc));
        assert_eq!(om.state().trading_day, NaiveDate::from_ymd_opt(2024, 2, 2).unwrap());

        // 23:00 UTC is already the next day at UTC+2
        let mut om = manager();
        let cet = FixedOffset::east_opt(2 * 3600).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 1, 23, 0, 0).unwrap();
        assert!(om.roll_day(late, cet));
    }

    #[tokio::test]
    async fn roll_resets_daily_counters() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(1), false)).await;
        om.on_fill(fill(&a.id, 1, dec!(1), dec!(100))).unwrap();
        let b = submitted(&mut om, intent("BTCUSDT", OrderSide::Sell, dec!(1), true)).await;
        om.on_fill(fill(&b.id, 1, dec!(1), dec!(90))).unwrap();
        assert_eq!(om.state().realized_pnl_today, dec!(-10));

        om.roll_day(t0() + Duration::days(1), FixedOffset::east_opt(0).unwrap());
        assert_eq!(om.state().realized_pnl_today, Decimal::ZERO);
        assert_eq!(om.state().entries_today, 0);
        assert_eq!(om.state().day_start_equity, dec!(9990));
    }

    #[tokio::test]
    async fn marking_tracks_peak_equity() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(10), false)).await;
        om.on_fill(fill(&a.id, 1, dec!(10), dec!(100))).unwrap();
        om.mark("BTCUSDT", dec!(110));
        assert_eq!(om.state().peak_equity, dec!(10100));
        om.mark("BTCUSDT", dec!(95));
        assert_eq!(om.state().peak_equity, dec!(10100));
        assert_eq!(om.state().equity(), dec!(9950));
        assert_eq!(om.state().positions["BTCUSDT"].unrealized_pnl, dec!(-50));
    }

    #[tokio::test]
    async fn state_round_trips_through_json() {
        let mut om = manager();
        let a = submitted(&mut om, intent("BTCUSDT", OrderSide::Buy, dec!(3), false)).await;
        om.on_fill(fill(&a.id, 2, dec!(1), dec!(100))).unwrap();

        let json = serde_json::to_string(&om).unwrap();
        let mut restored: OrderManager = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.snapshot(), om.snapshot());
        assert_eq!(restored.on_fill(fill(&a.id, 1, dec!(1), dec!(100))).unwrap(), FillOutcome::Applied(2));
        let next = submitted(&mut restored, intent("ETHUSDT", OrderSide::Buy, dec!(1), false)).await;
        assert_eq!(next.id, "bt-00000002");
    }
}
