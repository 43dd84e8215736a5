use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use common::{
    AccountState, Bar, CancelOutcome, Error, ExchangeClient, FillEvent, Order, OrderSide,
    OrderType, PortfolioState, RemoteOrder, Result, SubmitOutcome,
};

pub const INSUFFICIENT_BALANCE: &str = "insufficient balance";

/// Execution costs of the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationCosts {
    /// Applied against the trader on market fills: buys pay more, sells receive less.
    pub slippage_bps: Decimal,
    /// Fraction of notional charged per fill.
    pub fee_rate: Decimal,
}

impl Default for SimulationCosts {
    fn default() -> Self {
        Self {
            slippage_bps: Decimal::ZERO,
            fee_rate: Decimal::ZERO,
        }
    }
}

/// Simulated exchange for backtests and paper trading.
///
/// Orders never fill on the bar they were decided on: a market order fills
/// at the open of the next bar for its symbol, a limit order at the first
/// later bar whose range trades through the limit. Nothing here reads the
/// wall clock, so equal bar sequences give equal fills.
pub struct SimulatedExchange {
    costs: SimulationCosts,
    /// Source of bars in live paper mode. `None` in backtests, where bars are
    /// pushed through [`SimulatedExchange::on_bar`].
    market: Option<Arc<dyn ExchangeClient>>,
    book: Mutex<Book>,
}

#[derive(Debug, Clone, Copy)]
enum Fill {
    NextOpen,
    AtClose,
}

#[derive(Debug, Default)]
struct Book {
    cash: Decimal,
    holdings: BTreeMap<String, Decimal>,
    /// Resting orders by local id; ids sort in submission order.
    resting: BTreeMap<String, Order>,
    unreported: Vec<FillEvent>,
    last_bar: BTreeMap<String, Bar>,
    next_exchange_id: u64,
}

impl SimulatedExchange {
    pub fn new(initial_cash: Decimal, costs: SimulationCosts) -> Self {
        info!(
            cash = %initial_cash,
            slippage_bps = %costs.slippage_bps,
            fee_rate = %costs.fee_rate,
            "Simulated exchange initialized"
        );
        Self {
            costs,
            market: None,
            book: Mutex::new(Book {
                cash: initial_cash,
                next_exchange_id: 1,
                ..Book::default()
            }),
        }
    }

    /// Take bars from `market` and fill against them as they arrive.
    pub fn with_market_data(mut self, market: Arc<dyn ExchangeClient>) -> Self {
        self.market = Some(market);
        self
    }

    /// Feed one closed bar. Resting orders for its symbol placed before this
    /// bar are matched against it. A bar no newer than the last one seen for
    /// its symbol is ignored. Returns the number of fills produced.
    pub async fn on_bar(&self, bar: &Bar) -> usize {
        let mut book = self.book.lock().await;
        if book
            .last_bar
            .get(&bar.symbol)
            .is_some_and(|seen| seen.timestamp >= bar.timestamp)
        {
            return 0;
        }
        self.match_bar(&mut book, bar, Fill::NextOpen)
    }

    /// Fill resting orders for `bar.symbol` at its close, including ones
    /// placed on that bar. Ends a replay, when no next bar exists.
    pub async fn settle_at_close(&self, bar: &Bar) -> usize {
        let mut book = self.book.lock().await;
        self.match_bar(&mut book, bar, Fill::AtClose)
    }

    pub async fn cash(&self) -> Decimal {
        self.book.lock().await.cash
    }

    /// Continue a paper session from a restored portfolio: the book takes
    /// its cash and holdings.
    pub async fn restore_balances(&self, state: &PortfolioState) {
        let mut book = self.book.lock().await;
        book.cash = state.cash_balance;
        book.holdings = state
            .positions
            .iter()
            .map(|(symbol, p)| (symbol.clone(), p.quantity))
            .collect();
        info!(cash = %book.cash, holdings = book.holdings.len(), "Simulated balances restored");
    }

    fn match_bar(&self, book: &mut Book, bar: &Bar, mode: Fill) -> usize {
        let candidates: Vec<Order> = book
            .resting
            .values()
            .filter(|o| {
                o.symbol == bar.symbol
                    && match mode {
                        Fill::NextOpen => o.created_at < bar.timestamp,
                        Fill::AtClose => o.created_at <= bar.timestamp,
                    }
            })
            .cloned()
            .collect();

        let mut filled = 0;
        for order in candidates {
            let price = match mode {
                Fill::NextOpen => self.fill_price(&order, bar),
                Fill::AtClose => decimal(bar.close).map(|close| self.slipped(order.side, close)),
            };
            let Some(price) = price else {
                continue;
            };
            let quantity = order.remaining();
            let notional = quantity * price;
            let fee = notional * self.costs.fee_rate;
            match order.side {
                OrderSide::Buy => book.cash -= notional + fee,
                OrderSide::Sell => book.cash += notional - fee,
            }
            let holding = book.holdings.entry(order.symbol.clone()).or_default();
            *holding += order.side.sign() * quantity;
            if holding.is_zero() {
                book.holdings.remove(&order.symbol);
            }

            debug!(
                order_id = %order.id,
                symbol = %order.symbol,
                side = %order.side,
                %price,
                %quantity,
                %fee,
                "Simulated fill"
            );
            book.unreported.push(FillEvent {
                order_id: order.id.clone(),
                exchange_order_id: order.exchange_order_id.clone(),
                fill_seq: order.last_fill_seq + 1,
                quantity,
                price,
                fee,
                timestamp: bar.timestamp,
            });
            book.resting.remove(&order.id);
            filled += 1;
        }
        book.last_bar.insert(bar.symbol.clone(), bar.clone());
        filled
    }

    fn fill_price(&self, order: &Order, bar: &Bar) -> Option<Decimal> {
        let open = decimal(bar.open)?;
        match (order.order_type, order.limit_price) {
            (OrderType::Limit, Some(limit)) => match order.side {
                OrderSide::Buy if decimal(bar.low)? <= limit => Some(open.min(limit)),
                OrderSide::Sell if decimal(bar.high)? >= limit => Some(open.max(limit)),
                _ => None,
            },
            _ => Some(self.slipped(order.side, open)),
        }
    }

    fn slipped(&self, side: OrderSide, price: Decimal) -> Decimal {
        let slip = self.costs.slippage_bps / Decimal::from(10_000);
        match side {
            OrderSide::Buy => price * (Decimal::ONE + slip),
            OrderSide::Sell => price * (Decimal::ONE - slip),
        }
    }

    /// What a buy would cost at the last known price, fees and slippage included.
    fn estimated_cost(&self, book: &Book, order: &Order) -> Option<Decimal> {
        let reference = match (order.order_type, order.limit_price) {
            (OrderType::Limit, Some(limit)) => limit,
            _ => {
                let close = decimal(book.last_bar.get(&order.symbol)?.close)?;
                self.slipped(OrderSide::Buy, close)
            }
        };
        let notional = order.quantity * reference;
        Some(notional + notional * self.costs.fee_rate)
    }
}

fn decimal(value: f64) -> Option<Decimal> {
    Decimal::try_from(value).ok().filter(|d| *d > Decimal::ZERO)
}

#[async_trait]
impl ExchangeClient for SimulatedExchange {
    /// Bars from the market-data source. Nothing fills until the caller
    /// advances through them, one bar at a time, the way a replay does.
    async fn fetch_bars(&self, symbol: &str, interval: &str, lookback: usize) -> Result<Vec<Bar>> {
        let market = self
            .market
            .as_ref()
            .ok_or_else(|| Error::Other("simulated exchange has no market data source".into()))?;
        market.fetch_bars(symbol, interval, lookback).await
    }

    async fn advance(&self, bar: &Bar) -> Result<()> {
        self.on_bar(bar).await;
        Ok(())
    }

    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome> {
        if order.quantity <= Decimal::ZERO {
            return Ok(SubmitOutcome::Rejected {
                reason: format!("invalid quantity {}", order.quantity),
            });
        }
        let mut book = self.book.lock().await;
        // exits are never refused for cash
        if order.side == OrderSide::Buy && !order.reduce_only {
            let Some(cost) = self.estimated_cost(&book, order) else {
                return Ok(SubmitOutcome::Rejected {
                    reason: format!("no market price for {}", order.symbol),
                });
            };
            if cost > book.cash {
                debug!(order_id = %order.id, %cost, cash = %book.cash, "Simulated order unaffordable");
                return Ok(SubmitOutcome::Rejected {
                    reason: INSUFFICIENT_BALANCE.into(),
                });
            }
        }

        let exchange_order_id = format!("sim-{}", book.next_exchange_id);
        book.next_exchange_id += 1;
        let mut resting = order.clone();
        resting.exchange_order_id = Some(exchange_order_id.clone());
        book.resting.insert(order.id.clone(), resting);
        Ok(SubmitOutcome::Accepted { exchange_order_id })
    }

    async fn cancel_order(&self, order: &Order) -> Result<CancelOutcome> {
        let mut book = self.book.lock().await;
        Ok(match book.resting.remove(&order.id) {
            Some(_) => CancelOutcome::Canceled,
            None => CancelOutcome::NotFound,
        })
    }

    async fn poll_fills(&self) -> Result<Vec<FillEvent>> {
        Ok(std::mem::take(&mut self.book.lock().await.unreported))
    }

    async fn account_state(&self) -> Result<AccountState> {
        let book = self.book.lock().await;
        Ok(AccountState {
            cash_balance: book.cash,
            positions: book.holdings.clone(),
            open_orders: book
                .resting
                .values()
                .map(|o| RemoteOrder {
                    client_order_id: o.id.clone(),
                    exchange_order_id: o.exchange_order_id.clone(),
                    symbol: o.symbol.clone(),
                    side: o.side,
                    quantity: o.quantity,
                    filled_quantity: o.filled_quantity,
                })
                .collect(),
        })
    }

    /// Orders still open in a restored portfolio rest again.
    async fn resume_tracking(&self, orders: &[Order]) -> Result<()> {
        let mut book = self.book.lock().await;
        for order in orders {
            book.resting
                .entry(order.id.clone())
                .or_insert_with(|| order.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use common::OrderIntent;
    use rust_decimal_macros::dec;

    fn t(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn bar(symbol: &str, hour: i64, open: f64, low: f64, high: f64, close: f64) -> Bar {
        Bar {
            symbol: symbol.into(),
            timestamp: t(hour),
            open,
            high,
            low,
            close,
            volume: 10.0,
        }
    }

    fn order(id: &str, side: OrderSide, quantity: Decimal, at: i64) -> Order {
        let intent = OrderIntent {
            symbol: "BTCUSDT".into(),
            timestamp: t(at),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            reference_price: dec!(1000),
            stop_loss_price: None,
            take_profit_price: None,
            reduce_only: false,
            risk_checks_passed: true,
            source: "test".into(),
        };
        Order::from_intent(id, &intent)
    }

    fn limit(id: &str, side: OrderSide, price: Decimal, at: i64) -> Order {
        let mut o = order(id, side, dec!(1), at);
        o.order_type = OrderType::Limit;
        o.limit_price = Some(price);
        o
    }

    async fn exchange(slippage_bps: Decimal, fee_rate: Decimal) -> SimulatedExchange {
        let sim = SimulatedExchange::new(
            dec!(10000),
            SimulationCosts {
                slippage_bps,
                fee_rate,
            },
        );
        sim.on_bar(&bar("BTCUSDT", 0, 1000.0, 990.0, 1010.0, 1000.0)).await;
        sim
    }

    #[tokio::test]
    async fn buy_fill_applies_positive_slippage() {
        let sim = exchange(dec!(10), Decimal::ZERO).await;
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(1), 0)).await.unwrap();
        sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1005.0)).await;

        let fills = sim.poll_fills().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(1001));
        assert_eq!(fills[0].fill_seq, 1);
        assert_eq!(fills[0].timestamp, t(1));
    }

    #[tokio::test]
    async fn sell_fill_applies_negative_slippage() {
        let sim = exchange(dec!(10), Decimal::ZERO).await;
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(1), 0)).await.unwrap();
        sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1000.0)).await;
        sim.submit_order(&order("o2", OrderSide::Sell, dec!(1), 1)).await.unwrap();
        sim.on_bar(&bar("BTCUSDT", 2, 1000.0, 990.0, 1010.0, 1000.0)).await;

        let fills = sim.poll_fills().await.unwrap();
        assert_eq!(fills[1].price, dec!(999));
        assert_eq!(sim.cash().await, dec!(9998));
    }

    #[tokio::test]
    async fn never_fills_on_the_decision_bar() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(1), 1)).await.unwrap();
        // same timestamp as the decision
        assert_eq!(sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1000.0)).await, 0);
        // other symbol
        assert_eq!(sim.on_bar(&bar("ETHUSDT", 2, 50.0, 49.0, 51.0, 50.0)).await, 0);
        assert_eq!(sim.on_bar(&bar("BTCUSDT", 2, 1020.0, 990.0, 1030.0, 1000.0)).await, 1);
        assert_eq!(sim.poll_fills().await.unwrap()[0].price, dec!(1020));
    }

    #[tokio::test]
    async fn position_recorded_after_buy_and_removed_after_sell() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(2), 0)).await.unwrap();
        sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1000.0)).await;
        let account = sim.account_state().await.unwrap();
        assert_eq!(account.positions["BTCUSDT"], dec!(2));
        assert_eq!(account.cash_balance, dec!(8000));

        sim.submit_order(&order("o2", OrderSide::Sell, dec!(2), 1)).await.unwrap();
        sim.on_bar(&bar("BTCUSDT", 2, 1100.0, 990.0, 1110.0, 1000.0)).await;
        let account = sim.account_state().await.unwrap();
        assert!(account.positions.is_empty());
        assert_eq!(account.cash_balance, dec!(10200));
    }

    #[tokio::test]
    async fn fee_is_charged_on_notional() {
        let sim = exchange(Decimal::ZERO, dec!(0.001)).await;
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(1), 0)).await.unwrap();
        sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1000.0)).await;
        let fill = &sim.poll_fills().await.unwrap()[0];
        assert_eq!(fill.fee, dec!(1));
        assert_eq!(sim.cash().await, dec!(8999));
    }

    #[tokio::test]
    async fn unaffordable_buy_is_rejected() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        let outcome = sim
            .submit_order(&order("o1", OrderSide::Buy, dec!(11), 0))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected {
                reason: INSUFFICIENT_BALANCE.into()
            }
        );
        assert!(sim.account_state().await.unwrap().open_orders.is_empty());
    }

    #[tokio::test]
    async fn limit_orders_wait_for_price() {
        let sim = exchange(dec!(50), Decimal::ZERO).await;
        sim.submit_order(&limit("o1", OrderSide::Buy, dec!(950), 0)).await.unwrap();
        assert_eq!(sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 960.0, 1010.0, 1000.0)).await, 0);
        assert_eq!(sim.on_bar(&bar("BTCUSDT", 2, 990.0, 940.0, 1000.0, 945.0)).await, 1);
        // limit price, no slippage
        assert_eq!(sim.poll_fills().await.unwrap()[0].price, dec!(950));

        sim.submit_order(&limit("o2", OrderSide::Sell, dec!(1000), 2)).await.unwrap();
        // gaps up through the limit: fills at the better open
        sim.on_bar(&bar("BTCUSDT", 3, 1040.0, 1030.0, 1050.0, 1045.0)).await;
        assert_eq!(sim.poll_fills().await.unwrap()[0].price, dec!(1040));
    }

    #[tokio::test]
    async fn cancel_removes_resting_order() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        let o = limit("o1", OrderSide::Buy, dec!(500), 0);
        sim.submit_order(&o).await.unwrap();
        assert_eq!(sim.account_state().await.unwrap().open_orders.len(), 1);
        assert_eq!(sim.cancel_order(&o).await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(sim.cancel_order(&o).await.unwrap(), CancelOutcome::NotFound);
        assert_eq!(sim.on_bar(&bar("BTCUSDT", 1, 400.0, 390.0, 410.0, 400.0)).await, 0);
    }

    #[tokio::test]
    async fn settle_fills_at_close_of_the_same_bar() {
        let sim = exchange(dec!(10), Decimal::ZERO).await;
        sim.submit_order(&order("o1", OrderSide::Sell, dec!(1), 0)).await.unwrap();
        let last = bar("BTCUSDT", 0, 1000.0, 990.0, 1010.0, 1000.0);
        assert_eq!(sim.on_bar(&last).await, 0);
        assert_eq!(sim.settle_at_close(&last).await, 1);
        let fill = &sim.poll_fills().await.unwrap()[0];
        assert_eq!(fill.price, dec!(999));
        assert_eq!(fill.timestamp, t(0));
    }

    #[tokio::test]
    async fn fills_are_reported_once() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(1), 0)).await.unwrap();
        sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1000.0)).await;
        assert_eq!(sim.poll_fills().await.unwrap().len(), 1);
        assert!(sim.poll_fills().await.unwrap().is_empty());
    }

    /// Serves a growing bar series, like a live kline endpoint.
    struct Feed(Mutex<Vec<Bar>>);

    #[async_trait]
    impl ExchangeClient for Feed {
        async fn fetch_bars(&self, _: &str, _: &str, _: usize) -> Result<Vec<Bar>> {
            Ok(self.0.lock().await.clone())
        }
        async fn submit_order(&self, _: &Order) -> Result<SubmitOutcome> {
            unreachable!()
        }
        async fn cancel_order(&self, _: &Order) -> Result<CancelOutcome> {
            unreachable!()
        }
        async fn poll_fills(&self) -> Result<Vec<FillEvent>> {
            Ok(Vec::new())
        }
        async fn account_state(&self) -> Result<AccountState> {
            Ok(AccountState::default())
        }
    }

    #[tokio::test]
    async fn live_paper_fills_against_fetched_bars() {
        let feed = Arc::new(Feed(Mutex::new(vec![
            bar("BTCUSDT", 0, 900.0, 890.0, 910.0, 900.0),
            bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1000.0),
        ])));
        let sim = SimulatedExchange::new(dec!(10000), SimulationCosts::default())
            .with_market_data(feed.clone());

        for b in sim.fetch_bars("BTCUSDT", "1h", 10).await.unwrap() {
            sim.advance(&b).await.unwrap();
        }
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(1), 1)).await.unwrap();
        assert!(sim.poll_fills().await.unwrap().is_empty());

        feed.0.lock().await.push(bar("BTCUSDT", 2, 1010.0, 1000.0, 1020.0, 1015.0));
        feed.0.lock().await.push(bar("BTCUSDT", 3, 1100.0, 1090.0, 1110.0, 1105.0));
        let bars = sim.fetch_bars("BTCUSDT", "1h", 10).await.unwrap();
        assert_eq!(bars.len(), 4);
        // fetching alone fills nothing
        assert!(sim.poll_fills().await.unwrap().is_empty());

        for b in &bars {
            sim.advance(b).await.unwrap();
        }
        let fills = sim.poll_fills().await.unwrap();
        assert_eq!(fills.len(), 1);
        // the first bar after the order, not the newest one
        assert_eq!(fills[0].price, dec!(1010));
        assert_eq!(fills[0].timestamp, t(2));
    }

    #[tokio::test]
    async fn replayed_bar_is_not_matched_twice() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        sim.submit_order(&order("o1", OrderSide::Buy, dec!(1), 0)).await.unwrap();
        // bar 0 was already fed when the exchange was built
        assert_eq!(sim.on_bar(&bar("BTCUSDT", 0, 1000.0, 990.0, 1010.0, 1000.0)).await, 0);
        assert_eq!(sim.on_bar(&bar("BTCUSDT", 1, 1000.0, 990.0, 1010.0, 1000.0)).await, 1);
    }

    #[tokio::test]
    async fn reduce_only_buy_is_accepted_without_cash() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        let mut cover = order("o1", OrderSide::Buy, dec!(50), 0);
        cover.reduce_only = true;
        assert!(matches!(
            sim.submit_order(&cover).await.unwrap(),
            SubmitOutcome::Accepted { .. }
        ));
        // an entry of the same size is still refused
        assert!(matches!(
            sim.submit_order(&order("o2", OrderSide::Buy, dec!(50), 0)).await.unwrap(),
            SubmitOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn backtest_exchange_has_no_market_data() {
        let sim = exchange(Decimal::ZERO, Decimal::ZERO).await;
        assert!(sim.fetch_bars("BTCUSDT", "1h", 10).await.is_err());
    }

    #[tokio::test]
    async fn restored_session_keeps_balances_and_resting_orders() {
        let sim = SimulatedExchange::new(dec!(10000), SimulationCosts::default());
        let mut state = PortfolioState::new(dec!(4000), t(0).date_naive());
        state.positions.insert(
            "BTCUSDT".into(),
            common::Position {
                symbol: "BTCUSDT".into(),
                quantity: dec!(6),
                avg_entry_price: dec!(1000),
                mark_price: dec!(1000),
                unrealized_pnl: Decimal::ZERO,
                stop_loss_price: None,
                take_profit_price: None,
                opened_at: t(0),
            },
        );
        sim.restore_balances(&state).await;
        sim.resume_tracking(&[order("o9", OrderSide::Sell, dec!(6), 1)])
            .await
            .unwrap();

        let account = sim.account_state().await.unwrap();
        assert_eq!(account.cash_balance, dec!(4000));
        assert_eq!(account.positions["BTCUSDT"], dec!(6));
        assert_eq!(account.open_orders.len(), 1);

        sim.on_bar(&bar("BTCUSDT", 2, 1100.0, 1090.0, 1110.0, 1100.0)).await;
        assert_eq!(sim.poll_fills().await.unwrap().len(), 1);
        assert_eq!(sim.cash().await, dec!(10600));
        assert!(sim.account_state().await.unwrap().positions.is_empty());
    }
}
