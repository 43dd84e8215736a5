use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One closed OHLCV candle.
///
/// Bars are immutable once produced. Per symbol, a sequence of bars must be
/// strictly increasing in `timestamp`; gaps are fine, duplicates are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Open time of the candle.
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Direction recommended by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Flat => Direction::Flat,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
            Direction::Flat => write!(f, "flat"),
        }
    }
}

/// A strategy's recommendation for one symbol at one bar. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// Confidence in `[0, 1]`. Always 0 for flat signals.
    pub strength: f64,
    /// Name of the strategy (or aggregation policy) that produced it.
    pub source: String,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        direction: Direction,
        strength: f64,
        source: impl Into<String>,
    ) -> Self {
        let strength = match direction {
            Direction::Flat => 0.0,
            _ if strength.is_nan() => 0.0,
            _ => strength.clamp(0.0, 1.0),
        };
        Self {
            symbol: symbol.into(),
            timestamp,
            direction,
            strength,
            source: source.into(),
        }
    }

    pub fn flat(symbol: impl Into<String>, timestamp: DateTime<Utc>, source: impl Into<String>) -> Self {
        Self::new(symbol, timestamp, Direction::Flat, 0.0, source)
    }

    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::Flat
    }
}

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that opens exposure in `direction`.
    pub fn opening(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Long => Some(OrderSide::Buy),
            Direction::Short => Some(OrderSide::Sell),
            Direction::Flat => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells. Multiplied into quantities to get signed deltas.
    pub fn sign(self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// A risk-approved order request that has not been submitted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    /// Timestamp of the bar the decision was made on.
    pub timestamp: DateTime<Utc>,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    /// Close of the decision bar; the price sizing was computed against.
    pub reference_price: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Exit intents only ever shrink an existing position.
    pub reduce_only: bool,
    pub risk_checks_passed: bool,
    pub source: String,
}

/// Lifecycle status of an order.
///
/// `pending -> partially_filled* -> filled`, `pending -> canceled`,
/// `pending -> rejected`. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::PartiallyFilled => write!(f, "partially_filled"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Canceled => write!(f, "canceled"),
            OrderStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// An order known to the Order Manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Local id, also sent to the venue as the client order id.
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    /// Quantity-weighted average over applied fills. Zero until the first fill.
    pub avg_fill_price: Decimal,
    pub exchange_order_id: Option<String>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub reduce_only: bool,
    /// Why the order was rejected or canceled.
    pub reason: Option<String>,
    /// Highest `fill_seq` applied so far; fills start at 1.
    pub last_fill_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_intent(id: impl Into<String>, intent: &OrderIntent) -> Self {
        Self {
            id: id.into(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            quantity: intent.quantity,
            limit_price: intent.limit_price,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            exchange_order_id: None,
            stop_loss_price: intent.stop_loss_price,
            take_profit_price: intent.take_profit_price,
            reduce_only: intent.reduce_only,
            reason: None,
            last_fill_seq: 0,
            created_at: intent.timestamp,
            updated_at: intent.timestamp,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One execution reported by the exchange for an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Local order id.
    pub order_id: String,
    pub exchange_order_id: Option<String>,
    /// Per-order sequence number, contiguous from 1.
    pub fill_seq: u64,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Commission in quote currency.
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Net holding in one symbol. Positive quantity is long, negative is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    /// Last price the position was marked at.
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn direction(&self) -> Direction {
        if self.quantity > Decimal::ZERO {
            Direction::Long
        } else if self.quantity < Decimal::ZERO {
            Direction::Short
        } else {
            Direction::Flat
        }
    }

    pub fn market_value(&self) -> Decimal {
        self.quantity * self.mark_price
    }

    pub fn mark(&mut self, price: Decimal) {
        self.mark_price = price;
        self.unrealized_pnl = (price - self.avg_entry_price) * self.quantity;
    }
}

/// The single authoritative portfolio of a run. Owned by the Order Manager;
/// everyone else works on clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash_balance: Decimal,
    pub positions: BTreeMap<String, Position>,
    /// Non-terminal orders only.
    pub open_orders: BTreeMap<String, Order>,
    pub realized_pnl_today: Decimal,
    pub day_start_equity: Decimal,
    /// Exchange-local calendar day the daily counters belong to.
    pub trading_day: NaiveDate,
    pub peak_equity: Decimal,
    pub entries_today: u32,
    pub last_entry_at: Option<DateTime<Utc>>,
}

impl PortfolioState {
    pub fn new(cash_balance: Decimal, trading_day: NaiveDate) -> Self {
        Self {
            cash_balance,
            positions: BTreeMap::new(),
            open_orders: BTreeMap::new(),
            realized_pnl_today: Decimal::ZERO,
            day_start_equity: cash_balance,
            trading_day,
            peak_equity: cash_balance,
            entries_today: 0,
            last_entry_at: None,
        }
    }

    /// Cash plus the marked value of every position.
    pub fn equity(&self) -> Decimal {
        self.cash_balance
            + self
                .positions
                .values()
                .map(Position::market_value)
                .sum::<Decimal>()
    }

    pub fn has_open_order_for(&self, symbol: &str) -> bool {
        self.open_orders.values().any(|o| o.symbol == symbol)
    }

    /// Symbols holding a position or a non-terminal order.
    pub fn exposed_symbols(&self) -> BTreeSet<&str> {
        self.positions
            .keys()
            .map(String::as_str)
            .chain(self.open_orders.values().map(|o| o.symbol.as_str()))
            .collect()
    }

    /// `realized_pnl_today / day_start_equity`, or `None` before any equity exists.
    pub fn daily_pnl_fraction(&self) -> Option<Decimal> {
        if self.day_start_equity <= Decimal::ZERO {
            return None;
        }
        self.realized_pnl_today.checked_div(self.day_start_equity)
    }

    /// Fractional decline of current equity from its running peak.
    pub fn drawdown(&self) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let dd = (self.peak_equity - self.equity()) / self.peak_equity;
        dd.max(Decimal::ZERO)
    }
}

/// Why the Risk Manager declined a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoDirection,
    InvalidPrice,
    DailyLossLimit,
    DrawdownHalt,
    TradeLimitReached,
    TradeIntervalTooShort,
    PositionAlreadyOpen,
    OrderInFlight,
    MaxOpenPositions,
    ShortingDisabled,
    ZeroQuantity,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::NoDirection => write!(f, "signal has no direction"),
            RejectionReason::InvalidPrice => write!(f, "no valid reference price"),
            RejectionReason::DailyLossLimit => write!(f, "daily loss limit reached"),
            RejectionReason::DrawdownHalt => write!(f, "max drawdown halt active"),
            RejectionReason::TradeLimitReached => write!(f, "max trades per day reached"),
            RejectionReason::TradeIntervalTooShort => write!(f, "min trade interval not elapsed"),
            RejectionReason::PositionAlreadyOpen => write!(f, "position already open"),
            RejectionReason::OrderInFlight => write!(f, "order already in flight"),
            RejectionReason::MaxOpenPositions => write!(f, "max open positions reached"),
            RejectionReason::ShortingDisabled => write!(f, "shorting disabled"),
            RejectionReason::ZeroQuantity => write!(f, "sized quantity is zero"),
        }
    }
}

/// A signal the Risk Manager refused, with the first failing check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub reason: RejectionReason,
    pub source: String,
}

/// Which protective price closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

/// Exchange-side view used by reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub cash_balance: Decimal,
    /// Signed net quantity per symbol. Flat symbols are omitted.
    pub positions: BTreeMap<String, Decimal>,
    pub open_orders: Vec<RemoteOrder>,
}

/// An order the exchange still considers open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
}

/// Synchronous answer to an order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { exchange_order_id: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotFound,
}

/// Where orders go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
    Backtest,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Backtest => write!(f, "backtest"),
        }
    }
}

/// Current state of the trading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    Paused,
    Halted,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Halted => write!(f, "halted"),
        }
    }
}

/// Commands sent to the engine via the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Start,
    Stop,
    Pause,
    Resume,
}
