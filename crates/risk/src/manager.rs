use chrono::Duration;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::{
    Bar, Direction, Error, ExitTrigger, OrderIntent, OrderSide, OrderType, PortfolioState,
    Position, Rejection, RejectionReason, Result, Signal,
};

/// User-configurable risk parameters, the `[risk]` table of the trading config.
///
/// Fractions are of equity (`0.10` = 10%). A zero disables the optional
/// controls (`max_drawdown`, `max_trades_per_day`, `min_trade_interval_minutes`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Largest notional of a single entry as a fraction of equity.
    pub max_position_size: Decimal,
    /// Realized loss for the day, as a fraction of day-start equity, that stops new entries.
    pub max_daily_loss: Decimal,
    /// Decline from peak equity that stops new entries.
    pub max_drawdown: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub max_open_positions: usize,
    pub max_trades_per_day: u32,
    pub min_trade_interval_minutes: u32,
    pub allow_shorting: bool,
    pub attach_protective_prices: bool,
    /// Decimal places kept when sizing; the rest is truncated.
    pub quantity_precision: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::new(10, 2),
            max_daily_loss: Decimal::new(5, 2),
            max_drawdown: Decimal::new(15, 2),
            stop_loss_pct: Decimal::new(2, 2),
            take_profit_pct: Decimal::new(5, 2),
            max_open_positions: 5,
            max_trades_per_day: 10,
            min_trade_interval_minutes: 30,
            allow_shorting: false,
            attach_protective_prices: true,
            quantity_precision: 8,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let fraction = |name: &str, v: Decimal, allow_zero: bool| {
            let low_ok = if allow_zero { v >= Decimal::ZERO } else { v > Decimal::ZERO };
            if low_ok && v <= Decimal::ONE {
                Ok(())
            } else {
                Err(Error::Config(format!("risk.{name} must be a fraction in (0, 1], got {v}")))
            }
        };
        fraction("max_position_size", self.max_position_size, false)?;
        fraction("max_daily_loss", self.max_daily_loss, false)?;
        fraction("max_drawdown", self.max_drawdown, true)?;
        fraction("stop_loss_pct", self.stop_loss_pct, false)?;
        if self.take_profit_pct <= Decimal::ZERO {
            return Err(Error::Config("risk.take_profit_pct must be positive".into()));
        }
        if self.max_open_positions == 0 {
            return Err(Error::Config("risk.max_open_positions must be at least 1".into()));
        }
        if self.quantity_precision > 18 {
            return Err(Error::Config("risk.quantity_precision must be at most 18".into()));
        }
        Ok(())
    }
}

/// Convert a bar price into a positive `Decimal`, or `None` if it is not one.
pub fn price_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Decimal::try_from(value).ok().filter(|d| *d > Decimal::ZERO)
}

/// The gatekeeper between the strategy layer and the Order Manager.
///
/// Purely advisory: it reads a portfolio snapshot and never mutates it. Every
/// order intent reaching the Order Manager was produced here.
#[derive(Debug, Clone, Default)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Turn a signal into an order intent or a rejection.
    ///
    /// A signal against an open position closes it and skips every entry
    /// check. Entries run the checks in a fixed order and the first failure
    /// names the rejection.
    pub fn evaluate(
        &self,
        signal: &Signal,
        snapshot: &PortfolioState,
        price: Decimal,
    ) -> std::result::Result<OrderIntent, Rejection> {
        let Some(side) = OrderSide::opening(signal.direction) else {
            return Err(self.reject(signal, RejectionReason::NoDirection));
        };
        if price <= Decimal::ZERO {
            return Err(self.reject(signal, RejectionReason::InvalidPrice));
        }

        if let Some(position) = snapshot.positions.get(&signal.symbol) {
            if position.direction() == signal.direction.opposite() {
                if snapshot.has_open_order_for(&signal.symbol) {
                    return Err(self.reject(signal, RejectionReason::OrderInFlight));
                }
                let intent = exit_intent(position, signal.timestamp, price, &signal.source);
                info!(
                    symbol = %intent.symbol,
                    side = %intent.side,
                    quantity = %intent.quantity,
                    "Exit approved by RiskManager"
                );
                return Ok(intent);
            }
        }

        self.check_entry(signal, snapshot)
            .map_err(|reason| self.reject(signal, reason))?;

        let quantity = self
            .size(snapshot, price)
            .ok_or_else(|| self.reject(signal, RejectionReason::ZeroQuantity))?;

        let (stop_loss_price, take_profit_price) = if self.config.attach_protective_prices {
            let (sl, tp) = self.protective_prices(signal.direction, price);
            (Some(sl), Some(tp))
        } else {
            (None, None)
        };

        let intent = OrderIntent {
            symbol: signal.symbol.clone(),
            timestamp: signal.timestamp,
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            reference_price: price,
            stop_loss_price,
            take_profit_price,
            reduce_only: false,
            risk_checks_passed: true,
            source: signal.source.clone(),
        };
        info!(
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = %intent.quantity,
            notional = %(intent.quantity * price),
            "Entry approved by RiskManager"
        );
        Ok(intent)
    }

    /// Exit intent for `position` if `bar` touched one of its protective prices.
    /// Stop-loss wins when the bar spans both.
    pub fn protective_exit(
        &self,
        position: &Position,
        bar: &Bar,
    ) -> Option<(ExitTrigger, OrderIntent)> {
        let low = price_from_f64(bar.low)?;
        let high = price_from_f64(bar.high)?;
        let sl = position.stop_loss_price;
        let tp = position.take_profit_price;

        let (stop_hit, target_hit) = match position.direction() {
            Direction::Long => (sl.is_some_and(|p| low <= p), tp.is_some_and(|p| high >= p)),
            Direction::Short => (sl.is_some_and(|p| high >= p), tp.is_some_and(|p| low <= p)),
            Direction::Flat => return None,
        };
        let (trigger, price, source) = if stop_hit {
            (ExitTrigger::StopLoss, sl?, "stop_loss")
        } else if target_hit {
            (ExitTrigger::TakeProfit, tp?, "take_profit")
        } else {
            return None;
        };

        info!(
            symbol = %position.symbol,
            trigger = source,
            price = %price,
            "Protective exit triggered"
        );
        Some((trigger, exit_intent(position, bar.timestamp, price, source)))
    }

    /// Close `position` in full at market. Exits are never blocked.
    pub fn liquidation(
        &self,
        position: &Position,
        timestamp: chrono::DateTime<chrono::Utc>,
        price: Decimal,
    ) -> OrderIntent {
        exit_intent(position, timestamp, price, "liquidation")
    }

    fn check_entry(
        &self,
        signal: &Signal,
        snapshot: &PortfolioState,
    ) -> std::result::Result<(), RejectionReason> {
        let cfg = &self.config;

        if let Some(fraction) = snapshot.daily_pnl_fraction() {
            if fraction <= -cfg.max_daily_loss {
                return Err(RejectionReason::DailyLossLimit);
            }
        }
        if cfg.max_drawdown > Decimal::ZERO && snapshot.drawdown() >= cfg.max_drawdown {
            return Err(RejectionReason::DrawdownHalt);
        }
        if cfg.max_trades_per_day > 0 && snapshot.entries_today >= cfg.max_trades_per_day {
            return Err(RejectionReason::TradeLimitReached);
        }
        if cfg.min_trade_interval_minutes > 0 {
            if let Some(last) = snapshot.last_entry_at {
                let interval = Duration::minutes(i64::from(cfg.min_trade_interval_minutes));
                if signal.timestamp - last < interval {
                    return Err(RejectionReason::TradeIntervalTooShort);
                }
            }
        }
        if snapshot.positions.contains_key(&signal.symbol) {
            return Err(RejectionReason::PositionAlreadyOpen);
        }
        if snapshot.has_open_order_for(&signal.symbol) {
            return Err(RejectionReason::OrderInFlight);
        }
        if snapshot.exposed_symbols().len() >= cfg.max_open_positions {
            return Err(RejectionReason::MaxOpenPositions);
        }
        if signal.direction == Direction::Short && !cfg.allow_shorting {
            return Err(RejectionReason::ShortingDisabled);
        }
        Ok(())
    }

    /// `min(max_position_size * equity, cash) / price`, truncated to the
    /// configured precision. `None` when nothing is left after truncation.
    fn size(&self, snapshot: &PortfolioState, price: Decimal) -> Option<Decimal> {
        let cap = self.config.max_position_size * snapshot.equity();
        let budget = cap.min(snapshot.cash_balance.max(Decimal::ZERO));
        if budget <= Decimal::ZERO {
            return None;
        }
        let quantity = budget
            .checked_div(price)?
            .round_dp_with_strategy(self.config.quantity_precision, RoundingStrategy::ToZero);
        (quantity > Decimal::ZERO).then_some(quantity)
    }

    fn protective_prices(&self, direction: Direction, entry: Decimal) -> (Decimal, Decimal) {
        let sl = self.config.stop_loss_pct;
        let tp = self.config.take_profit_pct;
        match direction {
            Direction::Short => (entry * (Decimal::ONE + sl), entry * (Decimal::ONE - tp)),
            _ => (entry * (Decimal::ONE - sl), entry * (Decimal::ONE + tp)),
        }
    }

    fn reject(&self, signal: &Signal, reason: RejectionReason) -> Rejection {
        debug!(
            symbol = %signal.symbol,
            direction = %signal.direction,
            reason = %reason,
            "Signal rejected by RiskManager"
        );
        Rejection {
            symbol: signal.symbol.clone(),
            timestamp: signal.timestamp,
            direction: signal.direction,
            reason,
            source: signal.source.clone(),
        }
    }
}

fn exit_intent(
    position: &Position,
    timestamp: chrono::DateTime<chrono::Utc>,
    price: Decimal,
    source: &str,
) -> OrderIntent {
    let side = if position.quantity > Decimal::ZERO {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };
    OrderIntent {
        symbol: position.symbol.clone(),
        timestamp,
        side,
        quantity: position.quantity.abs(),
        order_type: OrderType::Market,
        limit_price: None,
        reference_price: price,
        stop_loss_price: None,
        take_profit_price: None,
        reduce_only: true,
        risk_checks_passed: true,
        source: source.to_string(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
