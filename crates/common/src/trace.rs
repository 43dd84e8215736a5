use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{ExitTrigger, FillEvent, Order, OrderIntent, Rejection, Signal};

/// One entry of the decision trace.
///
/// Live runs log these and append them to the store; backtests collect them
/// in memory. Both produce the same sequence for the same bars and fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// Output of a single strategy.
    Signal(Signal),
    /// Aggregated decision for a symbol on a bar.
    Decision(Signal),
    IntentApproved(OrderIntent),
    IntentRejected(Rejection),
    ProtectiveExit {
        symbol: String,
        timestamp: DateTime<Utc>,
        trigger: ExitTrigger,
        price: Decimal,
    },
    OrderUpdated(Order),
    FillApplied {
        fill: FillEvent,
        /// P&L realized by the closing portion of the fill, net of fee.
        realized_pnl: Decimal,
        closes_exposure: bool,
    },
    DayRolled {
        trading_day: NaiveDate,
        day_start_equity: Decimal,
    },
    Discrepancy(Discrepancy),
}

impl TraceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::Signal(_) => "signal",
            TraceEvent::Decision(_) => "decision",
            TraceEvent::IntentApproved(_) => "intent_approved",
            TraceEvent::IntentRejected(_) => "intent_rejected",
            TraceEvent::ProtectiveExit { .. } => "protective_exit",
            TraceEvent::OrderUpdated(_) => "order_updated",
            TraceEvent::FillApplied { .. } => "fill_applied",
            TraceEvent::DayRolled { .. } => "day_rolled",
            TraceEvent::Discrepancy(_) => "discrepancy",
        }
    }

    /// Symbol the event concerns, if it concerns exactly one.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            TraceEvent::Signal(s) | TraceEvent::Decision(s) => Some(&s.symbol),
            TraceEvent::IntentApproved(i) => Some(&i.symbol),
            TraceEvent::IntentRejected(r) => Some(&r.symbol),
            TraceEvent::ProtectiveExit { symbol, .. } => Some(symbol),
            TraceEvent::OrderUpdated(o) => Some(&o.symbol),
            TraceEvent::FillApplied { .. } | TraceEvent::DayRolled { .. } => None,
            TraceEvent::Discrepancy(d) => match d {
                Discrepancy::StaleOrder { symbol, .. }
                | Discrepancy::UnknownRemoteOrder { symbol, .. }
                | Discrepancy::Position { symbol, .. } => Some(symbol),
                Discrepancy::Cash { .. } => None,
            },
        }
    }
}

/// A mismatch between local and exchange state found by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Local non-terminal order the exchange does not know.
    StaleOrder { order_id: String, symbol: String },
    /// Exchange open order with no local counterpart.
    UnknownRemoteOrder { client_order_id: String, symbol: String },
    Position {
        symbol: String,
        local: Decimal,
        remote: Decimal,
    },
    Cash { local: Decimal, remote: Decimal },
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discrepancy::StaleOrder { order_id, symbol } => {
                write!(f, "order {order_id} ({symbol}) not found on exchange")
            }
            Discrepancy::UnknownRemoteOrder {
                client_order_id,
                symbol,
            } => write!(f, "exchange order {client_order_id} ({symbol}) unknown locally"),
            Discrepancy::Position {
                symbol,
                local,
                remote,
            } => write!(f, "{symbol} position local={local} remote={remote}"),
            Discrepancy::Cash { local, remote } => {
                write!(f, "cash local={local} remote={remote}")
            }
        }
    }
}
