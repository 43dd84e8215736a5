use async_trait::async_trait;

use crate::{AccountState, Bar, CancelOutcome, FillEvent, Order, Result, SubmitOutcome};

/// Abstraction over the venue.
///
/// `BinanceClient` implements this for live trading.
/// `SimulatedExchange` implements it for paper trading and backtests.
///
/// Only the Order Manager submits or cancels through a `dyn ExchangeClient`;
/// the live loop uses it for market data and to step the venue bar by bar.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Most recent closed bars, oldest first, at most `lookback` of them.
    async fn fetch_bars(&self, symbol: &str, interval: &str, lookback: usize) -> Result<Vec<Bar>>;

    /// Forward a pending order. A venue refusal is `SubmitOutcome::Rejected`,
    /// not an error.
    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome>;

    async fn cancel_order(&self, order: &Order) -> Result<CancelOutcome>;

    /// Fill events observed since the previous call, in `fill_seq` order per order.
    async fn poll_fills(&self) -> Result<Vec<FillEvent>>;

    /// Authoritative cash, positions and open orders.
    async fn account_state(&self) -> Result<AccountState>;

    /// A closed bar is about to be evaluated. Simulated venues match resting
    /// orders against it here; real venues have nothing to do.
    async fn advance(&self, _bar: &Bar) -> Result<()> {
        Ok(())
    }

    /// Re-arm fill tracking for orders restored after a restart.
    async fn resume_tracking(&self, _orders: &[Order]) -> Result<()> {
        Ok(())
    }
}
