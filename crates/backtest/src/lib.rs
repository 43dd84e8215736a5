//! Bar replay against the simulated exchange, with performance metrics and
//! a reproducible decision trace.

mod data;
mod metrics;
mod runner;

pub use data::{load_csv, read_bars};
pub use metrics::{EquityPoint, Metrics};
pub use runner::{trace_digest, BacktestReport, Backtester};
