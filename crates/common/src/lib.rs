pub mod config;
pub mod error;
pub mod exchange;
pub mod trace;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use exchange::ExchangeClient;
pub use trace::{Discrepancy, TraceEvent};
pub use types::*;
