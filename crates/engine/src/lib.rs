pub mod binance;
pub mod config;
pub mod lifecycle;
pub mod order_manager;
pub mod pipeline;
pub mod retry;
pub mod service;
pub mod store;

pub use binance::BinanceClient;
pub use config::{interval_duration, BacktestSettings, ScheduleConfig, TradingConfig};
pub use lifecycle::{Engine, EngineHandle};
pub use order_manager::{FillOutcome, OrderManager, ReconcileReport, STALE_NOT_FOUND};
pub use pipeline::{DecisionPipeline, TickDecision};
pub use retry::RetryPolicy;
pub use service::{log_event, restore_manager, OrderManagerHandle, OrderManagerService};
pub use store::Store;
