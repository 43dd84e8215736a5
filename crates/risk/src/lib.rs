mod manager;

pub use manager::{price_from_f64, RiskConfig, RiskManager};
