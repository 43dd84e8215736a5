use std::str::FromStr;

use rust_decimal::Decimal;

use crate::{Error, Result, TradingMode};

/// Process settings loaded from environment variables at startup.
///
/// Strategy, risk and schedule settings live in the TOML file named by
/// `trading_config_path`.
#[derive(Debug, Clone)]
pub struct Config {
    pub trading_mode: TradingMode,

    // Exchange credentials, only required in live mode
    pub binance_api_key: String,
    pub binance_secret: String,
    pub binance_base_url: String,

    // Exchange call policy
    pub exchange_timeout_secs: u64,
    pub exchange_max_retries: u32,

    // Simulation
    pub initial_cash: Decimal,
    pub paper_slippage_bps: Decimal,
    pub paper_fee_rate: Decimal,

    // Backtest input
    pub backtest_data_path: Option<String>,
    pub backtest_symbol: Option<String>,

    // Database
    pub database_url: String,

    // Trading config file path
    pub trading_config_path: String,
}

impl Config {
    /// Load from the process environment. Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let trading_mode = match required(&lookup, "TRADING_MODE")?.to_lowercase().as_str() {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            "backtest" => TradingMode::Backtest,
            other => {
                return Err(Error::Config(format!(
                    "TRADING_MODE must be 'live', 'paper' or 'backtest', got '{other}'"
                )))
            }
        };

        let (binance_api_key, binance_secret) = if trading_mode == TradingMode::Live {
            (
                required(&lookup, "BINANCE_API_KEY")?,
                required(&lookup, "BINANCE_SECRET")?,
            )
        } else {
            (
                lookup("BINANCE_API_KEY").unwrap_or_default(),
                lookup("BINANCE_SECRET").unwrap_or_default(),
            )
        };

        let backtest_data_path = lookup("BACKTEST_DATA_PATH");
        if trading_mode == TradingMode::Backtest && backtest_data_path.is_none() {
            return Err(Error::Config(
                "BACKTEST_DATA_PATH is required when TRADING_MODE=backtest".into(),
            ));
        }

        Ok(Config {
            trading_mode,
            binance_api_key,
            binance_secret,
            binance_base_url: lookup("BINANCE_BASE_URL")
                .unwrap_or_else(|| "https://api.binance.com".to_string()),
            exchange_timeout_secs: parsed(&lookup, "EXCHANGE_TIMEOUT_SECS", 10)?,
            exchange_max_retries: parsed(&lookup, "EXCHANGE_MAX_RETRIES", 3)?,
            initial_cash: parsed(&lookup, "INITIAL_CASH", Decimal::from(10_000))?,
            paper_slippage_bps: parsed(&lookup, "PAPER_SLIPPAGE_BPS", Decimal::from(5))?,
            paper_fee_rate: parsed(&lookup, "PAPER_FEE_RATE", Decimal::new(1, 3))?,
            backtest_data_path,
            backtest_symbol: lookup("BACKTEST_SYMBOL"),
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://slowtrader.db?mode=rwc".to_string()),
            trading_config_path: lookup("TRADING_CONFIG_PATH")
                .unwrap_or_else(|| "config/trading.toml".to_string()),
        })
    }
}

fn required<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Result<String> {
    lookup(key).filter(|v| !v.is_empty()).ok_or_else(|| {
        Error::Config(format!(
            "Required environment variable '{key}' is not set. Check your .env file."
        ))
    })
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}='{raw}' is invalid: {e}"))),
    }
}
