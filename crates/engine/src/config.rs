use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use common::{Error, Result};
use risk::RiskConfig;
use strategy::{AggregationPolicy, StrategyConfig, StrategyRegistry};

/// Trading settings loaded from the TOML file at `TRADING_CONFIG_PATH`.
///
/// ```toml
/// symbols = ["BTCUSDT", "ETHUSDT"]
/// interval = "1h"
/// lookback_bars = 200
///
/// [[strategy]]
/// type = "ma_crossover"
///
/// [aggregation]
/// policy = "min_confirmations"
/// min_confirmations = 1
///
/// [risk]
/// max_position_size = 0.1
///
/// [schedule]
/// interval_minutes = 15
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Bars kept per symbol and handed to the strategies.
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: usize,
    #[serde(default, rename = "strategy")]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub aggregation: AggregationPolicy,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub backtest: BacktestSettings,
}

fn default_interval() -> String {
    "1h".to_string()
}

fn default_lookback_bars() -> usize {
    StrategyRegistry::DEFAULT_MAX_HISTORY
}

/// When the live loop ticks and when it is allowed to trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_minutes: u64,
    /// First trading hour, inclusive, in exchange-local time.
    pub trading_hours_start: u32,
    /// Last trading hour, exclusive.
    pub trading_hours_end: u32,
    /// Weekdays, 0 = Monday.
    pub trading_days: Vec<u32>,
    /// Exchange-local offset from UTC; also decides the trading-day boundary.
    pub utc_offset_hours: i32,
    pub reconcile_every_ticks: u32,
    /// Background fill polling between ticks. 0 polls only on ticks.
    pub fill_poll_seconds: u64,
    pub cancel_open_orders_on_stop: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            trading_hours_start: 9,
            trading_hours_end: 16,
            trading_days: vec![0, 1, 2, 3, 4],
            utc_offset_hours: 0,
            reconcile_every_ticks: 4,
            fill_poll_seconds: 30,
            cancel_open_orders_on_stop: false,
        }
    }
}

impl ScheduleConfig {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    pub fn is_trading_time(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset());
        let weekday = local.weekday().num_days_from_monday();
        let hour = local.hour();
        self.trading_days.contains(&weekday)
            && hour >= self.trading_hours_start
            && hour < self.trading_hours_end
    }

    fn validate(&self) -> Result<()> {
        if self.interval_minutes == 0 {
            return Err(Error::Config("schedule.interval_minutes must be positive".into()));
        }
        if self.trading_hours_start >= self.trading_hours_end || self.trading_hours_end > 24 {
            return Err(Error::Config(format!(
                "schedule trading hours {}..{} are not a window within a day",
                self.trading_hours_start, self.trading_hours_end
            )));
        }
        if self.trading_days.iter().any(|d| *d > 6) {
            return Err(Error::Config("schedule.trading_days must be 0 (Mon) to 6 (Sun)".into()));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(Error::Config("schedule.utc_offset_hours out of range".into()));
        }
        Ok(())
    }
}

/// `[backtest]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    /// Bars per year used to annualise the Sharpe ratio.
    pub periods_per_year: f64,
    /// Close open positions at the last bar's close before computing metrics.
    pub liquidate_at_end: bool,
    /// Only evaluate bars inside the schedule's trading window.
    pub respect_trading_hours: bool,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            periods_per_year: 365.0 * 24.0,
            liquidate_at_end: true,
            respect_trading_hours: false,
        }
    }
}

impl TradingConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read trading config at '{path}': {e}")))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("invalid trading config at '{path}': {e}")))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let cfg: TradingConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Everything a load-time check can catch, including unknown strategy
    /// types and bad parameters.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(Error::Config("at least one symbol is required".into()));
        }
        if interval_duration(&self.interval).is_none() {
            return Err(Error::Config(format!("unsupported interval '{}'", self.interval)));
        }
        self.risk.validate()?;
        self.schedule.validate()?;
        StrategyRegistry::from_config(&self.strategies, self.lookback_bars)?;
        if self.backtest.periods_per_year <= 0.0 {
            return Err(Error::Config("backtest.periods_per_year must be positive".into()));
        }
        Ok(())
    }

    pub fn bar_duration(&self) -> Duration {
        interval_duration(&self.interval).unwrap_or_else(|| Duration::hours(1))
    }
}

/// Length of a kline interval such as `15m`, `1h` or `1d`.
pub fn interval_duration(interval: &str) -> Option<Duration> {
    if !interval.is_ascii() {
        return None;
    }
    let (count, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let count: i64 = count.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "m" => Some(Duration::minutes(count)),
        "h" => Some(Duration::hours(count)),
        "d" => Some(Duration::days(count)),
        "w" => Some(Duration::weeks(count)),
        _ => None,
    }
}
