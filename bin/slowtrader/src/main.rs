use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use backtest::{load_csv, Backtester};
use common::{Config, EngineCommand, ExchangeClient, TradingMode};
use engine::{
    restore_manager, BinanceClient, Engine, OrderManager, OrderManagerService, RetryPolicy, Store,
    TradingConfig,
};
use paper::{SimulatedExchange, SimulationCosts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env().context("invalid environment")?;
    let trading = TradingConfig::load(&cfg.trading_config_path)?;
    info!(
        mode = %cfg.trading_mode,
        symbols = ?trading.symbols,
        interval = %trading.interval,
        strategies = trading.strategies.len(),
        "SlowTrader starting"
    );

    match cfg.trading_mode {
        TradingMode::Backtest => run_backtest(&cfg, trading).await,
        TradingMode::Paper | TradingMode::Live => run_trading(&cfg, trading).await,
    }
}

fn costs(cfg: &Config) -> SimulationCosts {
    SimulationCosts {
        slippage_bps: cfg.paper_slippage_bps,
        fee_rate: cfg.paper_fee_rate,
    }
}

async fn run_backtest(cfg: &Config, trading: TradingConfig) -> anyhow::Result<()> {
    let path = cfg
        .backtest_data_path
        .as_deref()
        .context("BACKTEST_DATA_PATH is not set")?;
    let symbol = cfg
        .backtest_symbol
        .clone()
        .or_else(|| trading.symbols.first().cloned())
        .context("no symbol to backtest")?;
    let bars = load_csv(path, &symbol)?;
    info!(path, symbol = %symbol, bars = bars.len(), "Bars loaded");

    let report = Backtester::new(trading, cfg.initial_cash, costs(cfg))
        .run(bars)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report.metrics)?);
    println!("trace digest: {}", report.digest);
    Ok(())
}

async fn run_trading(cfg: &Config, trading: TradingConfig) -> anyhow::Result<()> {
    // ── Database ──────────────────────────────────────────────────────────────
    let store = Store::connect(&cfg.database_url)
        .await
        .with_context(|| format!("cannot open database {}", cfg.database_url))?;
    info!("Database ready");

    let retry = RetryPolicy::from_config(cfg);
    let offset = trading.schedule.offset();

    // ── Exchange client (injected based on TRADING_MODE) ──────────────────────
    let (exchange, manager): (Arc<dyn ExchangeClient>, OrderManager) = match cfg.trading_mode {
        TradingMode::Live => {
            info!(base_url = %cfg.binance_base_url, "Live trading mode, orders go to Binance");
            let client = Arc::new(BinanceClient::new(
                &cfg.binance_api_key,
                &cfg.binance_secret,
                &cfg.binance_base_url,
                trading.symbols.clone(),
            )?);
            let manager = restore(cfg, &trading, &store, client.as_ref()).await?;
            (client as Arc<dyn ExchangeClient>, manager)
        }
        TradingMode::Paper | TradingMode::Backtest => {
            info!(
                slippage_bps = %cfg.paper_slippage_bps,
                fee_rate = %cfg.paper_fee_rate,
                "Paper trading mode, orders fill against live bars"
            );
            let market = Arc::new(BinanceClient::public(&cfg.binance_base_url)?);
            let sim = Arc::new(SimulatedExchange::new(cfg.initial_cash, costs(cfg)).with_market_data(market));
            let manager = restore(cfg, &trading, &store, sim.as_ref()).await?;
            sim.restore_balances(manager.state()).await;
            (sim as Arc<dyn ExchangeClient>, manager)
        }
    };

    // ── Order manager + engine ────────────────────────────────────────────────
    let (orders, orders_task) =
        OrderManagerService::spawn(manager, exchange.clone(), retry.clone(), Some(store), offset);
    let (engine, handle) = Engine::new(trading, exchange, retry, orders)?;
    let mut engine_task = tokio::spawn(engine.run());
    handle.send(EngineCommand::Start).await;

    info!("All subsystems started. Waiting for shutdown signal.");
    let outcome = tokio::select! {
        res = &mut engine_task => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping engine");
            handle.send(EngineCommand::Stop).await;
            engine_task.await
        }
    };

    match outcome? {
        Ok(()) => {
            orders_task.await?;
            info!(state = %handle.state().await, "SlowTrader stopped");
            Ok(())
        }
        Err(e) => {
            orders_task.await?;
            error!(error = %e, "Engine halted");
            Err(e.into())
        }
    }
}

async fn restore(
    cfg: &Config,
    trading: &TradingConfig,
    store: &Store,
    exchange: &dyn ExchangeClient,
) -> anyhow::Result<OrderManager> {
    let today = Utc::now().with_timezone(&trading.schedule.offset()).date_naive();
    let manager = restore_manager(
        store,
        exchange,
        cfg.initial_cash,
        today,
        trading.risk.max_open_positions,
    )
    .await?;
    Ok(manager)
}
