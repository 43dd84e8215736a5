use std::collections::BTreeMap;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;

use backtest::{BacktestReport, Backtester};
use common::{Bar, TraceEvent};
use engine::TradingConfig;
use paper::SimulationCosts;

fn walk(steps: &[i8]) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let mut close = 100.0_f64;
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let open = close;
            close = (close + f64::from(*step)).max(5.0);
            Bar {
                symbol: "BTCUSDT".into(),
                timestamp: start + Duration::hours(i as i64),
                open,
                high: open.max(close) + 0.5,
                low: open.min(close) - 0.5,
                close,
                volume: 10.0,
            }
        })
        .collect()
}

fn run(bars: Vec<Bar>, liquidate_at_end: bool) -> BacktestReport {
    let mut cfg = TradingConfig::parse(
        r#"
        symbols = ["BTCUSDT"]

        [[strategy]]
        type = "ma_crossover"
        [strategy.params]
        fast_period = 3
        slow_period = 8

        [[strategy]]
        type = "rsi"
        [strategy.params]
        period = 6

        [risk]
        min_trade_interval_minutes = 0
        "#,
    )
    .unwrap();
    cfg.backtest.liquidate_at_end = liquidate_at_end;
    let bt = Backtester::new(
        cfg,
        Decimal::new(10_000, 0),
        SimulationCosts {
            slippage_bps: Decimal::new(10, 0),
            fee_rate: Decimal::new(1, 3),
        },
    );
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(bt.run(bars))
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The same bars always produce the same trace.
    #[test]
    fn replay_is_deterministic(steps in prop::collection::vec(-3i8..=3, 30..120)) {
        let a = run(walk(&steps), true);
        let b = run(walk(&steps), true);
        prop_assert_eq!(&a.digest, &b.digest);
        prop_assert_eq!(a.metrics, b.metrics);
    }

    /// No order is ever filled on the bar that produced it.
    #[test]
    fn fills_come_after_the_decision_bar(steps in prop::collection::vec(-3i8..=3, 30..120)) {
        let report = run(walk(&steps), false);
        let mut created = BTreeMap::new();
        for event in &report.trace {
            match event {
                TraceEvent::OrderUpdated(order) => {
                    created.entry(order.id.clone()).or_insert(order.created_at);
                }
                TraceEvent::FillApplied { fill, .. } => {
                    prop_assert!(fill.timestamp > created[&fill.order_id]);
                }
                _ => {}
            }
        }
    }

    /// Long-only trading with affordability checks never overdraws cash,
    /// and liquidation leaves the book flat.
    #[test]
    fn cash_stays_non_negative(steps in prop::collection::vec(-3i8..=3, 30..120)) {
        let report = run(walk(&steps), true);
        prop_assert!(report.final_state.cash_balance >= Decimal::ZERO);
        prop_assert!(report.final_state.positions.is_empty());
        prop_assert_eq!(report.equity_curve.len(), steps.len());
    }
}
