use chrono::{NaiveDate, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;

use common::{Direction, PortfolioState, Position, RejectionReason, Signal};
use risk::{RiskConfig, RiskManager};

fn portfolio(cash: Decimal, held: &[(String, i64)]) -> PortfolioState {
    let mut state = PortfolioState::new(cash, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    for (symbol, qty) in held {
        let price = Decimal::new(25, 0);
        let mut position = Position {
            symbol: symbol.clone(),
            quantity: Decimal::new(*qty, 0),
            avg_entry_price: price,
            mark_price: price,
            unrealized_pnl: Decimal::ZERO,
            stop_loss_price: None,
            take_profit_price: None,
            opened_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        };
        position.mark(price);
        state.positions.insert(symbol.clone(), position);
    }
    state.peak_equity = state.equity();
    state.day_start_equity = state.equity();
    state
}

fn long(symbol: &str) -> Signal {
    let ts = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
    Signal::new(symbol, ts, Direction::Long, 1.0, "prop")
}

proptest! {
    /// Approved entries never exceed `max_position_size * equity` nor available cash.
    #[test]
    fn sizing_never_exceeds_caps(
        cash_cents in 1i64..100_000_000,
        price_cents in 1i64..10_000_000,
        size_pct in 1i64..=100,
        precision in 0u32..=8,
    ) {
        let cash = Decimal::new(cash_cents, 2);
        let price = Decimal::new(price_cents, 2);
        let rm = RiskManager::new(RiskConfig {
            max_position_size: Decimal::new(size_pct, 2),
            quantity_precision: precision,
            ..RiskConfig::default()
        });
        let state = portfolio(cash, &[]);
        match rm.evaluate(&long("BTCUSDT"), &state, price) {
            Ok(intent) => {
                let notional = intent.quantity * price;
                prop_assert!(intent.quantity > Decimal::ZERO);
                prop_assert!(notional <= rm.config().max_position_size * state.equity());
                prop_assert!(notional <= cash);
                prop_assert!(intent.quantity.scale() <= precision);
            }
            Err(rejection) => prop_assert_eq!(rejection.reason, RejectionReason::ZeroQuantity),
        }
    }

    /// A new symbol is never approved once `max_open_positions` symbols are held.
    #[test]
    fn never_opens_past_max_positions(held in 0usize..8, max_open in 1usize..6) {
        let rm = RiskManager::new(RiskConfig {
            max_open_positions: max_open,
            max_position_size: Decimal::new(5, 2),
            ..RiskConfig::default()
        });
        let symbols: Vec<(String, i64)> = (0..held).map(|i| (format!("SYM{i}USDT"), 1)).collect();
        let state = portfolio(Decimal::new(100_000, 0), &symbols);
        let result = rm.evaluate(&long("NEWUSDT"), &state, Decimal::new(10, 0));
        if held >= max_open {
            prop_assert_eq!(result.unwrap_err().reason, RejectionReason::MaxOpenPositions);
        } else {
            prop_assert!(result.is_ok());
        }
    }

    /// Exits of held positions pass whatever the daily loss is.
    #[test]
    fn breaker_never_blocks_exits(loss in 0i64..100_000, qty in 1i64..1_000) {
        let rm = RiskManager::default();
        let mut state = portfolio(Decimal::new(10_000, 0), &[("ETHUSDT".to_string(), qty)]);
        state.realized_pnl_today = Decimal::new(-loss, 0);
        let exit = Signal::new("ETHUSDT", long("ETHUSDT").timestamp, Direction::Short, 1.0, "prop");
        let intent = rm.evaluate(&exit, &state, Decimal::new(25, 0)).unwrap();
        prop_assert!(intent.reduce_only);
        prop_assert_eq!(intent.quantity, Decimal::new(qty, 0));
    }
}
