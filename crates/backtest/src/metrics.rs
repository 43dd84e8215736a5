use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use common::TraceEvent;

/// Portfolio equity after one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Aggregate performance of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub initial_equity: Decimal,
    pub final_equity: Decimal,
    /// `(final - initial) / initial`.
    pub total_return: f64,
    /// Largest peak-to-trough decline of the equity curve, as a fraction.
    pub max_drawdown: f64,
    /// Fills that reduced exposure.
    pub trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
    /// Gross profit over gross loss of closing fills. `None` without losses.
    pub profit_factor: Option<f64>,
    /// Mean over standard deviation of per-bar returns, annualised.
    pub sharpe_ratio: f64,
}

impl Metrics {
    pub fn compute(
        initial_equity: Decimal,
        curve: &[EquityPoint],
        trace: &[TraceEvent],
        periods_per_year: f64,
    ) -> Self {
        let final_equity = curve.last().map_or(initial_equity, |p| p.equity);
        let total_return = if initial_equity > Decimal::ZERO {
            to_f64((final_equity - initial_equity) / initial_equity)
        } else {
            0.0
        };

        let closing: Vec<Decimal> = trace
            .iter()
            .filter_map(|e| match e {
                TraceEvent::FillApplied {
                    realized_pnl,
                    closes_exposure: true,
                    ..
                } => Some(*realized_pnl),
                _ => None,
            })
            .collect();
        let winning_trades = closing.iter().filter(|p| **p > Decimal::ZERO).count();
        let gross_profit: Decimal = closing.iter().filter(|p| **p > Decimal::ZERO).sum();
        let gross_loss: Decimal = closing.iter().filter(|p| **p < Decimal::ZERO).map(|p| -*p).sum();

        Self {
            initial_equity,
            final_equity,
            total_return,
            max_drawdown: max_drawdown(curve),
            trades: closing.len(),
            winning_trades,
            win_rate: if closing.is_empty() {
                0.0
            } else {
                winning_trades as f64 / closing.len() as f64
            },
            profit_factor: (gross_loss > Decimal::ZERO).then(|| to_f64(gross_profit / gross_loss)),
            sharpe_ratio: sharpe(curve, periods_per_year),
        }
    }
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

fn max_drawdown(curve: &[EquityPoint]) -> f64 {
    let mut peak = Decimal::ZERO;
    let mut worst = Decimal::ZERO;
    for point in curve {
        peak = peak.max(point.equity);
        if peak > Decimal::ZERO {
            worst = worst.max((peak - point.equity) / peak);
        }
    }
    to_f64(worst)
}

fn sharpe(curve: &[EquityPoint], periods_per_year: f64) -> f64 {
    let returns: Vec<f64> = curve
        .windows(2)
        .filter(|w| w[0].equity > Decimal::ZERO)
        .map(|w| to_f64((w[1].equity - w[0].equity) / w[0].equity))
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev < 1e-12 {
        return 0.0;
    }
    mean / std_dev * periods_per_year.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::FillEvent;
    use rust_decimal_macros::dec;

    fn curve(values: &[Decimal]) -> Vec<EquityPoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| EquityPoint {
                timestamp: start + Duration::hours(i as i64),
                equity: *v,
            })
            .collect()
    }

    fn closing_fill(pnl: Decimal) -> TraceEvent {
        TraceEvent::FillApplied {
            fill: FillEvent {
                order_id: "bt-00000001".into(),
                exchange_order_id: None,
                fill_seq: 1,
                quantity: dec!(1),
                price: dec!(100),
                fee: dec!(0),
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            },
            realized_pnl: pnl,
            closes_exposure: true,
        }
    }

    #[test]
    fn drawdown_and_return() {
        let c = curve(&[dec!(100), dec!(120), dec!(90), dec!(110)]);
        let m = Metrics::compute(dec!(100), &c, &[], 252.0);
        assert!((m.max_drawdown - 0.25).abs() < 1e-12);
        assert!((m.total_return - 0.10).abs() < 1e-12);
        assert_eq!(m.final_equity, dec!(110));
        assert_eq!(m.trades, 0);
        assert_eq!(m.profit_factor, None);
    }

    #[test]
    fn trade_statistics_use_closing_fills_only() {
        // an opening fill realizes only its fee
        let mut opening = closing_fill(dec!(-1));
        if let TraceEvent::FillApplied { closes_exposure, .. } = &mut opening {
            *closes_exposure = false;
        }
        let trace = vec![
            closing_fill(dec!(30)),
            closing_fill(dec!(-10)),
            opening,
            closing_fill(dec!(20)),
        ];
        let m = Metrics::compute(dec!(100), &curve(&[dec!(100)]), &trace, 252.0);
        assert_eq!(m.trades, 3);
        assert_eq!(m.winning_trades, 2);
        assert!((m.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.profit_factor, Some(5.0));
    }

    #[test]
    fn flat_curve_has_zero_sharpe() {
        let m = Metrics::compute(dec!(100), &curve(&[dec!(100); 5]), &[], 252.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
    }

    #[test]
    fn steady_gains_have_positive_sharpe() {
        let c = curve(&[dec!(100), dec!(101), dec!(103), dec!(104), dec!(106)]);
        let m = Metrics::compute(dec!(100), &c, &[], 252.0);
        assert!(m.sharpe_ratio > 0.0);
    }
}
