use common::Bar;

use super::{closes, IndicatorSeries};

/// Relative Strength Index with Wilder smoothing.
///
/// The first average gain/loss is the plain mean over the first `period`
/// close-to-close changes, so the first defined point is at index `period`
/// (lookback `period + 1` bars).
pub fn rsi(bars: &[Bar], period: usize) -> IndicatorSeries {
    IndicatorSeries::new("rsi", period + 1, bars, rsi_values(&closes(bars), period))
}

pub(crate) fn rsi_values(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;
    let initial = &changes[..period];

    let mut avg_gain = initial.iter().filter(|&&c| c > 0.0).sum::<f64>() / p;
    let mut avg_loss = initial.iter().filter(|&&c| c < 0.0).map(|c| c.abs()).sum::<f64>() / p;
    out[period] = Some(rsi_from(avg_gain, avg_loss));

    for (i, &change) in changes.iter().enumerate().skip(period) {
        let gain = if change > 0.0 { change } else { 0.0 };
        let loss = if change < 0.0 { change.abs() } else { 0.0 };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        // changes[i] ends at close i + 1
        out[i + 1] = Some(rsi_from(avg_gain, avg_loss));
    }
    out
}

fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        // no movement at all reads as neutral
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::testutil::bars_from_closes;

    /// 20 rising closes followed by 20 falling ones, one unit per bar.
    fn up_then_down() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        closes.extend((1..=20).map(|k| 119.0 - k as f64));
        closes
    }

    #[test]
    fn rsi_returns_none_when_insufficient_data() {
        // Need at least period+1 = 15 values
        let bars = bars_from_closes(&[100.0; 14]);
        assert!(rsi(&bars, 14).values().iter().all(Option::is_none));
    }

    #[test]
    fn rsi_first_value_at_period() {
        let closes: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        let values = rsi(&bars_from_closes(&closes), 14).values();
        assert!(values[..14].iter().all(Option::is_none));
        assert_eq!(values[14], Some(100.0));
    }

    #[test]
    fn rsi_all_losses_returns_0() {
        let bars = bars_from_closes(&[14.0, 13.0, 12.0, 11.0, 10.0]);
        let value = rsi(&bars, 3).last().unwrap();
        assert!(value.abs() < 1e-9, "Expected ~0, got {value}");
    }

    #[test]
    fn rsi_flat_series_is_neutral() {
        let bars = bars_from_closes(&[10.0; 6]);
        assert_eq!(rsi(&bars, 3).last().unwrap(), 50.0);
    }

    #[test]
    fn rsi_reference_table_up_then_down() {
        // After k falling bars, avg_gain = (13/14)^k and avg_loss = 1 - (13/14)^k,
        // so RSI = 100 * (13/14)^k.
        let reference: [(usize, f64); 9] = [
            (19, 100.0),
            (20, 92.857142857),
            (21, 86.224489796),
            (23, 74.346626406),
            (24, 69.036153091),
            (30, 44.255625455),
            (35, 30.552381340),
            (36, 28.370068388),
            (39, 22.714664813),
        ];
        let values = rsi(&bars_from_closes(&up_then_down()), 14).values();
        for (index, expected) in reference {
            let got = values[index].unwrap();
            assert!(
                (got - expected).abs() < 1e-6,
                "RSI[{index}] = {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn rsi_crosses_70_then_30_at_expected_indices() {
        let values = rsi(&bars_from_closes(&up_then_down()), 14).values();
        let first_above_70 = values.iter().position(|v| matches!(v, Some(x) if *x > 70.0));
        assert_eq!(first_above_70, Some(14));

        let crossed_below = |level: f64| {
            (1..values.len()).find(|&i| match (values[i - 1], values[i]) {
                (Some(prev), Some(curr)) => prev >= level && curr < level,
                _ => false,
            })
        };
        assert_eq!(crossed_below(70.0), Some(24));
        assert_eq!(crossed_below(30.0), Some(36));
    }
}
