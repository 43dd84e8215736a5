use common::Bar;

use super::{closes, IndicatorSeries};

/// Exponential moving average of closes, `k = 2 / (period + 1)`.
///
/// Seeded with the SMA of the first `period` closes, so the first defined
/// point is at index `period - 1`.
pub fn ema(bars: &[Bar], period: usize) -> IndicatorSeries {
    IndicatorSeries::new("ema", period, bars, ema_values(&closes(bars), period))
}

pub(crate) fn ema_values(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(ema);
    for (i, &v) in values.iter().enumerate().skip(period) {
        // Written as a delta so a flat input leaves the average bit-identical.
        ema += k * (v - ema);
        out[i] = Some(ema);
    }
    out
}
