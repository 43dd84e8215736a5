use common::Bar;

use super::{closes, IndicatorSeries};

/// Simple moving average of closes. Lookback: `period` bars.
pub fn sma(bars: &[Bar], period: usize) -> IndicatorSeries {
    IndicatorSeries::new("sma", period, bars, sma_values(&closes(bars), period))
}

/// Each point is the plain mean of its own window; no running sum is kept.
pub(crate) fn sma_values(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    for i in period - 1..values.len() {
        let window = &values[i + 1 - period..=i];
        out[i] = Some(window.iter().sum::<f64>() / period as f64);
    }
    out
}
