use common::Bar;

use super::sma::sma_values;
use super::{closes, IndicatorSeries};

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerSeries {
    pub upper: IndicatorSeries,
    pub middle: IndicatorSeries,
    pub lower: IndicatorSeries,
}

/// Bollinger Bands: SMA(period) ± `std_dev` sample standard deviations.
///
/// Uses the sample deviation (n − 1), so `period` must be at least 2 for any
/// point to be defined.
pub fn bollinger(bars: &[Bar], period: usize, std_dev: f64) -> BollingerSeries {
    let closes = closes(bars);
    let n = closes.len();
    let valid = period >= 2;

    let middle = if valid { sma_values(&closes, period) } else { vec![None; n] };
    let mut upper = vec![None; n];
    let mut lower = vec![None; n];

    for (i, mean) in middle.iter().enumerate() {
        let Some(mean) = *mean else { continue };
        let window = &closes[i + 1 - period..=i];
        let variance =
            window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (period as f64 - 1.0);
        let width = std_dev * variance.sqrt();
        upper[i] = Some(mean + width);
        lower[i] = Some(mean - width);
    }

    BollingerSeries {
        upper: IndicatorSeries::new("bollinger_upper", period, bars, upper),
        middle: IndicatorSeries::new("bollinger_middle", period, bars, middle),
        lower: IndicatorSeries::new("bollinger_lower", period, bars, lower),
    }
}
