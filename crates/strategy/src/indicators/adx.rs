use common::Bar;

use super::atr::true_ranges;
use super::{pad_front, wilder_values, IndicatorSeries};

#[derive(Debug, Clone, PartialEq)]
pub struct AdxSeries {
    /// Lookback: `2 * period` bars.
    pub adx: IndicatorSeries,
    /// Lookback: `period + 1` bars.
    pub plus_di: IndicatorSeries,
    pub minus_di: IndicatorSeries,
}

/// Average Directional Index with Wilder smoothing of TR, +DM and −DM.
pub fn adx(bars: &[Bar], period: usize) -> AdxSeries {
    let n = bars.len();
    let mut plus_di = vec![None; n];
    let mut minus_di = vec![None; n];
    let mut adx = vec![None; n];

    if n >= 2 && period > 0 {
        let tr = true_ranges(bars);
        let (plus_dm, minus_dm): (Vec<f64>, Vec<f64>) = (1..n)
            .map(|i| {
                let up = bars[i].high - bars[i - 1].high;
                let down = bars[i - 1].low - bars[i].low;
                let plus = if up > down && up > 0.0 { up } else { 0.0 };
                let minus = if down > up && down > 0.0 { down } else { 0.0 };
                (plus, minus)
            })
            .unzip();

        let tr_s = pad_front(wilder_values(&tr[1..], period), 1);
        let plus_s = pad_front(wilder_values(&plus_dm, period), 1);
        let minus_s = pad_front(wilder_values(&minus_dm, period), 1);

        let mut dx = Vec::with_capacity(n);
        for i in 0..n {
            let (Some(t), Some(p), Some(m)) = (tr_s[i], plus_s[i], minus_s[i]) else {
                continue;
            };
            let (pdi, mdi) = if t == 0.0 {
                (0.0, 0.0)
            } else {
                (100.0 * p / t, 100.0 * m / t)
            };
            plus_di[i] = Some(pdi);
            minus_di[i] = Some(mdi);
            let sum = pdi + mdi;
            dx.push(if sum == 0.0 { 0.0 } else { 100.0 * (pdi - mdi).abs() / sum });
        }

        // DX is defined from index `period` on.
        let smoothed = wilder_values(&dx, period);
        for (j, value) in smoothed.into_iter().enumerate() {
            adx[period + j] = value;
        }
    }

    AdxSeries {
        adx: IndicatorSeries::new("adx", 2 * period, bars, adx),
        plus_di: IndicatorSeries::new("plus_di", period + 1, bars, plus_di),
        minus_di: IndicatorSeries::new("minus_di", period + 1, bars, minus_di),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::testutil::ohlc;

    fn steady_uptrend(n: usize) -> Vec<Bar> {
        let rows: Vec<(f64, f64, f64)> = (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                (base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        ohlc(&rows)
    }

    #[test]
    fn adx_lookback_is_twice_the_period() {
        let bars = steady_uptrend(30);
        let series = adx(&bars, 5);
        let first = series.adx.points().iter().position(|p| p.value.is_some());
        assert_eq!(first, Some(9));
        let first_di = series.plus_di.points().iter().position(|p| p.value.is_some());
        assert_eq!(first_di, Some(5));
    }

    #[test]
    fn steady_uptrend_is_all_plus_di() {
        let bars = steady_uptrend(30);
        let series = adx(&bars, 5);
        assert_eq!(series.minus_di.last().unwrap(), 0.0);
        assert!(series.plus_di.last().unwrap() > 0.0);
        // DX is 100 on every bar, so the smoothed ADX is too
        assert!((series.adx.last().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn short_window_is_undefined() {
        let bars = steady_uptrend(27);
        let series = adx(&bars, 14);
        assert!(series.adx.values().iter().all(Option::is_none));
        assert!(series.plus_di.last().is_ok());
    }
}
