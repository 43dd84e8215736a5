use common::Bar;

use super::{pad_front, wilder_values, IndicatorSeries};

/// Average True Range with Wilder smoothing. Lookback: `period + 1` bars,
/// since every true range after the first needs the previous close.
pub fn atr(bars: &[Bar], period: usize) -> IndicatorSeries {
    let values = if bars.len() < 2 {
        vec![None; bars.len()]
    } else {
        let tr = true_ranges(bars);
        pad_front(wilder_values(&tr[1..], period), 1)
    };
    IndicatorSeries::new("atr", period + 1, bars, values)
}

/// `max(high − low, |high − prev close|, |low − prev close|)`; the first bar
/// has no previous close and uses `high − low`.
pub(crate) fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let range = bar.high - bar.low;
            match i.checked_sub(1).map(|j| bars[j].close) {
                Some(prev) => range
                    .max((bar.high - prev).abs())
                    .max((bar.low - prev).abs()),
                None => range,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::testutil::ohlc;

    #[test]
    fn true_range_accounts_for_gaps() {
        let bars = ohlc(&[(10.0, 8.0, 9.0), (15.0, 13.0, 14.0), (12.0, 11.0, 11.5)]);
        // gap up: |15 - 9| = 6; gap down: |11 - 14| = 3
        assert_eq!(true_ranges(&bars), vec![2.0, 6.0, 3.0]);
    }

    #[test]
    fn atr_seed_and_smoothing() {
        let bars = ohlc(&[
            (10.0, 8.0, 9.0),
            (11.0, 9.0, 10.0), // tr 2
            (12.0, 10.0, 11.0), // tr 2
            (15.0, 11.0, 14.0), // tr 4
        ]);
        let values = atr(&bars, 2).values();
        assert_eq!(values, vec![None, None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn atr_needs_period_plus_one_bars() {
        let bars = ohlc(&[(10.0, 8.0, 9.0), (11.0, 9.0, 10.0)]);
        assert!(atr(&bars, 2).last().is_err());
        assert!(atr(&bars[..1], 1).last().is_err());
        assert!(atr(&[], 14).is_empty());
    }
}
