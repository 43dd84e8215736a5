use common::Bar;

use super::ema::ema_values;
use super::{closes, pad_front, IndicatorSeries};

/// MACD line, signal line and histogram over one window.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdSeries {
    /// EMA(fast) − EMA(slow). Lookback: `slow` bars.
    pub macd: IndicatorSeries,
    /// EMA(macd, signal). Lookback: `slow + signal - 1` bars.
    pub signal: IndicatorSeries,
    /// macd − signal. Same lookback as `signal`.
    pub histogram: IndicatorSeries,
}

pub fn macd(bars: &[Bar], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    let closes = closes(bars);
    let fast_ema = ema_values(&closes, fast);
    let slow_ema = ema_values(&closes, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    // The signal EMA runs over the defined part of the MACD line only.
    let signal_line = match line.iter().position(Option::is_some) {
        Some(first) => {
            let defined: Vec<f64> = line[first..].iter().map(|v| v.unwrap_or(0.0)).collect();
            pad_front(ema_values(&defined, signal), first)
        }
        None => vec![None; line.len()],
    };

    let histogram: Vec<Option<f64>> = line
        .iter()
        .zip(&signal_line)
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();

    let line_lookback = fast.max(slow);
    let signal_lookback = line_lookback + signal.saturating_sub(1);
    MacdSeries {
        macd: IndicatorSeries::new("macd", line_lookback, bars, line),
        signal: IndicatorSeries::new("macd_signal", signal_lookback, bars, signal_line),
        histogram: IndicatorSeries::new("macd_histogram", signal_lookback, bars, histogram),
    }
}
