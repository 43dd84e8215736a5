use std::io::Read;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use common::{Bar, Error, Result};

#[derive(Debug, Deserialize)]
struct Row {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Read `timestamp,open,high,low,close,volume` rows for one symbol.
pub fn load_csv(path: impl AsRef<Path>, symbol: &str) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("cannot open bar file {}: {e}", path.display())))?;
    read_bars(file, symbol)
}

/// Parse and validate bars: ordered by time, no duplicate timestamps, and
/// `low <= open, close <= high`.
pub fn read_bars<R: Read>(reader: R, symbol: &str) -> Result<Vec<Bar>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut bars = Vec::new();
    for (i, row) in rdr.deserialize::<Row>().enumerate() {
        let line = i + 2;
        let row = row.map_err(|e| Error::InvalidBars(format!("line {line}: {e}")))?;
        let bar = Bar {
            symbol: symbol.to_string(),
            timestamp: parse_timestamp(&row.timestamp)
                .ok_or_else(|| Error::InvalidBars(format!("line {line}: bad timestamp '{}'", row.timestamp)))?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        };
        if !is_consistent(&bar) {
            return Err(Error::InvalidBars(format!("line {line}: inconsistent OHLC values")));
        }
        bars.push(bar);
    }

    bars.sort_by_key(|b| b.timestamp);
    if let Some(pair) = bars.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
        return Err(Error::InvalidBars(format!(
            "duplicate timestamp {} for {symbol}",
            pair[0].timestamp
        )));
    }
    Ok(bars)
}

/// RFC 3339, or unix seconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let secs: i64 = raw.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn is_consistent(bar: &Bar) -> bool {
    let values = [bar.open, bar.high, bar.low, bar.close, bar.volume];
    values.iter().all(|v| v.is_finite())
        && bar.volume >= 0.0
        && bar.low > 0.0
        && bar.low <= bar.open.min(bar.close)
        && bar.high >= bar.open.max(bar.close)
}
