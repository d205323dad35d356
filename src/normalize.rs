use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::provider::{Field, ProviderSchema, TimeUnit, VolumeUnit};

/// One daily price from a price-only provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// One daily candle; `volume` is quote-currency denominated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OhlcRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bar {
    Price(PricePoint),
    Candle(OhlcRow),
}

impl Bar {
    pub fn date(&self) -> NaiveDate {
        match self {
            Bar::Price(p) => p.date,
            Bar::Candle(c) => c.date,
        }
    }

    /// Price used for returns: the point value, or the candle close.
    pub fn close(&self) -> f64 {
        match self {
            Bar::Price(p) => p.value,
            Bar::Candle(c) => c.close,
        }
    }
}

/// Normalized series keyed (and therefore ordered) by calendar date.
pub type Series = BTreeMap<NaiveDate, Bar>;

/// Accepts JSON numbers and numeric strings (Binance quotes prices as strings).
pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// UTC calendar day containing `ts`, truncating to whole days.
pub fn timestamp_to_date(ts: f64, unit: TimeUnit) -> Option<NaiveDate> {
    if !ts.is_finite() {
        return None;
    }
    let ms = match unit {
        TimeUnit::Millis => ts as i64,
        TimeUnit::Seconds => (ts * 1000.0) as i64,
    };
    DateTime::<Utc>::from_timestamp_millis(ms).map(|t| t.date_naive())
}

/// Map positional provider rows onto canonical bars using `schema`.
///
/// Rows missing a required column are skipped. When two rows land on the same
/// date the later one wins.
pub fn normalize(rows: &[Vec<Value>], schema: &ProviderSchema) -> Series {
    let col = |row: &[Value], field: Field| {
        schema
            .index_of(field)
            .and_then(|i| row.get(i))
            .and_then(value_as_f64)
    };

    let mut out = Series::new();
    let mut skipped = 0usize;
    let mut duplicates = 0usize;
    for row in rows {
        let Some(date) = col(row, Field::Time).and_then(|t| timestamp_to_date(t, schema.time_unit))
        else {
            skipped += 1;
            continue;
        };
        let bar = if schema.is_candle() {
            match (
                col(row, Field::Open),
                col(row, Field::High),
                col(row, Field::Low),
                col(row, Field::Close),
            ) {
                (Some(open), Some(high), Some(low), Some(close)) => {
                    let raw_volume = col(row, Field::Volume).unwrap_or(0.0);
                    let volume = match schema.volume {
                        VolumeUnit::Base => raw_volume * close,
                        VolumeUnit::Quote => raw_volume,
                    };
                    Bar::Candle(OhlcRow {
                        date,
                        open,
                        high,
                        low,
                        close,
                        volume,
                    })
                }
                _ => {
                    skipped += 1;
                    continue;
                }
            }
        } else {
            match col(row, Field::Price) {
                Some(value) => Bar::Price(PricePoint { date, value }),
                None => {
                    skipped += 1;
                    continue;
                }
            }
        };
        if out.insert(date, bar).is_some() {
            duplicates += 1;
        }
    }
    if skipped > 0 || duplicates > 0 {
        debug!(
            "{:?}: skipped {} malformed rows, replaced {} duplicate dates",
            schema.provider, skipped, duplicates
        );
    }
    out
}

/// Close price per date.
pub fn closes(series: &Series) -> BTreeMap<NaiveDate, f64> {
    series.iter().map(|(d, b)| (*d, b.close())).collect()
}
