use arrow::array::{Float64Array, Int64Array};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, SecondsFormat};

use crate::model_types::{typed_column, ValueRange, IV_COLUMN, PRICE_COLUMN, QUANTITY_COLUMN, TIMESTAMP_COLUMN};

/// Summary statistics of one instrument's trade table.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeStats {
    pub total_trades: usize,
    pub total_volume: f64,
    pub first_trade_us: Option<i64>,
    pub last_trade_us: Option<i64>,
    pub price_range: ValueRange,
    pub iv_range: ValueRange,
}

pub fn compute_trade_stats(batch: &RecordBatch) -> Result<TradeStats, ArrowError> {
    let timestamps = typed_column::<Int64Array>(batch, TIMESTAMP_COLUMN)?;
    let quantities = typed_column::<Float64Array>(batch, QUANTITY_COLUMN)?;
    let prices = typed_column::<Float64Array>(batch, PRICE_COLUMN)?;
    let ivs = typed_column::<Float64Array>(batch, IV_COLUMN)?;

    let first_trade_us = timestamps.iter().flatten().min();
    let last_trade_us = timestamps.iter().flatten().max();

    // NaN quantities are left out of the volume.
    let total_volume: f64 = quantities
        .iter()
        .flatten()
        .filter(|q| !q.is_nan())
        .sum();

    Ok(TradeStats {
        total_trades: batch.num_rows(),
        total_volume,
        first_trade_us,
        last_trade_us,
        price_range: value_range(prices),
        iv_range: value_range(ivs),
    })
}

/// Min/max over the non-null, non-NaN values.
pub fn value_range(values: &Float64Array) -> ValueRange {
    let (min, max) = values
        .iter()
        .flatten()
        .filter(|v| !v.is_nan())
        .fold((None, None), |(min, max): (Option<f64>, Option<f64>), v| {
            (
                Some(min.map_or(v, |m| m.min(v))),
                Some(max.map_or(v, |m| m.max(v))),
            )
        });
    ValueRange { min, max }
}

/// RFC 3339 UTC rendering of a microsecond epoch timestamp.
pub fn format_timestamp_us(timestamp_us: i64) -> String {
    DateTime::from_timestamp_micros(timestamp_us)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, false))
        .unwrap_or_else(|| timestamp_us.to_string())
}

/// Relative-tolerance float comparison used when checking persisted sums.
pub fn approx_eq(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= scale * 1e-9
}
