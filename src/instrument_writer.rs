use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{new_null_array, Array, ArrayRef, BooleanArray, Int64Array, StringArray, UInt32Array};
use arrow::compute::{can_cast_types, cast, concat_batches, filter_record_batch, take_record_batch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use tracing::{debug, warn};

use crate::aggregator::Accumulation;
use crate::error::{MergeError, WriteError};
use crate::instrument::{decode_instrument, InstrumentKey};
use crate::metrics::{compute_trade_stats, format_timestamp_us, TradeStats};
use crate::model_types::{
    canonical_fields, typed_column, InstrumentMetadata, ID_COLUMN, REQUIRED_COLUMNS, TIMESTAMP_COLUMN,
};
use crate::storage::InstrumentStore;

/// A successfully published instrument.
#[derive(Debug, Clone)]
pub struct SavedInstrument {
    pub instrument: String,
    pub trades: usize,
    pub dir: PathBuf,
}

/// Turns one instrument's accumulation into a persisted artifact pair.
#[derive(Debug, Clone)]
pub struct InstrumentWriter {
    store: InstrumentStore,
}

impl InstrumentWriter {
    pub fn new(store: InstrumentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &InstrumentStore {
        &self.store
    }

    /// Merge, deduplicate, sort, summarize and persist. Consumes the
    /// accumulation so its batches are released as soon as this returns.
    pub fn process(&self, instrument: &str, accumulation: Accumulation) -> Result<SavedInstrument, WriteError> {
        let files_contributed = accumulation.files_contributed();
        let batches = accumulation.into_batches();

        let merged = merge_batches(&batches)?;
        drop(batches);
        let deduped = dedupe_by_trade_id(&merged).map_err(MergeError::from)?;
        let sorted = sort_by_timestamp(&deduped).map_err(MergeError::from)?;
        debug!(
            "{}: {} rows merged, {} after dedup",
            instrument,
            merged.num_rows(),
            sorted.num_rows()
        );

        let key = decode_instrument(instrument)?;
        let stats = compute_trade_stats(&sorted).map_err(MergeError::from)?;
        let metadata = build_metadata(instrument, &key, &stats, files_contributed);

        let dir = self.store.commit(instrument, &sorted, &metadata)?;
        Ok(SavedInstrument {
            instrument: instrument.to_string(),
            trades: sorted.num_rows(),
            dir,
        })
    }
}

pub fn build_metadata(
    instrument: &str,
    key: &InstrumentKey,
    stats: &TradeStats,
    files_contributed: usize,
) -> InstrumentMetadata {
    InstrumentMetadata {
        instrument: instrument.to_string(),
        asset: key.asset.clone(),
        expiry_date: key.expiry.format("%Y-%m-%d").to_string(),
        strike_price: key.strike,
        option_type: key.option_type,
        total_trades: stats.total_trades,
        total_volume: stats.total_volume,
        first_trade: stats.first_trade_us.map(format_timestamp_us).unwrap_or_default(),
        last_trade: stats.last_trade_us.map(format_timestamp_us).unwrap_or_default(),
        price_range: stats.price_range,
        iv_range: stats.iv_range,
        data_files_processed: files_contributed,
    }
}

/// Concatenate batches whose trailing columns may differ between source files.
///
/// Missing columns are filled with nulls. An extra column whose type differs
/// between files is widened (null to anything, integer to float) or stored as
/// text; a column that cannot be reconciled at all is dropped with a warning.
pub fn merge_batches(batches: &[RecordBatch]) -> Result<RecordBatch, MergeError> {
    let first = batches.first().ok_or(MergeError::Empty)?;
    if batches.iter().all(|b| b.schema() == first.schema()) {
        return Ok(concat_batches(&first.schema(), batches)?);
    }

    let schema = unified_schema(batches);
    let aligned = batches
        .iter()
        .map(|batch| align_to_schema(batch, &schema))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &aligned)?)
}

/// Type both sides convert to without losing values, if any.
fn common_type(a: &DataType, b: &DataType) -> Option<DataType> {
    match (a, b) {
        _ if a == b => Some(a.clone()),
        (DataType::Null, other) | (other, DataType::Null) => Some(other.clone()),
        _ if a.is_integer() && b.is_integer() => Some(DataType::Int64),
        _ if a.is_numeric() && b.is_numeric() => Some(DataType::Float64),
        _ => None,
    }
}

fn unified_schema(batches: &[RecordBatch]) -> SchemaRef {
    let mut extras: Vec<(String, DataType)> = Vec::new();
    for batch in batches {
        for field in batch.schema().fields() {
            if REQUIRED_COLUMNS.contains(&field.name().as_str()) {
                continue;
            }
            match extras.iter_mut().find(|(name, _)| name == field.name()) {
                Some((name, current)) => {
                    let widened = common_type(current, field.data_type()).unwrap_or_else(|| {
                        warn!(
                            "Column `{}` is {} in one file and {} in another, storing as text",
                            name,
                            current,
                            field.data_type()
                        );
                        DataType::Utf8
                    });
                    *current = widened;
                }
                None => extras.push((field.name().clone(), field.data_type().clone())),
            }
        }
    }

    let mut fields = canonical_fields();
    for (name, target) in extras {
        let castable = batches.iter().all(|batch| {
            batch
                .column_by_name(&name)
                .map_or(true, |column| can_cast_types(column.data_type(), &target))
        });
        if castable {
            fields.push(Field::new(name, target, true));
        } else {
            warn!("Dropping column `{}`: no common type across files", name);
        }
    }
    Arc::new(Schema::new(fields))
}

fn align_to_schema(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch, ArrowError> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) if column.data_type() == field.data_type() => Ok(column.clone()),
            Some(column) => cast(column, field.data_type()),
            None => Ok(new_null_array(field.data_type(), batch.num_rows())),
        })
        .collect::<Result<Vec<ArrayRef>, _>>()?;
    RecordBatch::try_new(schema.clone(), columns)
}

/// Drop rows whose trade id was already seen, keeping the first occurrence.
pub fn dedupe_by_trade_id(batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
    let ids = typed_column::<StringArray>(batch, ID_COLUMN)?;
    let mut seen: HashSet<&str> = HashSet::with_capacity(ids.len());
    let keep: BooleanArray = ids
        .iter()
        .map(|id| Some(seen.insert(id.unwrap_or_default())))
        .collect();

    if keep.true_count() == batch.num_rows() {
        return Ok(batch.clone());
    }
    filter_record_batch(batch, &keep)
}

/// Stable sort by timestamp: rows with equal timestamps keep their relative order.
pub fn sort_by_timestamp(batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
    let timestamps = typed_column::<Int64Array>(batch, TIMESTAMP_COLUMN)?;
    let values = timestamps.values();
    if values.windows(2).all(|w| w[0] <= w[1]) {
        return Ok(batch.clone());
    }

    let mut indices: Vec<u32> = (0..batch.num_rows() as u32).collect();
    indices.sort_by_key(|&i| values[i as usize]);
    take_record_batch(batch, &UInt32Array::from(indices))
}
