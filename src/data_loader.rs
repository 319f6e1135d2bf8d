use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::compute::{can_cast_types, cast, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::ipc::reader::FileReader;
use arrow::record_batch::RecordBatch;
use csv::ReaderBuilder;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::debug;

use crate::error::{PipelineError, SourceFileError};
use crate::model_types::{
    canonical_schema, required_column_type, ID_COLUMN, INSTRUMENT_COLUMN, IV_COLUMN, PRICE_COLUMN,
    QUANTITY_COLUMN, REQUIRED_COLUMNS, TIMESTAMP_COLUMN,
};

const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// Columnar formats a daily file may arrive in, detected by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Parquet,
    Feather,
    Csv,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "parquet" => Some(SourceFormat::Parquet),
            "feather" | "arrow" | "ipc" => Some(SourceFormat::Feather),
            "csv" => Some(SourceFormat::Csv),
            _ => None,
        }
    }
}

/// Narrow interface the aggregator loads daily files through.
pub trait TradeSource: Sync {
    /// Load one file as a normalized batch. A zero-row batch means the file is empty.
    fn load(&self, path: &Path) -> Result<RecordBatch, SourceFileError>;
}

/// File-system backed trade source.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataLoader;

impl DataLoader {
    pub fn new() -> Self {
        Self
    }
}

impl TradeSource for DataLoader {
    fn load(&self, path: &Path) -> Result<RecordBatch, SourceFileError> {
        load_trade_file(path)
    }
}

/// Glob `pattern` inside `dir` and return regular files in lexicographic filename order.
pub fn discover_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let paths = glob::glob(&full_pattern).map_err(|source| PipelineError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut files: Vec<PathBuf> = paths
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    Ok(files)
}

/// Load and normalize one trade file.
pub fn load_trade_file(path: &Path) -> Result<RecordBatch, SourceFileError> {
    let format = SourceFormat::from_path(path).ok_or_else(|| SourceFileError::UnknownFormat {
        path: path.to_path_buf(),
    })?;

    let raw = match format {
        SourceFormat::Parquet => read_parquet(path)?,
        SourceFormat::Feather => read_feather(path)?,
        SourceFormat::Csv => read_csv(path)?,
    };

    if raw.num_rows() == 0 {
        debug!("{} contains no rows", path.display());
        return Ok(RecordBatch::new_empty(canonical_schema()));
    }

    normalize_trade_batch(path, &raw)
}

fn open(path: &Path) -> Result<File, SourceFileError> {
    File::open(path).map_err(|source| SourceFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn arrow_err(path: &Path) -> impl Fn(arrow::error::ArrowError) -> SourceFileError + '_ {
    move |source| SourceFileError::Arrow {
        path: path.to_path_buf(),
        source,
    }
}

fn read_parquet(path: &Path) -> Result<RecordBatch, SourceFileError> {
    let parquet_err = |source| SourceFileError::Parquet {
        path: path.to_path_buf(),
        source,
    };
    let builder = ParquetRecordBatchReaderBuilder::try_new(open(path)?).map_err(parquet_err)?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(parquet_err)?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(arrow_err(path))?;
    concat_batches(&schema, &batches).map_err(arrow_err(path))
}

fn read_feather(path: &Path) -> Result<RecordBatch, SourceFileError> {
    let reader = FileReader::try_new(open(path)?, None).map_err(arrow_err(path))?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(arrow_err(path))?;
    concat_batches(&schema, &batches).map_err(arrow_err(path))
}

fn read_csv(path: &Path) -> Result<RecordBatch, SourceFileError> {
    let csv_err = |source| SourceFileError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let buf = BufReader::with_capacity(READ_BUFFER_BYTES, open(path)?);
    let mut rdr = ReaderBuilder::new().from_reader(buf);
    let headers = rdr.headers().map_err(csv_err)?.clone();

    let position = |column: &'static str| {
        headers
            .iter()
            .position(|h| h.trim() == column)
            .ok_or_else(|| SourceFileError::MissingColumn {
                path: path.to_path_buf(),
                column,
            })
    };
    let required_idx = [
        position(INSTRUMENT_COLUMN)?,
        position(ID_COLUMN)?,
        position(TIMESTAMP_COLUMN)?,
        position(PRICE_COLUMN)?,
        position(QUANTITY_COLUMN)?,
        position(IV_COLUMN)?,
    ];
    let extra_idx: Vec<usize> = (0..headers.len())
        .filter(|idx| !required_idx.contains(idx))
        .collect();

    let mut instruments = Vec::new();
    let mut ids = Vec::new();
    let mut timestamps = Vec::new();
    let mut prices = Vec::new();
    let mut quantities = Vec::new();
    let mut ivs = Vec::new();
    let mut extras: Vec<Vec<Option<String>>> = vec![Vec::new(); extra_idx.len()];

    for (row, record) in rdr.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();
        let invalid = |column: &'static str, value: &str| SourceFileError::InvalidValue {
            path: path.to_path_buf(),
            row,
            column,
            value: value.to_string(),
        };

        instruments.push(field(required_idx[0]).to_string());
        ids.push(field(required_idx[1]).to_string());

        let ts = field(required_idx[2]);
        timestamps.push(ts.parse::<i64>().map_err(|_| invalid(TIMESTAMP_COLUMN, ts))?);

        for (idx, column, values) in [
            (required_idx[3], PRICE_COLUMN, &mut prices),
            (required_idx[4], QUANTITY_COLUMN, &mut quantities),
            (required_idx[5], IV_COLUMN, &mut ivs),
        ] {
            let raw = field(idx);
            values.push(raw.parse::<f64>().map_err(|_| invalid(column, raw))?);
        }

        for (slot, idx) in extra_idx.iter().enumerate() {
            let value = field(*idx);
            extras[slot].push((!value.is_empty()).then(|| value.to_string()));
        }
    }

    let mut fields = vec![
        Field::new(INSTRUMENT_COLUMN, DataType::Utf8, false),
        Field::new(ID_COLUMN, DataType::Utf8, false),
        Field::new(TIMESTAMP_COLUMN, DataType::Int64, false),
        Field::new(PRICE_COLUMN, DataType::Float64, false),
        Field::new(QUANTITY_COLUMN, DataType::Float64, false),
        Field::new(IV_COLUMN, DataType::Float64, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(instruments)),
        Arc::new(StringArray::from(ids)),
        Arc::new(Int64Array::from(timestamps)),
        Arc::new(Float64Array::from(prices)),
        Arc::new(Float64Array::from(quantities)),
        Arc::new(Float64Array::from(ivs)),
    ];
    for (slot, idx) in extra_idx.iter().enumerate() {
        fields.push(Field::new(headers[*idx].trim(), DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(std::mem::take(&mut extras[slot]))));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(arrow_err(path))
}

/// Cast required columns to their canonical types, move them to the front,
/// and keep every other column as a nullable trailing field.
pub fn normalize_trade_batch(path: &Path, batch: &RecordBatch) -> Result<RecordBatch, SourceFileError> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(schema.fields().len());

    for name in REQUIRED_COLUMNS {
        let (idx, field) = schema
            .column_with_name(name)
            .ok_or_else(|| SourceFileError::MissingColumn {
                path: path.to_path_buf(),
                column: name,
            })?;
        let target = required_column_type(name).unwrap_or(DataType::Utf8);
        let column = cast_required(path, name, batch.column(idx), field.data_type(), &target)?;

        let nulls = column.null_count();
        if nulls > 0 {
            return Err(SourceFileError::NullValues {
                path: path.to_path_buf(),
                column: name,
                nulls,
            });
        }
        fields.push(Field::new(name, target, false));
        columns.push(column);
    }

    for (idx, field) in schema.fields().iter().enumerate() {
        if REQUIRED_COLUMNS.contains(&field.name().as_str()) {
            continue;
        }
        fields.push(Field::new(field.name(), field.data_type().clone(), true));
        columns.push(batch.column(idx).clone());
    }

    let normalized: SchemaRef = Arc::new(Schema::new(fields));
    RecordBatch::try_new(normalized, columns).map_err(arrow_err(path))
}

fn cast_required(
    path: &Path,
    name: &str,
    column: &ArrayRef,
    from: &DataType,
    to: &DataType,
) -> Result<ArrayRef, SourceFileError> {
    if from == to {
        return Ok(column.clone());
    }
    let unsupported = || SourceFileError::UnsupportedType {
        path: path.to_path_buf(),
        column: name.to_string(),
        data_type: from.to_string(),
    };

    // Arrow timestamps are rescaled to microseconds before dropping the logical type.
    if let DataType::Timestamp(_, tz) = from {
        if *to == DataType::Int64 {
            let micros = cast(column, &DataType::Timestamp(TimeUnit::Microsecond, tz.clone()))
                .map_err(arrow_err(path))?;
            return cast(&micros, to).map_err(arrow_err(path));
        }
    }

    if !can_cast_types(from, to) {
        return Err(unsupported());
    }
    cast(column, to).map_err(arrow_err(path))
}
