use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::instrument::OptionType;

pub const INSTRUMENT_COLUMN: &str = "instrument";
pub const ID_COLUMN: &str = "id";
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const PRICE_COLUMN: &str = "price";
pub const QUANTITY_COLUMN: &str = "quantity";
pub const IV_COLUMN: &str = "iv";

/// Columns every source file must carry, in canonical order.
pub const REQUIRED_COLUMNS: [&str; 6] = [
    INSTRUMENT_COLUMN,
    ID_COLUMN,
    TIMESTAMP_COLUMN,
    PRICE_COLUMN,
    QUANTITY_COLUMN,
    IV_COLUMN,
];

/// Canonical type for a required column.
pub fn required_column_type(name: &str) -> Option<DataType> {
    match name {
        INSTRUMENT_COLUMN | ID_COLUMN => Some(DataType::Utf8),
        TIMESTAMP_COLUMN => Some(DataType::Int64),
        PRICE_COLUMN | QUANTITY_COLUMN | IV_COLUMN => Some(DataType::Float64),
        _ => None,
    }
}

/// The six required fields, non-nullable, in canonical order.
pub fn canonical_fields() -> Vec<Field> {
    REQUIRED_COLUMNS
        .iter()
        .filter_map(|name| required_column_type(name).map(|dt| Field::new(*name, dt, false)))
        .collect()
}

pub fn canonical_schema() -> SchemaRef {
    Arc::new(Schema::new(canonical_fields()))
}

/// Downcast a named column of a normalized batch.
pub(crate) fn typed_column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a T, ArrowError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing column `{}`", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ArrowError::SchemaError(format!("column `{}` has unexpected type", name)))
}

/// A single trade, row-oriented.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub instrument: String,
    pub id: String,
    pub timestamp_us: i64,
    pub price: f64,
    pub quantity: f64,
    pub iv: f64,
}

impl TradeRecord {
    pub fn new(instrument: &str, id: &str, timestamp_us: i64, price: f64, quantity: f64, iv: f64) -> Self {
        Self {
            instrument: instrument.to_string(),
            id: id.to_string(),
            timestamp_us,
            price,
            quantity,
            iv,
        }
    }

    /// Read the required columns of a normalized batch back into rows.
    pub fn from_batch(batch: &RecordBatch) -> Result<Vec<TradeRecord>, ArrowError> {
        let instruments = typed_column::<StringArray>(batch, INSTRUMENT_COLUMN)?;
        let ids = typed_column::<StringArray>(batch, ID_COLUMN)?;
        let timestamps = typed_column::<Int64Array>(batch, TIMESTAMP_COLUMN)?;
        let prices = typed_column::<Float64Array>(batch, PRICE_COLUMN)?;
        let quantities = typed_column::<Float64Array>(batch, QUANTITY_COLUMN)?;
        let ivs = typed_column::<Float64Array>(batch, IV_COLUMN)?;

        Ok((0..batch.num_rows())
            .map(|row| TradeRecord {
                instrument: instruments.value(row).to_string(),
                id: ids.value(row).to_string(),
                timestamp_us: timestamps.value(row),
                price: prices.value(row),
                quantity: quantities.value(row),
                iv: ivs.value(row),
            })
            .collect())
    }
}

/// Build a canonical-schema batch from rows.
pub fn trades_to_batch(trades: &[TradeRecord]) -> Result<RecordBatch, ArrowError> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(trades.iter().map(|t| t.instrument.as_str()))),
        Arc::new(StringArray::from_iter_values(trades.iter().map(|t| t.id.as_str()))),
        Arc::new(Int64Array::from_iter_values(trades.iter().map(|t| t.timestamp_us))),
        Arc::new(Float64Array::from_iter_values(trades.iter().map(|t| t.price))),
        Arc::new(Float64Array::from_iter_values(trades.iter().map(|t| t.quantity))),
        Arc::new(Float64Array::from_iter_values(trades.iter().map(|t| t.iv))),
    ];
    RecordBatch::try_new(canonical_schema(), columns)
}

/// Min/max pair in the metadata record. `None` when every value was NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// The `metadata.json` record persisted next to each trade table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    pub instrument: String,
    pub asset: String,
    pub expiry_date: String,
    pub strike_price: i64,
    pub option_type: OptionType,
    pub total_trades: usize,
    pub total_volume: f64,
    pub first_trade: String,
    pub last_trade: String,
    pub price_range: ValueRange,
    pub iv_range: ValueRange,
    pub data_files_processed: usize,
}

/// On-disk format of the per-instrument trade table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OutputFormat {
    #[serde(rename = "parquet")]
    Parquet,
    #[serde(rename = "feather")]
    Feather,
}

impl OutputFormat {
    pub fn trades_file_name(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "trades.parquet",
            OutputFormat::Feather => "trades.feather",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Parquet => write!(f, "parquet"),
            OutputFormat::Feather => write!(f, "feather"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parquet" => Ok(OutputFormat::Parquet),
            "feather" | "arrow" | "ipc" => Ok(OutputFormat::Feather),
            _ => Err(ConfigError::InvalidValue {
                key: "output_format",
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration for a re-partitioning run
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub file_pattern: String,
    pub output_format: OutputFormat,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
    #[serde(default = "default_progress_every_files")]
    pub progress_every_files: usize,
    #[serde(default = "default_progress_every_instruments")]
    pub progress_every_instruments: usize,
    pub log_level: String,
}

fn default_num_threads() -> usize {
    4
}

fn default_zstd_level() -> i32 {
    3
}

fn default_progress_every_files() -> usize {
    50
}

fn default_progress_every_instruments() -> usize {
    100
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("./data/raw/options/feather/deribit/BTC"),
            output_dir: PathBuf::from("./data/parsed/options"),
            file_pattern: "*.feather".to_string(),
            output_format: OutputFormat::Parquet,
            num_threads: default_num_threads(),
            zstd_level: default_zstd_level(),
            progress_every_files: default_progress_every_files(),
            progress_every_instruments: default_progress_every_instruments(),
            log_level: "INFO".to_string(),
        }
    }
}

impl PartitionConfig {
    /// Load from a JSON file. A missing file yields the defaults; a malformed one is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `OPTIONS_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("OPTIONS_INPUT_DIR") {
            self.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("OPTIONS_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(pattern) = lookup("OPTIONS_FILE_PATTERN") {
            self.file_pattern = pattern;
        }
        if let Some(format) = lookup("OPTIONS_OUTPUT_FORMAT") {
            self.output_format = format.parse()?;
        }
        if let Some(threads) = lookup("OPTIONS_NUM_THREADS") {
            self.num_threads = threads
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "num_threads",
                    value: threads.clone(),
                })?;
        }
        if let Some(level) = lookup("OPTIONS_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Worker count, never zero.
    pub fn worker_threads(&self) -> usize {
        self.num_threads.max(1)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}
