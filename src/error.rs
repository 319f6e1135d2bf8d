use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A daily source file could not be loaded. The file is skipped.
#[derive(Debug, Error)]
pub enum SourceFileError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error in {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },
    #[error("arrow error in {path}: {source}")]
    Arrow {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}: missing required column `{column}`")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{path}: column `{column}` has unsupported type {data_type}")]
    UnsupportedType {
        path: PathBuf,
        column: String,
        data_type: String,
    },
    #[error("{path}: column `{column}` contains {nulls} null value(s)")]
    NullValues {
        path: PathBuf,
        column: &'static str,
        nulls: usize,
    },
    #[error("{path}: row {row}: cannot parse `{value}` as {column}")]
    InvalidValue {
        path: PathBuf,
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("{path}: unrecognised file extension")]
    UnknownFormat { path: PathBuf },
}

/// An instrument identifier does not match `ASSET-DDMMMYY-STRIKE-C|P`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("`{identifier}`: expected 4 `-` separated fields, found {found}")]
    FieldCount { identifier: String, found: usize },
    #[error("`{identifier}`: invalid asset symbol `{asset}`")]
    InvalidAsset { identifier: String, asset: String },
    #[error("`{identifier}`: invalid expiry date `{token}`")]
    InvalidExpiry { identifier: String, token: String },
    #[error("`{identifier}`: invalid strike `{token}`")]
    InvalidStrike { identifier: String, token: String },
    #[error("`{identifier}`: unknown option class `{code}`")]
    InvalidOptionClass { identifier: String, code: String },
}

/// An instrument's batches could not be combined into one table.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("instrument has no batches")]
    Empty,
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

/// Writing one instrument's artifact pair failed.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("`{0}` is not usable as a directory name")]
    UnsafeName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Terminal failure for a single instrument during the writer pass.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("persist failed: {0}")]
    Persist(#[from] PersistError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Errors that terminate a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input directory not found: {0}")]
    MissingInputDir(PathBuf),
    #[error("no files matching `{pattern}` in {dir}")]
    NoInputFiles { dir: PathBuf, pattern: String },
    #[error("invalid glob pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("run interrupted")]
    Interrupted,
}

impl PipelineError {
    /// Precondition failures are reported before any file is read.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingInputDir(_)
                | PipelineError::NoInputFiles { .. }
                | PipelineError::Pattern { .. }
                | PipelineError::OutputDir { .. }
                | PipelineError::Config(_)
        )
    }
}
