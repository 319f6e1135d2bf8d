use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::error::PersistError;
use crate::model_types::OutputFormat;

/// Schema version for forward compatibility
/// Increment this when making breaking schema changes
pub const TRADES_SCHEMA_VERSION: &str = "1.0";

/// Rows per parquet row group. Per-instrument tables are small; this keeps
/// the larger ones seekable without fragmenting the rest.
const MAX_ROW_GROUP_SIZE: usize = 65_536;

/// Write one trade table to `path` in the requested format and fsync it.
///
/// `key_values` are stored as parquet file metadata next to `schema_version`;
/// the feather writer ignores them.
pub fn write_trade_table(
    path: &Path,
    batch: &RecordBatch,
    format: OutputFormat,
    zstd_level: i32,
    key_values: &[(String, String)],
) -> Result<(), PersistError> {
    let file = File::create(path)?;
    match format {
        OutputFormat::Parquet => write_parquet(file, batch, zstd_level, key_values)?,
        OutputFormat::Feather => write_feather(file, batch)?,
    }
    debug!("Wrote {} rows to {}", batch.num_rows(), path.display());
    Ok(())
}

fn write_parquet(
    file: File,
    batch: &RecordBatch,
    zstd_level: i32,
    key_values: &[(String, String)],
) -> Result<(), PersistError> {
    let mut metadata = vec![KeyValue::new(
        "schema_version".to_string(),
        TRADES_SCHEMA_VERSION.to_string(),
    )];
    metadata.extend(
        key_values
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
    );

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(zstd_level)?))
        .set_max_row_group_size(MAX_ROW_GROUP_SIZE)
        .set_key_value_metadata(Some(metadata))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    let file = writer.into_inner()?;
    file.sync_all()?;
    Ok(())
}

fn write_feather(file: File, batch: &RecordBatch) -> Result<(), PersistError> {
    let mut writer = FileWriter::try_new(BufWriter::new(file), &batch.schema())?;
    writer.write(batch)?;
    writer.finish()?;
    let file = writer
        .into_inner()?
        .into_inner()
        .map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::load_trade_file;
    use crate::model_types::{trades_to_batch, TradeRecord};
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn batch() -> RecordBatch {
        trades_to_batch(&[
            TradeRecord::new("BTC-27DEC19-8000-C", "a", 1, 0.1, 1.0, 70.0),
            TradeRecord::new("BTC-27DEC19-8000-C", "b", 2, 0.2, 2.0, 71.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_parquet_carries_schema_version_and_extra_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.parquet");
        let extra = vec![("instrument".to_string(), "BTC-27DEC19-8000-C".to_string())];
        write_trade_table(&path, &batch(), OutputFormat::Parquet, 3, &extra).unwrap();

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        let kv = reader
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .cloned()
            .unwrap_or_default();
        let lookup = |key: &str| kv.iter().find(|e| e.key == key).and_then(|e| e.value.clone());
        assert_eq!(lookup("schema_version").as_deref(), Some(TRADES_SCHEMA_VERSION));
        assert_eq!(lookup("instrument").as_deref(), Some("BTC-27DEC19-8000-C"));
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }

    #[test]
    fn test_feather_round_trips_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.feather");
        write_trade_table(&path, &batch(), OutputFormat::Feather, 3, &[]).unwrap();
        let loaded = load_trade_file(&path).unwrap();
        assert_eq!(loaded.num_rows(), 2);
        assert_eq!(TradeRecord::from_batch(&loaded).unwrap()[1].id, "b");
    }

    #[test]
    fn test_invalid_zstd_level_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.parquet");
        assert!(write_trade_table(&path, &batch(), OutputFormat::Parquet, 99, &[]).is_err());
    }
}
