use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use arrow::array::{new_null_array, Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use deribit_options_parser::integrity::verify_output_dir;
use deribit_options_parser::model_types::trades_to_batch;
use deribit_options_parser::storage::{find_trades_file, read_metadata, write_trade_table};
use deribit_options_parser::{load_trade_file, run, DataLoader, OutputFormat, PartitionConfig, TradeRecord};

const X: &str = "BTC-27DEC19-8000-C";
const Y: &str = "ETH-26JUL19-200-P";

fn trade(instrument: &str, id: &str, ts: i64, quantity: f64) -> TradeRecord {
    TradeRecord::new(instrument, id, ts, 0.01 * (ts % 97) as f64 + 0.01, quantity, 55.0)
}

fn write_day(dir: &Path, name: &str, rows: &[TradeRecord]) {
    let batch = trades_to_batch(rows).unwrap();
    let format = if name.ends_with(".parquet") {
        OutputFormat::Parquet
    } else {
        OutputFormat::Feather
    };
    write_trade_table(&dir.join(name), &batch, format, 3, &[]).unwrap();
}

fn config(input: &Path, output: &Path) -> PartitionConfig {
    PartitionConfig {
        input_dir: input.to_path_buf(),
        output_dir: output.to_path_buf(),
        num_threads: 2,
        ..PartitionConfig::default()
    }
}

fn run_once(config: &PartitionConfig) {
    run(config, &DataLoader::new(), &AtomicBool::new(false)).unwrap();
}

fn rows(dir: &Path) -> Vec<TradeRecord> {
    let table = load_trade_file(&find_trades_file(dir).unwrap()).unwrap();
    TradeRecord::from_batch(&table).unwrap()
}

fn trades_bytes(output: &Path, instrument: &str) -> Vec<u8> {
    fs::read(output.join(instrument).join("trades.parquet")).unwrap()
}

fn two_days(input: &Path) {
    write_day(input, "2019-07-18.feather", &[trade(X, "1", 100, 1.0), trade(X, "2", 50, 2.0)]);
    write_day(input, "2019-07-19.feather", &[trade(X, "1", 100, 1.0), trade(X, "3", 75, 0.5)]);
}

#[test]
fn test_duplicate_across_days_is_merged_once() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    two_days(input.path());

    let report = run(&config(input.path(), output.path()), &DataLoader::new(), &AtomicBool::new(false)).unwrap();
    assert_eq!(report.files_processed, 2);
    assert_eq!(report.total_trades_seen, 4);
    assert_eq!(report.instruments_saved, 1);
    assert_eq!(report.trades_saved, 3);

    let dir = output.path().join(X);
    let saved = rows(&dir);
    assert_eq!(saved.iter().map(|r| r.timestamp_us).collect::<Vec<_>>(), vec![50, 75, 100]);
    assert_eq!(saved.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["2", "3", "1"]);

    let metadata = read_metadata(&dir).unwrap();
    assert_eq!(metadata.total_trades, 3);
    assert_eq!(metadata.data_files_processed, 2);
    assert_eq!(metadata.total_volume, 3.5);
}

#[test]
fn test_rerun_produces_identical_output() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    two_days(input.path());
    let cfg = config(input.path(), output.path());

    run_once(&cfg);
    let first = trades_bytes(output.path(), X);
    let first_meta = fs::read(output.path().join(X).join("metadata.json")).unwrap();
    run_once(&cfg);

    assert_eq!(trades_bytes(output.path(), X), first);
    assert_eq!(fs::read(output.path().join(X).join("metadata.json")).unwrap(), first_meta);
}

#[test]
fn test_exact_duplicate_file_does_not_change_trades() {
    let input = tempfile::tempdir().unwrap();
    let out_once = tempfile::tempdir().unwrap();
    let out_twice = tempfile::tempdir().unwrap();
    two_days(input.path());
    run_once(&config(input.path(), out_once.path()));

    fs::copy(
        input.path().join("2019-07-19.feather"),
        input.path().join("2019-07-20.feather"),
    )
    .unwrap();
    run_once(&config(input.path(), out_twice.path()));

    assert_eq!(trades_bytes(out_once.path(), X), trades_bytes(out_twice.path(), X));
    assert_eq!(read_metadata(&out_twice.path().join(X)).unwrap().data_files_processed, 3);
}

#[test]
fn test_output_is_chronological_across_many_files() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    for day in 0..12i64 {
        let rows: Vec<_> = (0..20i64)
            .map(|i| {
                let id = day * 20 + i;
                let instrument = if id % 3 == 0 { Y } else { X };
                // later files carry earlier timestamps
                trade(instrument, &id.to_string(), (12 - day) * 1_000 + (i * 37) % 20, 1.0)
            })
            .collect();
        write_day(input.path(), &format!("2019-07-{:02}.feather", day + 1), &rows);
    }

    let report = run(&config(input.path(), output.path()), &DataLoader::new(), &AtomicBool::new(false)).unwrap();
    assert_eq!(report.instruments_saved, 2);
    assert_eq!(report.trades_saved, 240);

    for instrument in [X, Y] {
        let ts: Vec<i64> = rows(&output.path().join(instrument)).iter().map(|r| r.timestamp_us).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]), "{} not sorted", instrument);
    }
    let verification = verify_output_dir(output.path()).unwrap();
    assert_eq!(verification.checks.len(), 2);
    assert_eq!(verification.inconsistent().count(), 0);
}

#[test]
fn test_corrupt_file_and_bad_instrument_are_isolated() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_day(
        input.path(),
        "2019-07-18.feather",
        &[trade(X, "1", 10, 1.0), trade("BTC-PERPETUAL", "2", 11, 1.0), trade(Y, "3", 12, 1.0)],
    );
    fs::write(input.path().join("2019-07-19.feather"), b"truncated").unwrap();
    write_day(input.path(), "2019-07-20.feather", &[trade(X, "4", 20, 1.0)]);

    let report = run(&config(input.path(), output.path()), &DataLoader::new(), &AtomicBool::new(false)).unwrap();
    assert_eq!(report.files_failed.len(), 1);
    assert_eq!(report.decode_failures.len(), 1);
    assert_eq!(report.instruments_saved, 2);

    let mut dirs: Vec<PathBuf> = fs::read_dir(output.path()).unwrap().map(|e| e.unwrap().path()).collect();
    dirs.sort();
    assert_eq!(dirs, vec![output.path().join(X), output.path().join(Y)]);
    assert_eq!(rows(&output.path().join(X)).len(), 2);
}

fn with_null_column(rows: &[TradeRecord], name: &str) -> RecordBatch {
    let batch = trades_to_batch(rows).unwrap();
    let mut fields: Vec<Field> = batch.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(name, DataType::Null, true));
    let mut columns = batch.columns().to_vec();
    columns.push(new_null_array(&DataType::Null, batch.num_rows()));
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap()
}

#[test]
fn test_mixed_source_formats_and_feather_output() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_day(input.path(), "2019-07-18.parquet", &[trade(Y, "1", 5, 1.0)]);
    // no block trades that day, so the column is typed Null
    write_trade_table(
        &input.path().join("2019-07-19.feather"),
        &with_null_column(&[trade(Y, "2", 3, 4.0)], "block_trade_id"),
        OutputFormat::Feather,
        3,
        &[],
    )
    .unwrap();
    fs::write(
        input.path().join("2019-07-20.csv"),
        format!("instrument,id,timestamp,price,quantity,iv,block_trade_id\n{},3,4,0.05,0.5,55.0,BT-77\n", Y),
    )
    .unwrap();

    let cfg = PartitionConfig {
        file_pattern: "2019-07-*".to_string(),
        output_format: OutputFormat::Feather,
        num_threads: 1,
        ..config(input.path(), output.path())
    };
    let report = run(&cfg, &DataLoader::new(), &AtomicBool::new(false)).unwrap();
    assert_eq!(report.files_processed, 3);
    assert!(report.merge_failures.is_empty(), "{:?}", report.merge_failures);

    let dir = output.path().join(Y);
    assert!(dir.join("trades.feather").is_file());
    let metadata = read_metadata(&dir).unwrap();
    assert_eq!(metadata.total_trades, 3);
    assert_eq!(metadata.total_volume, 5.5);
    assert_eq!(metadata.strike_price, 200);
    assert_eq!(metadata.expiry_date, "2019-07-26");
    assert_eq!(metadata.data_files_processed, 3);
    assert_eq!(rows(&dir).iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["2", "3", "1"]);

    let table = load_trade_file(&dir.join("trades.feather")).unwrap();
    let block = table.column_by_name("block_trade_id").unwrap();
    let block = block.as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(block.iter().collect::<Vec<_>>(), vec![None, Some("BT-77"), None]);
}

#[test]
fn test_missing_input_dir_fails_before_processing() {
    let output = tempfile::tempdir().unwrap();
    let cfg = config(&output.path().join("absent"), &output.path().join("out"));
    let err = run(&cfg, &DataLoader::new(), &AtomicBool::new(false)).unwrap_err();
    assert!(err.is_precondition());
    assert!(!output.path().join("out").exists());
}
