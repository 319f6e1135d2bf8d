//! The two-pass re-partitioning run: scan every daily file into per-instrument
//! accumulations, then write each instrument out on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, info, warn};

use crate::aggregator::{Accumulation, Aggregator, FileFailure, ScanStats};
use crate::data_loader::{discover_files, TradeSource};
use crate::error::{PipelineError, Result, WriteError};
use crate::instrument_writer::{InstrumentWriter, SavedInstrument};
use crate::model_types::PartitionConfig;
use crate::storage::{InstrumentStore, RecoveryReport};

/// Result of handing one instrument to the writer.
#[derive(Debug)]
pub enum InstrumentOutcome {
    Saved(SavedInstrument),
    Failed { instrument: String, error: WriteError },
    /// Not attempted because the run was cancelled.
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct InstrumentFailure {
    pub instrument: String,
    pub error: String,
}

/// Aggregate counters of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub files_found: usize,
    pub files_processed: usize,
    pub files_empty: usize,
    pub files_failed: Vec<FileFailure>,
    pub total_trades_seen: usize,
    pub instruments_found: usize,
    pub instruments_saved: usize,
    pub trades_saved: usize,
    pub decode_failures: Vec<InstrumentFailure>,
    pub merge_failures: Vec<InstrumentFailure>,
    pub persist_failures: Vec<InstrumentFailure>,
    pub recovered: RecoveryReport,
    pub elapsed: Duration,
}

impl RunReport {
    fn new(files_found: usize, scan: ScanStats, recovered: RecoveryReport) -> Self {
        Self {
            files_found,
            files_processed: scan.files_processed,
            files_empty: scan.files_empty,
            files_failed: scan.files_failed,
            total_trades_seen: scan.total_trades,
            recovered,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: InstrumentOutcome) {
        match outcome {
            InstrumentOutcome::Saved(saved) => {
                self.instruments_saved += 1;
                self.trades_saved += saved.trades;
            }
            InstrumentOutcome::Failed { instrument, error } => {
                let bucket = match error {
                    WriteError::Decode(_) => &mut self.decode_failures,
                    WriteError::Merge(_) => &mut self.merge_failures,
                    WriteError::Persist(_) => &mut self.persist_failures,
                };
                bucket.push(InstrumentFailure {
                    instrument,
                    error: error.to_string(),
                });
            }
            InstrumentOutcome::Skipped(_) => {}
        }
    }

    pub fn instruments_failed(&self) -> usize {
        self.decode_failures.len() + self.merge_failures.len() + self.persist_failures.len()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Files found:          {}", self.files_found)?;
        writeln!(f, "Files processed:      {}", self.files_processed)?;
        writeln!(f, "Files empty:          {}", self.files_empty)?;
        writeln!(f, "Files failed:         {}", self.files_failed.len())?;
        writeln!(f, "Total trades seen:    {}", self.total_trades_seen)?;
        writeln!(f, "Instruments found:    {}", self.instruments_found)?;
        writeln!(f, "Instruments saved:    {}", self.instruments_saved)?;
        writeln!(f, "Total trades saved:   {}", self.trades_saved)?;
        writeln!(f, "Decode failures:      {}", self.decode_failures.len())?;
        writeln!(f, "Merge failures:       {}", self.merge_failures.len())?;
        writeln!(f, "Persist failures:     {}", self.persist_failures.len())?;
        write!(f, "Elapsed:              {:.2}s", self.elapsed.as_secs_f64())?;

        for failure in &self.files_failed {
            write!(f, "\n  file {}: {}", failure.path.display(), failure.error)?;
        }
        let instrument_failures = self
            .decode_failures
            .iter()
            .chain(&self.merge_failures)
            .chain(&self.persist_failures);
        for failure in instrument_failures {
            write!(f, "\n  instrument {}: {}", failure.instrument, failure.error)?;
        }
        Ok(())
    }
}

/// Run both passes over `config.input_dir`.
///
/// Only precondition failures and cancellation are returned as errors; a
/// broken file or instrument is logged and recorded in the report.
pub fn run(config: &PartitionConfig, source: &dyn TradeSource, cancel: &AtomicBool) -> Result<RunReport> {
    let started = Instant::now();

    if !config.input_dir.is_dir() {
        return Err(PipelineError::MissingInputDir(config.input_dir.clone()));
    }
    let files = discover_files(&config.input_dir, &config.file_pattern)?;
    if files.is_empty() {
        return Err(PipelineError::NoInputFiles {
            dir: config.input_dir.clone(),
            pattern: config.file_pattern.clone(),
        });
    }

    let output_error = |source| PipelineError::OutputDir {
        path: config.output_dir.clone(),
        source,
    };
    fs::create_dir_all(&config.output_dir).map_err(output_error)?;
    let store = InstrumentStore::new(&config.output_dir, config.output_format, config.zstd_level);
    let recovered = store.recover().map_err(output_error)?;

    info!(
        "Found {} files in {} (output: {}, format: {})",
        files.len(),
        config.input_dir.display(),
        config.output_dir.display(),
        config.output_format
    );

    let pool = build_pool(config.worker_threads())?;

    let mut aggregator = Aggregator::new(config.progress_every_files);
    aggregator.scan(source, &files, pool.as_ref(), cancel)?;
    let (accumulations, scan) = aggregator.finish();
    info!(
        "Scan complete: {} trades across {} unique instruments",
        scan.total_trades,
        accumulations.len()
    );

    let mut report = RunReport::new(files.len(), scan, recovered);
    report.instruments_found = accumulations.len();

    let writer = InstrumentWriter::new(store);
    let outcomes = write_instruments(
        &writer,
        accumulations,
        pool.as_ref(),
        cancel,
        config.progress_every_instruments,
    );
    if cancel.load(Ordering::Relaxed) {
        let saved = outcomes
            .iter()
            .filter(|o| matches!(o, InstrumentOutcome::Saved(_)))
            .count();
        warn!(
            "Write pass interrupted after saving {}/{} instruments",
            saved, report.instruments_found
        );
        return Err(PipelineError::Interrupted);
    }

    for outcome in outcomes {
        report.record(outcome);
    }
    report.elapsed = started.elapsed();
    info!(
        "Saved {}/{} instruments ({} trades) in {:.2}s",
        report.instruments_saved,
        report.instruments_found,
        report.trades_saved,
        report.elapsed.as_secs_f64()
    );
    Ok(report)
}

fn build_pool(threads: usize) -> Result<Option<ThreadPool>> {
    if threads <= 1 {
        return Ok(None);
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("partition-worker-{}", i))
        .build()?;
    Ok(Some(pool))
}

/// Second pass. Each accumulation is moved into its own task so its memory is
/// released once the instrument is written.
fn write_instruments(
    writer: &InstrumentWriter,
    accumulations: BTreeMap<String, Accumulation>,
    pool: Option<&ThreadPool>,
    cancel: &AtomicBool,
    progress_every: usize,
) -> Vec<InstrumentOutcome> {
    let total = accumulations.len();
    let progress_every = progress_every.max(1);
    let done = AtomicUsize::new(0);

    let process = |(instrument, accumulation): (String, Accumulation)| {
        if cancel.load(Ordering::Relaxed) {
            return InstrumentOutcome::Skipped(instrument);
        }

        let outcome = match writer.process(&instrument, accumulation) {
            Ok(saved) => InstrumentOutcome::Saved(saved),
            Err(error) => {
                match &error {
                    WriteError::Decode(_) => warn!("Skipping {}: {}", instrument, error),
                    _ => error!("Error saving {}: {}", instrument, error),
                }
                InstrumentOutcome::Failed { instrument, error }
            }
        };

        let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
        if finished % progress_every == 0 || finished == total {
            info!("Processed {}/{} instruments...", finished, total);
        }
        outcome
    };

    match pool {
        Some(pool) => pool.install(|| accumulations.into_par_iter().map(&process).collect()),
        None => accumulations.into_iter().map(process).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::DataLoader;
    use crate::error::SourceFileError;
    use crate::integrity::verify_output_dir;
    use crate::model_types::{trades_to_batch, OutputFormat, TradeRecord};
    use crate::storage::{read_metadata, write_trade_table};
    use arrow::record_batch::RecordBatch;
    use std::path::Path;

    /// Loads from disk and raises the cancel flag once `trigger` has been read.
    struct CancelAfter<'a> {
        cancel: &'a AtomicBool,
        trigger: &'a str,
    }

    impl TradeSource for CancelAfter<'_> {
        fn load(&self, path: &Path) -> std::result::Result<RecordBatch, SourceFileError> {
            let batch = DataLoader::new().load(path);
            if path.ends_with(self.trigger) {
                self.cancel.store(true, Ordering::SeqCst);
            }
            batch
        }
    }

    fn config(input: &Path, output: &Path, threads: usize) -> PartitionConfig {
        PartitionConfig {
            input_dir: input.to_path_buf(),
            output_dir: output.to_path_buf(),
            num_threads: threads,
            ..PartitionConfig::default()
        }
    }

    fn write_day(dir: &Path, name: &str, rows: &[TradeRecord]) {
        let batch = trades_to_batch(rows).unwrap();
        write_trade_table(&dir.join(name), &batch, OutputFormat::Feather, 3, &[]).unwrap();
    }

    #[test]
    fn test_missing_input_dir_is_a_precondition_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(&tmp.path().join("absent"), &tmp.path().join("out"), 1);
        let err = run(&cfg, &DataLoader::new(), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInputDir(_)));
        assert!(err.is_precondition());
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn test_no_matching_files_is_a_precondition_failure() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("notes.txt"), b"nothing here").unwrap();
        let cfg = config(tmp.path(), &tmp.path().join("out"), 1);
        let err = run(&cfg, &DataLoader::new(), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, PipelineError::NoInputFiles { .. }));
    }

    #[test]
    fn test_report_counts_saved_and_failed_instruments() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_day(
            input.path(),
            "2019-07-18.feather",
            &[
                TradeRecord::new("BTC-19JUL19-10000-P", "1", 10, 0.1, 1.0, 60.0),
                TradeRecord::new("BTC-PERPETUAL", "2", 11, 9800.0, 5.0, 0.0),
                TradeRecord::new("ETH-26JUL19-200-C", "3", 12, 0.02, 2.0, 70.0),
            ],
        );
        fs::write(input.path().join("2019-07-19.feather"), b"not arrow").unwrap();

        let report = run(&config(input.path(), output.path(), 2), &DataLoader::new(), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.files_found, 2);
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.files_failed.len(), 1);
        assert_eq!(report.total_trades_seen, 3);
        assert_eq!(report.instruments_found, 3);
        assert_eq!(report.instruments_saved, 2);
        assert_eq!(report.trades_saved, 2);
        assert_eq!(report.decode_failures.len(), 1);
        assert_eq!(report.decode_failures[0].instrument, "BTC-PERPETUAL");
        assert_eq!(report.instruments_failed(), 1);

        let rendered = report.to_string();
        assert!(rendered.contains("Instruments saved:    2"));
        assert!(rendered.contains("instrument BTC-PERPETUAL"));
    }

    #[test]
    fn test_cancelled_run_is_interrupted() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_day(
            input.path(),
            "2019-07-18.feather",
            &[TradeRecord::new("BTC-19JUL19-10000-P", "1", 10, 0.1, 1.0, 60.0)],
        );

        let err = run(&config(input.path(), output.path(), 1), &DataLoader::new(), &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted));
        assert!(!err.is_precondition());
        assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cancel_during_write_pass_keeps_published_pairs_complete() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let put = "BTC-19JUL19-10000-P";
        let call = "ETH-26JUL19-200-C";
        write_day(
            input.path(),
            "2019-07-18.feather",
            &[
                TradeRecord::new(put, "1", 10, 0.1, 1.0, 60.0),
                TradeRecord::new(call, "2", 11, 0.02, 2.0, 70.0),
            ],
        );
        let cfg = config(input.path(), output.path(), 1);
        run(&cfg, &DataLoader::new(), &AtomicBool::new(false)).unwrap();

        write_day(
            input.path(),
            "2019-07-19.feather",
            &[TradeRecord::new(put, "3", 20, 0.1, 5.0, 61.0)],
        );
        // the last file trips the flag, so the scan completes and the writer sees it
        let cancel = AtomicBool::new(false);
        let source = CancelAfter {
            cancel: &cancel,
            trigger: "2019-07-19.feather",
        };
        let err = run(&cfg, &source, &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted));

        let verification = verify_output_dir(output.path()).unwrap();
        assert_eq!(verification.checks.len(), 2);
        assert_eq!(verification.inconsistent().count(), 0);
        assert_eq!(read_metadata(&output.path().join(put)).unwrap().total_trades, 1);

        let hidden = fs::read_dir(output.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(hidden, 0);
    }
}
