use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::array::{StringArray, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info, warn};

use crate::data_loader::TradeSource;
use crate::error::{PipelineError, SourceFileError};
use crate::model_types::{typed_column, INSTRUMENT_COLUMN};

/// Every batch seen for one instrument, in file order.
#[derive(Debug, Default)]
pub struct Accumulation {
    batches: Vec<RecordBatch>,
    files_contributed: usize,
}

impl Accumulation {
    pub fn new(batches: Vec<RecordBatch>, files_contributed: usize) -> Self {
        Self {
            batches,
            files_contributed,
        }
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn files_contributed(&self) -> usize {
        self.files_contributed
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }
}

#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Counters for the file-scan pass.
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub files_seen: usize,
    pub files_processed: usize,
    pub files_empty: usize,
    pub files_failed: Vec<FileFailure>,
    pub total_trades: usize,
}

/// Owner of all per-instrument accumulations during the file-scan pass.
#[derive(Debug, Default)]
pub struct Aggregator {
    accumulations: BTreeMap<String, Accumulation>,
    stats: ScanStats,
    progress_every: usize,
}

impl Aggregator {
    pub fn new(progress_every: usize) -> Self {
        Self {
            progress_every: progress_every.max(1),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn instrument_count(&self) -> usize {
        self.accumulations.len()
    }

    pub fn accumulation(&self, instrument: &str) -> Option<&Accumulation> {
        self.accumulations.get(instrument)
    }

    /// Scan `files` in order. Loading may run on `pool`; folding into the
    /// accumulations is always sequential in file order.
    pub fn scan(
        &mut self,
        source: &dyn TradeSource,
        files: &[PathBuf],
        pool: Option<&ThreadPool>,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let chunk_size = pool.map(|p| p.current_num_threads()).unwrap_or(1).max(1);
        let total = files.len();

        for chunk in files.chunks(chunk_size) {
            if cancel.load(Ordering::Relaxed) {
                warn!(
                    "Scan interrupted after {}/{} files",
                    self.stats.files_seen, total
                );
                return Err(PipelineError::Interrupted);
            }

            let loaded: Vec<Result<RecordBatch, SourceFileError>> = match pool {
                Some(pool) => pool.install(|| chunk.par_iter().map(|path| source.load(path)).collect()),
                None => chunk.iter().map(|path| source.load(path)).collect(),
            };

            for (path, result) in chunk.iter().zip(loaded) {
                match result {
                    Ok(batch) => {
                        if let Err(e) = self.ingest(path, &batch) {
                            self.record_failure(path, &e);
                        }
                    }
                    Err(e) => self.record_failure(path, &e),
                }
                self.stats.files_seen += 1;

                let seen = self.stats.files_seen;
                if seen % self.progress_every == 0 || seen == total {
                    info!(
                        "Processed {}/{} files... ({} trades, {} instruments)",
                        seen,
                        total,
                        self.stats.total_trades,
                        self.accumulations.len()
                    );
                }
            }
        }
        Ok(())
    }

    /// Partition one loaded file by instrument and append its batches.
    ///
    /// The file is partitioned completely before anything is appended, so a
    /// failure leaves the existing accumulations untouched.
    pub fn ingest(&mut self, path: &Path, batch: &RecordBatch) -> Result<(), SourceFileError> {
        if batch.num_rows() == 0 {
            debug!("Skipping empty file {}", path.display());
            self.stats.files_empty += 1;
            return Ok(());
        }

        let groups = partition_by_instrument(batch).map_err(|source| SourceFileError::Arrow {
            path: path.to_path_buf(),
            source,
        })?;

        for (instrument, group) in groups {
            let entry = self.accumulations.entry(instrument).or_default();
            entry.batches.push(group);
            entry.files_contributed += 1;
        }
        self.stats.total_trades += batch.num_rows();
        self.stats.files_processed += 1;
        Ok(())
    }

    fn record_failure(&mut self, path: &Path, error: &SourceFileError) {
        warn!("Error processing {}: {}", path.display(), error);
        self.stats.files_failed.push(FileFailure {
            path: path.to_path_buf(),
            error: error.to_string(),
        });
    }

    /// Hand the accumulations over to the writer pass.
    pub fn finish(self) -> (BTreeMap<String, Accumulation>, ScanStats) {
        (self.accumulations, self.stats)
    }
}

/// Split a batch into one sub-batch per distinct raw instrument value,
/// preserving row order inside each group. Groups come out in first-seen order.
pub fn partition_by_instrument(batch: &RecordBatch) -> Result<Vec<(String, RecordBatch)>, ArrowError> {
    let instruments = typed_column::<StringArray>(batch, INSTRUMENT_COLUMN)?;

    let mut order: Vec<&str> = Vec::new();
    let mut rows: HashMap<&str, Vec<u32>> = HashMap::new();
    for (row, instrument) in instruments.iter().enumerate() {
        let instrument = instrument.unwrap_or_default();
        let slot = rows.entry(instrument).or_insert_with(|| {
            order.push(instrument);
            Vec::new()
        });
        slot.push(u32::try_from(row).map_err(|_| {
            ArrowError::ComputeError(format!("row index {} exceeds u32", row))
        })?);
    }

    if order.len() == 1 {
        return Ok(vec![(order[0].to_string(), batch.clone())]);
    }

    let mut groups = Vec::with_capacity(order.len());
    for instrument in order {
        let indices = UInt32Array::from(rows.remove(instrument).unwrap_or_default());
        groups.push((instrument.to_string(), take_record_batch(batch, &indices)?));
    }
    Ok(groups)
}
