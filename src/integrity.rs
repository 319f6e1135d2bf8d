//! Audits for both ends of the pipeline: raw daily files before a run and the
//! published instrument directories after it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use arrow::array::{Array, Int64Array, StringArray};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::aggregator::FileFailure;
use crate::data_loader::{discover_files, load_trade_file};
use crate::error::PipelineError;
use crate::metrics::{approx_eq, compute_trade_stats, format_timestamp_us};
use crate::model_types::{typed_column, ID_COLUMN, INSTRUMENT_COLUMN, TIMESTAMP_COLUMN};
use crate::storage::{find_trades_file, list_instrument_dirs, read_metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdOrdering {
    Monotonic,
    NotMonotonic,
    /// No id in the file parses as an integer.
    NotNumeric,
}

/// Largest distance between consecutive trades of a file, in timestamp order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGap {
    pub start_us: i64,
    pub end_us: i64,
}

impl TimeGap {
    pub fn duration_us(&self) -> i64 {
        self.end_us - self.start_us
    }

    pub fn hours(&self) -> f64 {
        self.duration_us() as f64 / 3_600_000_000.0
    }
}

/// Findings for one daily source file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileIntegrity {
    pub path: PathBuf,
    pub rows: usize,
    /// Distinct ids that occur more than once, in first-seen order.
    pub duplicate_ids: Vec<String>,
    /// Rows carrying one of the duplicated ids.
    pub duplicate_rows: usize,
    /// Date parsed from a `YYYY-MM-DD` file stem.
    pub expected_date: Option<NaiveDate>,
    pub spillover_rows: usize,
    pub timestamps_sorted: bool,
    pub id_ordering: IdOrdering,
    pub largest_gap: Option<TimeGap>,
}

impl FileIntegrity {
    pub fn issue_count(&self) -> usize {
        [
            !self.duplicate_ids.is_empty(),
            self.spillover_rows > 0,
            !self.timestamps_sorted,
            self.id_ordering == IdOrdering::NotMonotonic,
        ]
        .iter()
        .filter(|&&issue| issue)
        .count()
    }
}

pub fn check_source_file(path: &Path) -> Result<FileIntegrity, String> {
    let batch = load_trade_file(path).map_err(|e| e.to_string())?;
    check_batch(path, &batch).map_err(|e| e.to_string())
}

pub fn check_batch(path: &Path, batch: &RecordBatch) -> Result<FileIntegrity, ArrowError> {
    let ids = typed_column::<StringArray>(batch, ID_COLUMN)?;
    let timestamps = typed_column::<Int64Array>(batch, TIMESTAMP_COLUMN)?;
    let ts = timestamps.values();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for id in ids.iter().flatten() {
        let count = counts.entry(id).or_insert(0);
        if *count == 1 {
            order.push(id);
        }
        *count += 1;
    }
    let duplicate_rows = order.iter().map(|id| counts[id]).sum();
    let duplicate_ids = order.into_iter().map(str::to_string).collect();

    let expected_date = path
        .file_stem()
        .and_then(|stem| NaiveDate::parse_from_str(&stem.to_string_lossy(), "%Y-%m-%d").ok());
    let spillover_rows = match expected_date {
        Some(date) => ts
            .iter()
            .filter(|&&t| DateTime::from_timestamp_micros(t).map(|dt| dt.date_naive()) != Some(date))
            .count(),
        None => 0,
    };

    let numeric_ids: Vec<i64> = ids.iter().flatten().filter_map(|id| id.trim().parse().ok()).collect();
    let id_ordering = if numeric_ids.is_empty() && batch.num_rows() > 1 {
        IdOrdering::NotNumeric
    } else if numeric_ids.windows(2).all(|w| w[0] <= w[1]) {
        IdOrdering::Monotonic
    } else {
        IdOrdering::NotMonotonic
    };

    Ok(FileIntegrity {
        path: path.to_path_buf(),
        rows: batch.num_rows(),
        duplicate_ids,
        duplicate_rows,
        expected_date,
        spillover_rows,
        timestamps_sorted: ts.windows(2).all(|w| w[0] <= w[1]),
        id_ordering,
        largest_gap: largest_gap(ts),
    })
}

fn largest_gap(timestamps: &[i64]) -> Option<TimeGap> {
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted
        .windows(2)
        .map(|w| TimeGap { start_us: w[0], end_us: w[1] })
        .fold(None, |best: Option<TimeGap>, gap| match best {
            Some(b) if b.duration_us() >= gap.duration_us() => Some(b),
            _ => Some(gap),
        })
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub files: Vec<FileIntegrity>,
    pub unreadable: Vec<FileFailure>,
}

impl IntegrityReport {
    pub fn total_rows(&self) -> usize {
        self.files.iter().map(|f| f.rows).sum()
    }

    pub fn files_with_duplicates(&self) -> usize {
        self.files.iter().filter(|f| !f.duplicate_ids.is_empty()).count()
    }

    pub fn files_with_spillover(&self) -> usize {
        self.files.iter().filter(|f| f.spillover_rows > 0).count()
    }

    pub fn files_out_of_order(&self) -> usize {
        self.files
            .iter()
            .filter(|f| !f.timestamps_sorted || f.id_ordering == IdOrdering::NotMonotonic)
            .count()
    }

    pub fn issue_count(&self) -> usize {
        self.files.iter().map(FileIntegrity::issue_count).sum::<usize>() + self.unreadable.len()
    }

    pub fn largest_gap(&self) -> Option<(&Path, TimeGap)> {
        self.files
            .iter()
            .filter_map(|f| f.largest_gap.map(|gap| (f.path.as_path(), gap)))
            .max_by_key(|(_, gap)| gap.duration_us())
    }
}

/// Check every file matching `pattern` in `dir`.
pub fn check_source_dir(dir: &Path, pattern: &str) -> Result<IntegrityReport, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingInputDir(dir.to_path_buf()));
    }
    let files = discover_files(dir, pattern)?;
    if files.is_empty() {
        return Err(PipelineError::NoInputFiles {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
        });
    }

    let results: Vec<(PathBuf, Result<FileIntegrity, String>)> = files
        .into_par_iter()
        .map(|path| {
            let result = check_source_file(&path);
            (path, result)
        })
        .collect();

    let mut report = IntegrityReport::default();
    for (path, result) in results {
        match result {
            Ok(file) => {
                if file.issue_count() > 0 {
                    debug!("{}: {} issue(s)", path.display(), file.issue_count());
                }
                report.files.push(file);
            }
            Err(error) => {
                warn!("Error reading {}: {}", path.display(), error);
                report.unreadable.push(FileFailure { path, error });
            }
        }
    }
    Ok(report)
}

/// Consistency findings for one published instrument directory.
#[derive(Debug, Clone)]
pub struct PartitionCheck {
    pub dir: PathBuf,
    pub rows: usize,
    pub problems: Vec<String>,
}

impl PartitionCheck {
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Verify that a directory's metadata describes its trade table and that the
/// table is sorted, deduplicated and holds only its own instrument.
pub fn verify_partition(dir: &Path) -> PartitionCheck {
    let mut check = PartitionCheck {
        dir: dir.to_path_buf(),
        rows: 0,
        problems: Vec::new(),
    };
    if let Err(problem) = verify_into(dir, &mut check) {
        check.problems.push(problem);
    }
    check
}

fn verify_into(dir: &Path, check: &mut PartitionCheck) -> Result<(), String> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let metadata = read_metadata(dir).map_err(|e| format!("metadata unreadable: {}", e))?;
    let trades_file = find_trades_file(dir).ok_or("trade table missing")?;
    let batch = load_trade_file(&trades_file).map_err(|e| format!("trade table unreadable: {}", e))?;
    check.rows = batch.num_rows();

    let problems = &mut check.problems;
    if metadata.instrument != name {
        problems.push(format!("metadata names {} but directory is {}", metadata.instrument, name));
    }
    if metadata.total_trades != batch.num_rows() {
        problems.push(format!(
            "total_trades {} but table has {} rows",
            metadata.total_trades,
            batch.num_rows()
        ));
    }

    let arrow_err = |e: ArrowError| e.to_string();
    let stats = compute_trade_stats(&batch).map_err(arrow_err)?;
    if !approx_eq(metadata.total_volume, stats.total_volume) {
        problems.push(format!(
            "total_volume {} but quantities sum to {}",
            metadata.total_volume, stats.total_volume
        ));
    }

    let timestamps = typed_column::<Int64Array>(&batch, TIMESTAMP_COLUMN).map_err(arrow_err)?;
    let ts = timestamps.values();
    if !ts.windows(2).all(|w| w[0] <= w[1]) {
        problems.push("timestamps are not sorted".to_string());
    }
    let first = ts.first().map(|&t| format_timestamp_us(t)).unwrap_or_default();
    let last = ts.last().map(|&t| format_timestamp_us(t)).unwrap_or_default();
    if metadata.first_trade != first || metadata.last_trade != last {
        problems.push(format!(
            "trade span {}..{} but table spans {}..{}",
            metadata.first_trade, metadata.last_trade, first, last
        ));
    }

    let ids = typed_column::<StringArray>(&batch, ID_COLUMN).map_err(arrow_err)?;
    let mut seen = HashSet::with_capacity(ids.len());
    let duplicates = ids.iter().flatten().filter(|id| !seen.insert(*id)).count();
    if duplicates > 0 {
        problems.push(format!("{} duplicate trade id(s)", duplicates));
    }

    let instruments = typed_column::<StringArray>(&batch, INSTRUMENT_COLUMN).map_err(arrow_err)?;
    let foreign = instruments.iter().flatten().filter(|i| *i != name).count();
    if foreign > 0 {
        problems.push(format!("{} row(s) belong to another instrument", foreign));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub checks: Vec<PartitionCheck>,
}

impl VerificationReport {
    pub fn inconsistent(&self) -> impl Iterator<Item = &PartitionCheck> {
        self.checks.iter().filter(|c| !c.is_consistent())
    }

    pub fn total_rows(&self) -> usize {
        self.checks.iter().map(|c| c.rows).sum()
    }
}

pub fn verify_output_dir(root: &Path) -> std::io::Result<VerificationReport> {
    let dirs = list_instrument_dirs(root)?;
    let checks = dirs.par_iter().map(|dir| verify_partition(dir)).collect();
    Ok(VerificationReport { checks })
}
