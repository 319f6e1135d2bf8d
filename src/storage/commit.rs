//! Atomic publication of an instrument's artifact pair.
//!
//! Both files are written into a hidden staging directory next to the target
//! and the directory is renamed into place, so a reader of the output tree
//! sees either the previous pair, the new pair, or (briefly, on rerun) no
//! directory at all. Never a trade table without its metadata.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use tracing::{debug, info, warn};

use crate::error::PersistError;
use crate::model_types::{InstrumentMetadata, OutputFormat};
use crate::storage::parquet_writer::write_trade_table;

pub const METADATA_FILE_NAME: &str = "metadata.json";

const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Leftovers cleaned up by [`InstrumentStore::recover`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub staging_removed: usize,
    pub retired_restored: usize,
    pub retired_removed: usize,
}

/// Flat `<root>/<instrument>/` store of artifact pairs.
#[derive(Debug, Clone)]
pub struct InstrumentStore {
    root: PathBuf,
    format: OutputFormat,
    zstd_level: i32,
}

impl InstrumentStore {
    pub fn new(root: &Path, format: OutputFormat, zstd_level: i32) -> Self {
        Self {
            root: root.to_path_buf(),
            format,
            zstd_level,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instrument_dir(&self, instrument: &str) -> PathBuf {
        self.root.join(instrument)
    }

    /// Write `trades` and `metadata` for `instrument` and publish them together.
    pub fn commit(
        &self,
        instrument: &str,
        trades: &RecordBatch,
        metadata: &InstrumentMetadata,
    ) -> Result<PathBuf, PersistError> {
        if !is_safe_dir_name(instrument) {
            return Err(PersistError::UnsafeName(instrument.to_string()));
        }
        fs::create_dir_all(&self.root)?;

        let pid = std::process::id();
        let staging = self.root.join(format!("{STAGING_PREFIX}{instrument}-{pid}"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging)?;

        if let Err(e) = self.write_pair(&staging, instrument, trades, metadata) {
            remove_quietly(&staging);
            return Err(e);
        }

        let target = self.instrument_dir(instrument);
        let retired = self.root.join(format!("{RETIRED_PREFIX}{instrument}-{pid}"));
        let had_previous = target.exists();
        if had_previous {
            if retired.exists() {
                fs::remove_dir_all(&retired)?;
            }
            if let Err(e) = fs::rename(&target, &retired) {
                remove_quietly(&staging);
                return Err(e.into());
            }
        }

        if let Err(e) = fs::rename(&staging, &target) {
            if had_previous {
                if let Err(restore) = fs::rename(&retired, &target) {
                    warn!(
                        "Failed to restore previous dataset for {}: {}",
                        instrument, restore
                    );
                }
            }
            remove_quietly(&staging);
            return Err(e.into());
        }

        if had_previous {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("Failed to remove retired dataset {}: {}", retired.display(), e);
            }
        }
        sync_dir(&self.root);

        debug!("Published {} ({} trades)", target.display(), trades.num_rows());
        Ok(target)
    }

    fn write_pair(
        &self,
        staging: &Path,
        instrument: &str,
        trades: &RecordBatch,
        metadata: &InstrumentMetadata,
    ) -> Result<(), PersistError> {
        let key_values = vec![("instrument".to_string(), instrument.to_string())];
        write_trade_table(
            &staging.join(self.format.trades_file_name()),
            trades,
            self.format,
            self.zstd_level,
            &key_values,
        )?;

        // Metadata goes last: it is the marker of a complete pair.
        let mut file = File::create(staging.join(METADATA_FILE_NAME))?;
        file.write_all(&serde_json::to_vec_pretty(metadata)?)?;
        file.sync_all()?;
        Ok(())
    }

    /// Clean up after an interrupted run: restore retired datasets whose
    /// target is missing, drop everything else hidden under the root.
    pub fn recover(&self) -> std::io::Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        if !self.root.exists() {
            return Ok(report);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            if name.starts_with(STAGING_PREFIX) {
                fs::remove_dir_all(&path)?;
                report.staging_removed += 1;
            } else if let Some(rest) = name.strip_prefix(RETIRED_PREFIX) {
                let instrument = rest.rsplit_once('-').map(|(name, _pid)| name).unwrap_or(rest);
                let target = self.instrument_dir(instrument);
                if is_safe_dir_name(instrument) && !target.exists() {
                    fs::rename(&path, &target)?;
                    report.retired_restored += 1;
                } else {
                    fs::remove_dir_all(&path)?;
                    report.retired_removed += 1;
                }
            }
        }

        if report != RecoveryReport::default() {
            info!(
                "Recovered output directory {}: {} staging removed, {} restored, {} retired removed",
                self.root.display(),
                report.staging_removed,
                report.retired_restored,
                report.retired_removed
            );
        }
        Ok(report)
    }
}

/// Instrument directories under `root`, sorted by name. Hidden entries are skipped.
pub fn list_instrument_dirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// The trade table inside an instrument directory, whichever format it was written in.
pub fn find_trades_file(dir: &Path) -> Option<PathBuf> {
    [OutputFormat::Parquet, OutputFormat::Feather]
        .iter()
        .map(|format| dir.join(format.trades_file_name()))
        .find(|path| path.is_file())
}

pub fn read_metadata(dir: &Path) -> Result<InstrumentMetadata, PersistError> {
    let contents = fs::read(dir.join(METADATA_FILE_NAME))?;
    Ok(serde_json::from_slice(&contents)?)
}

/// A single, non-hidden path component.
pub fn is_safe_dir_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && Path::new(name).components().count() == 1
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
