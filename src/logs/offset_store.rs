//! Persistent read offsets for tailed log files
//!
//! Each tailed file gets one record inside the store directory. The record's
//! file name is the source path with `/` replaced by `_`, and its content is
//! the decimal byte offset of the last line that was confirmed by the
//! collector.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors returned when reading an offset record
#[derive(Debug, Error)]
pub enum OffsetError {
    /// No record exists for the source
    #[error("no offset recorded for {0}")]
    NotFound(PathBuf),

    /// The record could not be parsed; it has already been removed
    #[error("corrupt offset record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// The record could not be read or written
    #[error("offset storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Directory-backed offset storage, one flat file per source
#[derive(Debug, Clone)]
pub struct OffsetStore {
    base_path: PathBuf,
}

impl OffsetStore {
    /// Open the store, creating its directory when missing
    pub fn new(base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                anyhow::anyhow!(
                    "failed to create offset storage dir {}: {}",
                    base_path.display(),
                    e
                )
            })?;
            info!(path = %base_path.display(), "created offset storage dir");
        }
        Ok(Self { base_path })
    }

    /// Directory holding the records
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Record name for a source path
    pub fn key(source: &Path) -> String {
        source.to_string_lossy().replace('/', "_")
    }

    fn record_path(&self, source: &Path) -> PathBuf {
        self.base_path.join(Self::key(source))
    }

    /// Read the persisted offset of `source`
    pub fn get(&self, source: &Path) -> Result<u64, OffsetError> {
        let record = self.record_path(source);
        let data = match fs::read_to_string(&record) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(OffsetError::NotFound(source.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        match data.trim().parse::<u64>() {
            Ok(offset) => Ok(offset),
            Err(e) => {
                warn!(record = %record.display(), error = %e, "got invalid offset, removing record");
                if let Err(e) = fs::remove_file(&record) {
                    warn!(record = %record.display(), error = %e, "failed to remove corrupt offset record");
                }
                Err(OffsetError::Corrupt {
                    path: record,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Persist `offset` for `source`, replacing any previous record
    pub fn save(&self, source: &Path, offset: u64) -> Result<(), OffsetError> {
        fs::write(self.record_path(source), offset.to_string())?;
        Ok(())
    }

    /// Remove every record whose source is not in `live_sources`
    pub fn gc<P: AsRef<Path>>(&self, live_sources: &[P]) {
        let live_keys: HashSet<String> = live_sources
            .iter()
            .map(|source| Self::key(source.as_ref()))
            .collect();

        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.base_path.display(), error = %e, "failed to list offset records");
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "failed to list offset records");
                    return;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if live_keys.contains(&name) {
                continue;
            }
            info!(record = %name, "removing offset record");
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(record = %name, error = %e, "failed to remove offset record");
            }
        }
    }
}
