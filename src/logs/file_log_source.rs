//! File log source implementation
//!
//! [`FileInput`] tails a single log file line by line, resuming from the
//! offset persisted in the [`OffsetStore`]. Only complete lines are handed
//! out; a trailing partial line stays buffered until its newline arrives.
//!
//! The reader polls for growth when it reaches the end of the file. While
//! waiting it also checks whether the file was truncated or replaced (inode
//! change), in which case it starts over from the beginning of the new file.
//!
//! `read_line` is cancel safe: the only suspension point is the poll sleep and
//! all partially read data lives in the reader, so dropping the future (for
//! example from a `tokio::select!` branch) never loses bytes.

use crate::logs::offset_store::{OffsetError, OffsetStore};
use crate::metrics::AgentMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default delay between checks for new data at end of file
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors returned by [`Input::read_line`]
#[derive(Debug, Error)]
pub enum InputError {
    /// The input was closed
    #[error("input closed")]
    Closed,

    /// The file became unreadable
    #[error("failed to read log file: {0}")]
    Io(#[from] io::Error),
}

/// A resumable, line oriented source of log data
#[async_trait]
pub trait Input: Send {
    /// Wait for the next complete line, without its trailing newline
    async fn read_line(&mut self) -> Result<String, InputError>;

    /// Persist the position just past the last line returned
    fn save_offset(&self) -> Result<(), OffsetError>;

    /// Stop reading; pending and future reads fail with [`InputError::Closed`]
    fn close(&mut self);
}

/// File reader state for tracking position and rotation
#[derive(Debug, Clone, Copy)]
struct FileReaderState {
    /// File inode for rotation detection
    inode: u64,
    /// Bytes consumed from the file, partial line included
    position: u64,
}

/// Tails one log file from its persisted offset
pub struct FileInput {
    path: PathBuf,
    offset_store: OffsetStore,
    metrics: Arc<AgentMetrics>,
    reader: Option<BufReader<File>>,
    state: FileReaderState,
    /// Position just past the last complete line handed out
    offset: u64,
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl FileInput {
    /// Open `path` and position it at the persisted offset
    ///
    /// A missing or corrupt offset record, or one that points past the end of
    /// the file, starts the reader at offset 0.
    pub fn new(
        path: impl Into<PathBuf>,
        offset_store: OffsetStore,
        metrics: Arc<AgentMetrics>,
    ) -> Result<Self> {
        let path = path.into();

        let mut offset = match offset_store.get(&path) {
            Ok(offset) => offset,
            Err(e) => {
                info!(path = %path.display(), error = %e, "can't get offset for file");
                0
            }
        };

        let mut file = File::open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let metadata = file
            .metadata()
            .with_context(|| format!("Failed to get metadata for {}", path.display()))?;
        if metadata.len() < offset {
            warn!(
                path = %path.display(),
                offset,
                size = metadata.len(),
                "persisted offset is beyond end of file, starting over"
            );
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset))?;

        info!(path = %path.display(), offset, "tailing file");

        Ok(Self {
            path,
            offset_store,
            metrics,
            reader: Some(BufReader::new(file)),
            state: FileReaderState {
                inode: metadata.ino(),
                position: offset,
            },
            offset,
            pending: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the delay between end-of-file checks
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Path of the tailed file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position just past the last line returned by `read_line`
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reopen from the start if the file shrank below our position or was replaced
    fn check_rotation(&mut self) -> io::Result<()> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            // Removed files are retired by the orchestrator; keep waiting until then.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        if metadata.ino() == self.state.inode && metadata.len() >= self.state.position {
            return Ok(());
        }

        warn!(
            path = %self.path.display(),
            position = self.state.position,
            size = metadata.len(),
            "log file was truncated or replaced, reading from the beginning"
        );
        let file = File::open(&self.path)?;
        self.state = FileReaderState {
            inode: file.metadata()?.ino(),
            position: 0,
        };
        self.offset = 0;
        self.pending.clear();
        self.reader = Some(BufReader::new(file));
        Ok(())
    }
}

#[async_trait]
impl Input for FileInput {
    async fn read_line(&mut self) -> Result<String, InputError> {
        loop {
            let reader = self.reader.as_mut().ok_or(InputError::Closed)?;
            let read = reader.read_until(b'\n', &mut self.pending)?;
            self.state.position += read as u64;

            if self.pending.last() == Some(&b'\n') {
                let mut line = std::mem::take(&mut self.pending);
                self.offset = self.state.position;
                self.metrics.lines_read.inc();
                self.metrics.bytes_read.inc_by(line.len() as u64);

                line.pop();
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }

            self.check_rotation()?;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn save_offset(&self) -> Result<(), OffsetError> {
        self.offset_store.save(&self.path, self.offset)?;
        self.metrics.offsets_committed.inc();
        debug!(path = %self.path.display(), offset = self.offset, "saved offset");
        Ok(())
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            info!(path = %self.path.display(), "closing file input");
        }
        self.pending.clear();
    }
}
