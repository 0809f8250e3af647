//! Identity log files
//!
//! Every routing identity owns one active file, `<identity>.log`, in the log
//! directory. Once that file reaches the size limit it is renamed to a
//! timestamped backup, `<identity>-<%Y-%m-%dT%H-%M-%S%.3f>.log`, the next
//! time a connection for the identity starts streaming.

use chrono::{DateTime, Local};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Timestamp format of backup file names
pub const BACKUP_DATE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// Backup name for `identity` rotated at `at`
pub fn backup_file_name(identity: &str, at: &DateTime<Local>) -> String {
    format!("{}-{}.log", identity, at.format(BACKUP_DATE_FORMAT))
}

/// Result of [`IdentityLog::open_or_rotate`]
#[derive(Debug)]
pub enum OpenOutcome {
    /// The active file is open for appending
    Opened(IdentityLog),
    /// The active file was full and moved to this backup path
    Rotated(PathBuf),
}

/// Append handle on an identity's active file
#[derive(Debug)]
pub struct IdentityLog {
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
}

impl IdentityLog {
    /// Rotate `<dir>/<identity>.log` if it reached `max_size`, else open it for append
    pub async fn open_or_rotate(dir: &Path, identity: &str, max_size: u64) -> io::Result<OpenOutcome> {
        let path = dir.join(format!("{}.log", identity));

        match fs::metadata(&path).await {
            Ok(metadata) if metadata.len() >= max_size => {
                let backup = dir.join(backup_file_name(identity, &Local::now()));
                fs::rename(&path, &backup).await?;
                info!(
                    from = %path.display(),
                    to = %backup.display(),
                    size = metadata.len(),
                    "rotated log"
                );
                return Ok(OpenOutcome::Rotated(backup));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();

        Ok(OpenOutcome::Opened(Self {
            path,
            file,
            size,
            max_size,
        }))
    }

    /// Append `data` verbatim
    pub async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.size += data.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size on open plus everything appended since
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the file reached the rotation threshold
    pub fn is_full(&self) -> bool {
        self.size >= self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::retention::is_backup_file_name;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_backup_file_name() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let name = backup_file_name("web", &at);
        assert_eq!(name, "web-2024-03-09T07-05-01.000.log");
        assert!(is_backup_file_name(&name));
    }

    #[tokio::test]
    async fn test_open_creates_and_appends() {
        let temp_dir = tempdir().unwrap();

        let mut log = match IdentityLog::open_or_rotate(temp_dir.path(), "web", 1024).await.unwrap() {
            OpenOutcome::Opened(log) => log,
            other => panic!("unexpected outcome {:?}", other),
        };
        log.append(b"line1\n").await.unwrap();
        log.append(b"line2\n").await.unwrap();
        assert_eq!(log.size(), 12);
        drop(log);

        let mut log = match IdentityLog::open_or_rotate(temp_dir.path(), "web", 1024).await.unwrap() {
            OpenOutcome::Opened(log) => log,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(log.size(), 12);
        log.append(b"line3\n").await.unwrap();

        let content = std::fs::read_to_string(temp_dir.path().join("web.log")).unwrap();
        assert_eq!(content, "line1\nline2\nline3\n");
    }

    #[tokio::test]
    async fn test_full_file_is_rotated() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("web.log"), "0123456789").unwrap();

        let backup = match IdentityLog::open_or_rotate(temp_dir.path(), "web", 10).await.unwrap() {
            OpenOutcome::Rotated(backup) => backup,
            other => panic!("unexpected outcome {:?}", other),
        };

        assert!(!temp_dir.path().join("web.log").exists());
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "0123456789");
        let name = backup.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("web-"));
        assert!(is_backup_file_name(name));
    }

    #[tokio::test]
    async fn test_is_full_after_append() {
        let temp_dir = tempdir().unwrap();
        let mut log = match IdentityLog::open_or_rotate(temp_dir.path(), "db", 8).await.unwrap() {
            OpenOutcome::Opened(log) => log,
            other => panic!("unexpected outcome {:?}", other),
        };
        log.append(b"1234").await.unwrap();
        assert!(!log.is_full());
        log.append(b"5678").await.unwrap();
        assert!(log.is_full());
        assert_eq!(log.path(), temp_dir.path().join("db.log"));
    }
}
