//! Retention of rotated identity logs
//!
//! Only backup files are ever removed; active `<identity>.log` files are left
//! alone no matter how old they are.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

static BACKUP_FILE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.+-\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}\.\d{3}\.log$")
        .unwrap_or_else(|_| unreachable!())
});

/// Whether `name` looks like a rotated identity log
pub fn is_backup_file_name(name: &str) -> bool {
    BACKUP_FILE_PATTERN.is_match(name)
}

/// Remove backups in `dir` last modified more than `max_age` ago
///
/// Returns the number of removed files. Failures on individual files are
/// logged and skipped.
pub fn collect_garbage(dir: &Path, max_age: Duration) -> Result<usize> {
    info!(path = %dir.display(), "GC started");
    let started = Instant::now();
    let now = SystemTime::now();

    let entries = fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;

    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_backup_file_name(&name) {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!(file = %name, error = %e, "failed to stat log");
                continue;
            }
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }

        let path: PathBuf = entry.path();
        info!(file = %name, age_secs = age.as_secs(), "removing log");
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(file = %name, error = %e, "failed to remove log"),
        }
    }

    info!(
        removed,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "GC finished"
    );
    Ok(removed)
}

/// Collect garbage now and then every `interval` until `cancel` fires
pub async fn run_retention_loop(
    dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let dir = dir.clone();
                match tokio::task::spawn_blocking(move || collect_garbage(&dir, max_age)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "GC failed"),
                    Err(e) => warn!(error = %e, "GC task failed"),
                }
            }
        }
    }
}
