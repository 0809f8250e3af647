//! Log Shipping Orchestrator
//!
//! Keeps one [`LogShipper`] running for every Docker json-file log present
//! under the containers directory. Each reconciliation pass lists the
//! candidate files, starts shippers for files it has not seen yet, stops the
//! shippers of files that disappeared and drops their offset records.
//!
//! Tracked files are keyed by path only. A shipper that stopped on its own
//! (for example after its input failed) is not restarted while its file keeps
//! showing up in the listing.

use crate::logs::file_log_source::FileInput;
use crate::logs::labels::{LabelResolver, LogLabels, DOCKER_LOG_SUFFIX};
use crate::logs::log_parsers::{DockerJsonTransformer, Transformer};
use crate::logs::offset_store::OffsetStore;
use crate::logs::shipper::{LogShipper, ShipperExit};
use crate::logs::tcp_log_output::TcpOutput;
use crate::logs::AgentConfig;
use crate::metrics::AgentMetrics;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// A running shipper and the means to stop it
struct TrackedShipper {
    cancel: CancellationToken,
    task: JoinHandle<ShipperExit>,
}

/// Reconciles running shippers with the log files on disk
pub struct LogOrchestrator {
    config: AgentConfig,
    offset_store: OffsetStore,
    resolver: Arc<dyn LabelResolver>,
    transformer: Arc<dyn Transformer>,
    metrics: Arc<AgentMetrics>,
    root: CancellationToken,
    tracked: Mutex<HashMap<PathBuf, TrackedShipper>>,
}

impl LogOrchestrator {
    /// Create a new log orchestrator
    pub fn new(
        config: AgentConfig,
        offset_store: OffsetStore,
        resolver: Arc<dyn LabelResolver>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            config,
            offset_store,
            resolver,
            transformer: Arc::new(DockerJsonTransformer::new()),
            metrics,
            root: CancellationToken::new(),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Number of files with a shipper
    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }

    /// Whether `path` currently has a shipper
    pub async fn is_tracked(&self, path: &Path) -> bool {
        self.tracked.lock().await.contains_key(path)
    }

    /// Candidate files: `<containers_dir>/*/*-json.log`, sorted
    ///
    /// A missing containers directory yields an empty list. Entries below it
    /// that cannot be read are skipped.
    pub fn list_candidates(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.config.containers_dir)
            .min_depth(2)
            .max_depth(2)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e)
                    if e.depth() == 0
                        && e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) =>
                {
                    return Ok(Vec::new());
                }
                Err(e) if e.depth() > 0 => {
                    warn!(error = %e, "Skipping unreadable container entry");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to list logs under {}",
                            self.config.containers_dir.display()
                        )
                    })
                }
            };

            let is_log = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(DOCKER_LOG_SUFFIX));
            if is_log && entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Run one reconciliation pass
    pub async fn refresh(&self) -> Result<()> {
        let files = self.list_candidates()?;
        let live: HashSet<&PathBuf> = files.iter().collect();

        let mut tracked = self.tracked.lock().await;

        for path in &files {
            if tracked.contains_key(path) {
                continue;
            }

            let labels = match self.resolver.resolve(path).await {
                Ok(labels) => labels,
                Err(e) if e.is_skip() => {
                    debug!(path = %path.display(), "skipping log");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to resolve labels");
                    continue;
                }
            };
            info!(path = %path.display(), labels = ?labels, "resolved labels");

            match self.spawn_shipper(path, labels) {
                Ok(shipper) => {
                    tracked.insert(path.clone(), shipper);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to start shipper"),
            }
        }

        tracked.retain(|path, shipper| {
            if live.contains(path) {
                return true;
            }
            info!(path = %path.display(), "log disappeared, stopping shipper");
            shipper.cancel.cancel();
            false
        });

        self.metrics.logs_count.set(tracked.len() as f64);
        drop(tracked);

        self.offset_store.gc(&files);
        Ok(())
    }

    fn spawn_shipper(&self, path: &Path, labels: LogLabels) -> Result<TrackedShipper> {
        let input = FileInput::new(path, self.offset_store.clone(), self.metrics.clone())?
            .with_poll_interval(self.config.poll_interval());
        let output = TcpOutput::new(self.config.server.clone(), labels, self.config.timeout());
        let shipper = LogShipper::new(
            Box::new(input),
            Box::new(output),
            self.transformer.clone(),
            self.config.shipper_settings(),
            self.metrics.clone(),
        );

        let cancel = self.root.child_token();
        let token = cancel.clone();
        let path = path.to_path_buf();
        let task = tokio::spawn(async move {
            let exit = shipper.run(token).await;
            info!(path = %path.display(), reason = ?exit, "shipper stopped");
            exit
        });

        Ok(TrackedShipper { cancel, task })
    }

    /// Reconcile every `refresh_interval` until `cancel` fires, then shut down
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            containers_dir = %self.config.containers_dir.display(),
            server = %self.config.server,
            "starting log orchestrator"
        );

        let mut interval = tokio::time::interval(self.config.refresh_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "reconciliation failed, skipping this tick");
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every shipper and wait for them to release their files and connections
    pub async fn shutdown(&self) {
        let stopped: Vec<(PathBuf, TrackedShipper)> = {
            let mut tracked = self.tracked.lock().await;
            tracked.drain().collect()
        };
        self.root.cancel();

        for (path, shipper) in stopped {
            shipper.cancel.cancel();
            if let Err(e) = shipper.task.await {
                error!(path = %path.display(), error = %e, "shipper task failed");
            }
        }

        self.metrics.logs_count.set(0.0);
        info!("log orchestrator stopped");
    }
}
