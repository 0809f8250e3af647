//! Collector side of the log pipeline
//!
//! The [`server`] accepts agent connections and appends each stream to a
//! per-identity file managed by [`file_log_output`]; [`retention`] removes
//! rotated files once they are old enough.

pub mod file_log_output;
pub mod retention;
pub mod server;

pub use file_log_output::{backup_file_name, IdentityLog, OpenOutcome};
pub use retention::{collect_garbage, is_backup_file_name, run_retention_loop};
pub use server::{CollectorServer, SessionEnd};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Collector configuration schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Directory holding the identity logs and their backups
    #[serde(default)]
    pub log_path: PathBuf,
    /// Listen address, `ip:port` or `:port`
    #[serde(default)]
    pub listen: String,
    /// Size at which an identity log is rotated (bytes)
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    /// Seconds a rotated log is kept after its last modification
    #[serde(default = "default_max_age")]
    pub max_age: u64,
    /// Seconds between retention passes
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
    /// Seconds allowed for the handshake frame and its response
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Largest accepted frame payload (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::new(),
            listen: String::new(),
            max_log_size: default_max_log_size(),
            max_age: default_max_age(),
            gc_interval: default_gc_interval(),
            handshake_timeout: default_handshake_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ServerConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Listen address with a bare `:port` expanded to all interfaces
    pub fn listen_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

/// Serve agents and collect old backups until `cancel` fires
pub async fn run_collector(config: ServerConfig, cancel: CancellationToken) -> Result<()> {
    let server = CollectorServer::bind(config.clone()).await?;

    let retention = tokio::spawn(run_retention_loop(
        config.log_path.clone(),
        config.max_age(),
        config.gc_interval(),
        cancel.child_token(),
    ));

    let result = server.serve(cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = retention.await {
        error!(error = %e, "retention task failed");
    }
    info!("collector stopped");
    result
}

fn default_max_log_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_age() -> u64 {
    3 * 24 * 60 * 60
}

fn default_gc_interval() -> u64 {
    600
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_max_frame_size() -> usize {
    64 * 1024 * 1024
}
