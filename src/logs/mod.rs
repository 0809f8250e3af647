//! Agent side of the log pipeline
//!
//! Files are discovered by the [`orchestrator`], tailed by
//! [`file_log_source`], transformed by [`log_parsers`], batched by the
//! [`shipper`] and forwarded by [`tcp_log_output`].

pub mod file_log_source;
pub mod labels;
pub mod log_parsers;
pub mod offset_store;
pub mod orchestrator;
pub mod shipper;
pub mod tcp_log_output;

pub use file_log_source::{FileInput, Input, InputError};
pub use labels::{DockerConfigResolver, LabelError, LabelResolver, LogLabels};
pub use log_parsers::{DockerJsonTransformer, PassThroughTransformer, TransformError, Transformer};
pub use offset_store::{OffsetError, OffsetStore};
pub use orchestrator::LogOrchestrator;
pub use shipper::{LogShipper, ShipperExit, ShipperSettings};
pub use tcp_log_output::{BlackHoleOutput, Output, OutputError, TcpOutput};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Docker containers directory, scanned for `*/*-json.log`
    #[serde(default = "default_containers_dir")]
    pub containers_dir: PathBuf,
    /// Directory holding the offset records
    #[serde(default)]
    pub offsets_dir: PathBuf,
    /// Collector address (`host:port`)
    #[serde(default)]
    pub server: String,
    /// Address of the Prometheus endpoint, disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_listen: Option<String>,
    /// Seconds between reconciliation passes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Batch size that triggers a flush (bytes)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds after which a non-empty batch is flushed
    #[serde(default = "default_buffer_timeout")]
    pub buffer_timeout: u64,
    /// Seconds allowed for dial, handshake and each data exchange
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Milliseconds to wait after a failed flush
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Only tail Kubernetes workload containers
    #[serde(default = "default_true")]
    pub kubernetes_only: bool,
    /// Milliseconds between end-of-file checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            containers_dir: default_containers_dir(),
            offsets_dir: PathBuf::new(),
            server: String::new(),
            metrics_listen: None,
            refresh_interval: default_refresh_interval(),
            buffer_size: default_buffer_size(),
            buffer_timeout: default_buffer_timeout(),
            timeout: default_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            kubernetes_only: true,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl AgentConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Batching parameters handed to every shipper
    pub fn shipper_settings(&self) -> ShipperSettings {
        ShipperSettings {
            buffer_size: self.buffer_size,
            buffer_timeout: Duration::from_secs(self.buffer_timeout),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

fn default_containers_dir() -> PathBuf {
    PathBuf::from("/var/lib/docker/containers")
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    100_000
}

fn default_buffer_timeout() -> u64 {
    10
}

fn default_timeout() -> u64 {
    10
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    250
}

fn default_true() -> bool {
    true
}
