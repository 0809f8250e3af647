//! Routing labels for tailed log files
//!
//! A [`LabelResolver`] maps a log file path to the labels sent in the
//! collector handshake. The labels must include
//! [`IDENTITY_LABEL`](crate::protocol::IDENTITY_LABEL), which picks the
//! collector-side file the stream is appended to.
//!
//! [`DockerConfigResolver`] handles Docker's json-file layout,
//! `<containers-dir>/<id>/<id>-json.log`, by reading the container's
//! `config.v2.json` that Docker keeps in the same directory.

use crate::protocol::IDENTITY_LABEL;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label set sent as the handshake payload
pub type LogLabels = BTreeMap<String, String>;

/// Suffix of Docker json-file logs
pub const DOCKER_LOG_SUFFIX: &str = "-json.log";

/// Container metadata file kept by Docker next to the log
pub const DOCKER_CONFIG_FILE: &str = "config.v2.json";

const KUBERNETES_TYPE_LABEL: &str = "io.kubernetes.docker.type";

/// Errors returned while resolving labels
#[derive(Debug, Error)]
pub enum LabelError {
    /// The file is intentionally not tailed
    #[error("skipped")]
    Skip,

    /// The path does not look like a Docker json-file log
    #[error("invalid log path format: {0} (should be *-json.log)")]
    InvalidPath(PathBuf),

    /// The container id could not be derived from the file name
    #[error("can't get container id from log path: {0}")]
    NoContainerId(PathBuf),

    /// The container metadata could not be read
    #[error("failed to read container config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The container metadata could not be parsed
    #[error("failed to parse container config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LabelError {
    /// Whether the file should be silently ignored
    pub fn is_skip(&self) -> bool {
        matches!(self, LabelError::Skip)
    }
}

/// Resolves the routing labels of a log file
#[async_trait]
pub trait LabelResolver: Send + Sync {
    /// Labels for `path`, [`LabelError::Skip`] for files that must not be tailed
    async fn resolve(&self, path: &Path) -> Result<LogLabels, LabelError>;
}

#[derive(Debug, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Config", default)]
    config: Option<ContainerSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerSpec {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Resolves labels from Docker's per-container metadata
#[derive(Debug, Clone)]
pub struct DockerConfigResolver {
    kubernetes_only: bool,
}

impl DockerConfigResolver {
    /// Create a resolver; with `kubernetes_only` set, containers that are not
    /// Kubernetes workload containers (pause containers, plain `docker run`)
    /// are skipped
    pub fn new(kubernetes_only: bool) -> Self {
        Self { kubernetes_only }
    }

    /// Container id encoded in a `<id>-json.log` file name
    pub fn container_id(log_path: &Path) -> Result<String, LabelError> {
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LabelError::InvalidPath(log_path.to_path_buf()))?;
        if !file_name.ends_with(DOCKER_LOG_SUFFIX) {
            return Err(LabelError::InvalidPath(log_path.to_path_buf()));
        }

        let parts: Vec<&str> = file_name.split('-').collect();
        if parts.len() != 2 || parts[0].is_empty() {
            return Err(LabelError::NoContainerId(log_path.to_path_buf()));
        }
        Ok(parts[0].to_string())
    }
}

impl Default for DockerConfigResolver {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl LabelResolver for DockerConfigResolver {
    async fn resolve(&self, path: &Path) -> Result<LogLabels, LabelError> {
        Self::container_id(path)?;

        let config_path = path
            .parent()
            .map(|dir| dir.join(DOCKER_CONFIG_FILE))
            .ok_or_else(|| LabelError::InvalidPath(path.to_path_buf()))?;
        let data = tokio::fs::read(&config_path)
            .await
            .map_err(|source| LabelError::Io {
                path: config_path.clone(),
                source,
            })?;
        let container: ContainerConfig =
            serde_json::from_slice(&data).map_err(|source| LabelError::Parse {
                path: config_path.clone(),
                source,
            })?;

        if self.kubernetes_only {
            let container_type = container
                .config
                .as_ref()
                .and_then(|spec| spec.labels.as_ref())
                .and_then(|labels| labels.get(KUBERNETES_TYPE_LABEL));
            if container_type.map(String::as_str) != Some("container") {
                return Err(LabelError::Skip);
            }
        }

        let mut labels = LogLabels::new();
        labels.insert(
            IDENTITY_LABEL.to_string(),
            container.name.trim_start_matches('/').to_string(),
        );
        Ok(labels)
    }
}
