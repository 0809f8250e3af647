//! Configuration management for logferry
//!
//! Both modes read an optional config file (YAML, JSON or TOML, chosen by
//! extension) and then apply command line overrides on top of it.

use crate::collector::ServerConfig;
use crate::logs::AgentConfig;
use anyhow::{Context, Result};
use clap::Args;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration problems detected before startup
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting was given neither in the file nor on the command line
    #[error("--{0} argument isn't set")]
    Missing(&'static str),

    /// The config file extension is not one we can parse
    #[error("unsupported config format: {0} (expected .yml, .yaml, .json or .toml)")]
    UnsupportedFormat(PathBuf),

    /// A numeric setting is out of range
    #[error("--{0} must be greater than zero")]
    Zero(&'static str),
}

/// Load a config file, picking the parser from its extension
pub fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config {}", path.display()))?,
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON config {}", path.display()))?,
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML config {}", path.display()))?,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf()).into()),
    };

    Ok(config)
}

/// Command line options of `logferry agent`
#[derive(Debug, Clone, Default, Args)]
pub struct AgentArgs {
    /// Config file (.yml, .yaml, .json or .toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Docker containers directory
    #[arg(long)]
    pub containers_dir: Option<PathBuf>,
    /// Directory for the read offsets
    #[arg(long)]
    pub offsets_dir: Option<PathBuf>,
    /// Collector address, host:port
    #[arg(long)]
    pub server: Option<String>,
    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_listen: Option<String>,
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl AgentArgs {
    /// Merge the config file and the command line into a validated config
    pub fn resolve(&self) -> Result<AgentConfig> {
        let mut config: AgentConfig = match &self.config {
            Some(path) => load_config_file(path)?,
            None => AgentConfig::default(),
        };

        if let Some(dir) = &self.containers_dir {
            config.containers_dir = dir.clone();
        }
        if let Some(dir) = &self.offsets_dir {
            config.offsets_dir = dir.clone();
        }
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(listen) = &self.metrics_listen {
            config.metrics_listen = Some(listen.clone());
        }

        validate_agent_config(&config)?;
        Ok(config)
    }
}

/// Command line options of `logferry server`
#[derive(Debug, Clone, Default, Args)]
pub struct ServerArgs {
    /// Config file (.yml, .yaml, .json or .toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Absolute logs path
    #[arg(long)]
    pub log_path: Option<PathBuf>,
    /// Listen address ip:port or :port
    #[arg(long)]
    pub listen: Option<String>,
    /// Seconds to retain rotated logs, based on last modification time
    #[arg(long)]
    pub max_age: Option<u64>,
    /// Size in bytes at which a log is rotated
    #[arg(long)]
    pub max_log_size: Option<u64>,
    /// Seconds between retention passes
    #[arg(long)]
    pub gc_interval: Option<u64>,
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerArgs {
    /// Merge the config file and the command line into a validated config
    pub fn resolve(&self) -> Result<ServerConfig> {
        let mut config: ServerConfig = match &self.config {
            Some(path) => load_config_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(path) = &self.log_path {
            config.log_path = path.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(max_age) = self.max_age {
            config.max_age = max_age;
        }
        if let Some(max_log_size) = self.max_log_size {
            config.max_log_size = max_log_size;
        }
        if let Some(gc_interval) = self.gc_interval {
            config.gc_interval = gc_interval;
        }

        validate_server_config(&config)?;
        Ok(config)
    }
}

pub fn validate_agent_config(config: &AgentConfig) -> Result<(), ConfigError> {
    if config.offsets_dir.as_os_str().is_empty() {
        return Err(ConfigError::Missing("offsets-dir"));
    }
    if config.server.is_empty() {
        return Err(ConfigError::Missing("server"));
    }
    if config.refresh_interval == 0 {
        return Err(ConfigError::Zero("refresh-interval"));
    }
    if config.buffer_timeout == 0 {
        return Err(ConfigError::Zero("buffer-timeout"));
    }
    if config.buffer_size == 0 {
        return Err(ConfigError::Zero("buffer-size"));
    }
    if config.timeout == 0 {
        return Err(ConfigError::Zero("timeout"));
    }
    Ok(())
}

pub fn validate_server_config(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.log_path.as_os_str().is_empty() {
        return Err(ConfigError::Missing("log-path"));
    }
    if config.listen.is_empty() {
        return Err(ConfigError::Missing("listen"));
    }
    if config.gc_interval == 0 {
        return Err(ConfigError::Zero("gc-interval"));
    }
    Ok(())
}
