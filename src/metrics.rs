//! Agent metrics
//!
//! Metrics are registered against a caller-supplied Prometheus registry and
//! passed to each pipeline component, so nothing here is process-global.

use anyhow::{Context, Result};
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry};

/// Counters and histograms reported by the tail-batch-forward pipeline
#[derive(Clone)]
pub struct AgentMetrics {
    /// Number of log files currently being tailed
    pub logs_count: Gauge,
    /// Bytes read from log files, newlines included
    pub bytes_read: IntCounter,
    /// Lines read from log files
    pub lines_read: IntCounter,
    /// Bytes acknowledged by the collector
    pub bytes_written: IntCounter,
    /// Flush attempts
    pub write_operations: IntCounter,
    /// Flush attempts that failed
    pub write_errors: IntCounter,
    /// Offsets persisted after a confirmed flush
    pub offsets_committed: IntCounter,
    /// Time spent transforming a single line
    pub transform_histogram: Histogram,
    /// Time spent writing one batch to the collector
    pub write_histogram: Histogram,
}

impl AgentMetrics {
    /// Create the agent metrics and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;

        registry
            .register(Box::new(metrics.logs_count.clone()))
            .context("Failed to register logs_count")?;
        registry.register(Box::new(metrics.bytes_read.clone()))?;
        registry.register(Box::new(metrics.lines_read.clone()))?;
        registry.register(Box::new(metrics.bytes_written.clone()))?;
        registry.register(Box::new(metrics.write_operations.clone()))?;
        registry.register(Box::new(metrics.write_errors.clone()))?;
        registry.register(Box::new(metrics.offsets_committed.clone()))?;
        registry.register(Box::new(metrics.transform_histogram.clone()))?;
        registry.register(Box::new(metrics.write_histogram.clone()))?;

        Ok(metrics)
    }

    /// Create the agent metrics without exporting them anywhere
    pub fn unregistered() -> Result<Self> {
        Ok(Self {
            logs_count: Gauge::with_opts(Opts::new(
                "logferry_agent_logs_count",
                "Tailing logs count",
            ))?,
            bytes_read: IntCounter::new("logferry_agent_bytes_read", "Bytes read from logs")?,
            lines_read: IntCounter::new("logferry_agent_lines_read", "Lines read from logs")?,
            bytes_written: IntCounter::new(
                "logferry_agent_bytes_written",
                "Bytes written to server",
            )?,
            write_operations: IntCounter::new("logferry_agent_write_ops", "Write ops count")?,
            write_errors: IntCounter::new("logferry_agent_write_errors", "Write errors count")?,
            offsets_committed: IntCounter::new(
                "logferry_agent_offsets_committed",
                "Offsets commits occurred",
            )?,
            transform_histogram: Histogram::with_opts(HistogramOpts::new(
                "logferry_agent_transformer_seconds",
                "Line transformer latency",
            ))?,
            write_histogram: Histogram::with_opts(HistogramOpts::new(
                "logferry_agent_write_seconds",
                "Write buffer to server latency",
            ))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        let metrics = AgentMetrics::new(&registry).unwrap();

        metrics.lines_read.inc();
        metrics.bytes_read.inc_by(6);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("logferry_agent_lines_read 1"));
        assert!(text.contains("logferry_agent_bytes_read 6"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        AgentMetrics::new(&registry).unwrap();
        assert!(AgentMetrics::new(&registry).is_err());
    }
}
