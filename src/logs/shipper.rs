//! Log shipper
//!
//! A [`LogShipper`] owns one [`Input`] and one [`Output`]. It pumps lines from
//! the input through a [`Transformer`] into an in-memory batch, and flushes the
//! batch when it reaches `buffer_size` bytes or when `buffer_timeout` elapses.
//!
//! The input offset is persisted only after the output acknowledged a flush.
//! A failed flush keeps the batch for the next attempt and backs off for
//! `retry_backoff`. Closing the shipper does not flush; whatever is still
//! buffered at that point is read again after a restart from the last
//! committed offset.
//!
//! When the flush timer expires on an empty batch nothing is written and the
//! timer is re-armed for another `buffer_timeout`.

use crate::logs::file_log_source::{Input, InputError};
use crate::logs::log_parsers::Transformer;
use crate::logs::tcp_log_output::Output;
use crate::metrics::AgentMetrics;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Batching parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShipperSettings {
    /// Flush once the batch holds at least this many bytes
    pub buffer_size: usize,
    /// Flush a non-empty batch at least this often
    pub buffer_timeout: Duration,
    /// Pause after a failed flush
    pub retry_backoff: Duration,
}

impl Default for ShipperSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100_000,
            buffer_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Why a shipper stopped
#[derive(Debug)]
pub enum ShipperExit {
    /// Cancellation was requested
    Cancelled,
    /// The input failed or was closed
    InputFailed(InputError),
}

/// Batches lines from one input and forwards them to one output
pub struct LogShipper {
    input: Box<dyn Input>,
    output: Box<dyn Output>,
    transformer: Arc<dyn Transformer>,
    settings: ShipperSettings,
    metrics: Arc<AgentMetrics>,
    buffer: Vec<u8>,
}

impl LogShipper {
    /// Wire an input and an output together
    pub fn new(
        input: Box<dyn Input>,
        output: Box<dyn Output>,
        transformer: Arc<dyn Transformer>,
        settings: ShipperSettings,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            input,
            output,
            transformer,
            settings,
            metrics,
            buffer: Vec::new(),
        }
    }

    /// Run until cancelled or until the input fails, then release the input and output
    pub async fn run(mut self, cancel: CancellationToken) -> ShipperExit {
        let flush_timer = tokio::time::sleep(self.settings.buffer_timeout);
        tokio::pin!(flush_timer);

        let exit = loop {
            let full = !self.buffer.is_empty() && self.buffer.len() >= self.settings.buffer_size;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break ShipperExit::Cancelled,

                _ = &mut flush_timer => {
                    if self.buffer.is_empty() {
                        Self::rearm(flush_timer.as_mut(), self.settings.buffer_timeout);
                    } else {
                        self.flush(flush_timer.as_mut(), &cancel).await;
                    }
                }

                _ = std::future::ready(()), if full => {
                    self.flush(flush_timer.as_mut(), &cancel).await;
                }

                line = self.input.read_line() => match line {
                    Ok(line) => self.push_line(&line),
                    Err(e) => break ShipperExit::InputFailed(e),
                },
            }
        };

        match &exit {
            ShipperExit::Cancelled => debug!(output = %self.output, "shipper cancelled"),
            ShipperExit::InputFailed(e) => {
                info!(output = %self.output, error = %e, "stopping shipper after input failure")
            }
        }
        if !self.buffer.is_empty() {
            debug!(
                output = %self.output,
                bytes = self.buffer.len(),
                "discarding unflushed batch"
            );
        }

        self.input.close();
        self.output.close().await;
        exit
    }

    fn rearm(timer: Pin<&mut Sleep>, timeout: Duration) {
        timer.reset(tokio::time::Instant::now() + timeout);
    }

    fn push_line(&mut self, line: &str) {
        let start = Instant::now();
        let result = self.transformer.transform(line);
        self.metrics
            .transform_histogram
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(payload) => self.buffer.extend_from_slice(payload.as_bytes()),
            Err(e) => debug!(
                transformer = self.transformer.name(),
                error = %e,
                "skipping line"
            ),
        }
    }

    async fn flush(&mut self, timer: Pin<&mut Sleep>, cancel: &CancellationToken) {
        if self.buffer.is_empty() {
            return;
        }
        Self::rearm(timer, self.settings.buffer_timeout);

        self.metrics.write_operations.inc();
        let start = Instant::now();
        match self.output.write(&self.buffer).await {
            Ok(()) => {
                self.metrics
                    .write_histogram
                    .observe(start.elapsed().as_secs_f64());
                self.metrics.bytes_written.inc_by(self.buffer.len() as u64);
                if let Err(e) = self.input.save_offset() {
                    warn!(error = %e, "failed to save input offset");
                }
                self.buffer.clear();
            }
            Err(e) => {
                warn!(output = %self.output, error = %e, "failed to write to output");
                self.metrics.write_errors.inc();
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }
}
