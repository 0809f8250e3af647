//! TCP log output
//!
//! [`TcpOutput`] forwards batches to the collector over the framed protocol in
//! [`crate::protocol`]. The connection is opened lazily on the first write and
//! after any failure; every new connection starts with the label handshake.
//!
//! # Examples
//!
//! ```rust,no_run
//! use logferry::logs::labels::LogLabels;
//! use logferry::logs::tcp_log_output::{Output, TcpOutput};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut labels = LogLabels::new();
//! labels.insert("docker.name".to_string(), "web".to_string());
//!
//! let mut output = TcpOutput::new("collector:7000", labels, Duration::from_secs(10));
//! output.write(b"GET /health 200\n").await?;
//! output.close().await;
//! # Ok(())
//! # }
//! ```

use crate::logs::labels::LogLabels;
use crate::protocol::{self, ProtocolError};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Errors returned by [`Output::write`]
#[derive(Debug, Error)]
pub enum OutputError {
    /// The collector could not be reached
    #[error("failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: std::io::Error,
    },

    /// Dialing the collector took longer than the configured timeout
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    /// The labels could not be encoded
    #[error("failed to encode labels: {0}")]
    Encode(#[from] serde_json::Error),

    /// The collector refused or failed the handshake
    #[error("handshake failed: {0}")]
    Handshake(#[source] ProtocolError),

    /// A data frame was not acknowledged
    #[error("write failed: {0}")]
    Write(#[source] ProtocolError),
}

/// Destination for transformed log batches
#[async_trait]
pub trait Output: Send + fmt::Display {
    /// Deliver one batch; success means the collector acknowledged it
    async fn write(&mut self, data: &[u8]) -> Result<(), OutputError>;

    /// Release any open connection; safe to call repeatedly
    async fn close(&mut self);
}

/// Output that accepts and discards every batch
#[derive(Debug, Default, Clone, Copy)]
pub struct BlackHoleOutput;

#[async_trait]
impl Output for BlackHoleOutput {
    async fn write(&mut self, _data: &[u8]) -> Result<(), OutputError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

impl fmt::Display for BlackHoleOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlackHole()")
    }
}

/// Framed TCP connection to the collector
pub struct TcpOutput {
    server: String,
    labels: LogLabels,
    timeout: Duration,
    conn: Option<TcpStream>,
}

impl TcpOutput {
    /// Create an output for `server`; nothing is dialed until the first write
    pub fn new(server: impl Into<String>, labels: LogLabels, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            labels,
            timeout,
            conn: None,
        }
    }

    /// Labels sent in the handshake
    pub fn labels(&self) -> &LogLabels {
        &self.labels
    }

    /// Whether a connection is currently established
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn connect(&mut self) -> Result<TcpStream, OutputError> {
        let handshake = serde_json::to_vec(&self.labels)?;

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.server))
            .await
            .map_err(|_| OutputError::ConnectTimeout(self.server.clone()))?
            .map_err(|source| OutputError::Connect {
                server: self.server.clone(),
                source,
            })?;

        // Dropping the stream on failure tears the connection down.
        protocol::send_and_confirm(&mut stream, &handshake, Some(self.timeout))
            .await
            .map_err(OutputError::Handshake)?;

        info!(output = %self, "connected");
        Ok(stream)
    }
}

#[async_trait]
impl Output for TcpOutput {
    async fn write(&mut self, data: &[u8]) -> Result<(), OutputError> {
        let mut stream = match self.conn.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        protocol::send_and_confirm(&mut stream, data, Some(self.timeout))
            .await
            .map_err(OutputError::Write)?;

        self.conn = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.conn.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(output = %self, error = %e, "error shutting down connection");
            }
        }
    }
}

impl fmt::Display for TcpOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpOutput({}, {:?})", self.server, self.labels)
    }
}
