//! Wire protocol shared by the agent and the collector
//!
//! Every request is a frame: a 4-byte little-endian signed length followed by
//! exactly that many payload bytes. Every response is a bare 4-byte
//! little-endian signed status code.
//!
//! A connection starts with a handshake frame carrying the routing labels as a
//! JSON object (which must contain [`IDENTITY_LABEL`]), followed by any number
//! of data frames whose payload is appended verbatim on the collector side.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request accepted
pub const STATUS_OK: i32 = 200;
/// Handshake was malformed or did not carry the identity label
pub const STATUS_BAD_REQUEST: i32 = 400;
/// Collector failed to persist a data frame
pub const STATUS_INTERNAL_ERROR: i32 = 500;

/// Label that selects the collector-side identity file
pub const IDENTITY_LABEL: &str = "docker.name";

/// Deadline applied to the handshake exchange on both sides
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors produced while exchanging frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket failure, including a stream truncated mid-frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The length prefix was negative
    #[error("malformed frame length: {0}")]
    MalformedLength(i32),

    /// The length prefix exceeds what the reader is willing to allocate
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// The payload cannot be described by a 4-byte signed length
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    /// The exchange did not finish before its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with a non-success status
    #[error("got {0} response from server")]
    Status(i32),
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = i32::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
    writer.write_i32_le(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, refusing lengths above `max_len`
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32_le().await?;
    if len < 0 {
        return Err(ProtocolError::MalformedLength(len));
    }
    let size = len as usize;
    if size > max_len {
        return Err(ProtocolError::FrameTooLarge {
            size,
            limit: max_len,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write a status response and flush it
pub async fn write_status<W>(writer: &mut W, status: i32) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i32_le(status).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a status response
pub async fn read_status<R>(reader: &mut R) -> Result<i32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_i32_le().await?)
}

/// Run a protocol exchange, bounded by `timeout` when one is given
pub async fn with_deadline<T, F>(timeout: Option<Duration>, exchange: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| ProtocolError::Timeout(limit))?,
        None => exchange.await,
    }
}

/// Send a frame and require a [`STATUS_OK`] answer
pub async fn send_and_confirm<S>(
    stream: &mut S,
    payload: &[u8],
    timeout: Option<Duration>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let status = with_deadline(timeout, async {
        write_frame(stream, payload).await?;
        read_status(stream).await
    })
    .await?;

    if status != STATUS_OK {
        return Err(ProtocolError::Status(status));
    }
    Ok(())
}
