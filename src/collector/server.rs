//! Collector server
//!
//! Each accepted connection goes through a handshake followed by a stream
//! of data frames:
//!
//! 1. The first frame carries the agent's labels as a JSON object. Without a
//!    usable `docker.name` the server answers 400 and hangs up, otherwise it
//!    answers 200.
//! 2. If the identity's active file already reached `max_log_size`, it is
//!    rotated to a backup name and the connection is closed; the agent
//!    reconnects and starts a fresh file.
//! 3. Every following frame is appended verbatim and answered with 200, or
//!    with 500 when the append failed. The connection is closed once the
//!    file reaches `max_log_size`.
//!
//! The handshake exchange is bounded by `handshake_timeout`; data frames are
//! read without a deadline.

use crate::collector::file_log_output::{IdentityLog, OpenOutcome};
use crate::collector::ServerConfig;
use crate::protocol::{
    self, read_frame, write_status, ProtocolError, IDENTITY_LABEL, STATUS_BAD_REQUEST,
    STATUS_INTERNAL_ERROR, STATUS_OK,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The handshake frame could not be read
    HandshakeFailed,
    /// The handshake was answered with 400
    Rejected,
    /// The active file was full and got rotated
    Rotated,
    /// The active file could not be rotated or opened
    OpenFailed,
    /// The active file reached the size limit during the session
    LogFull,
    /// A data frame could not be read or acknowledged
    Disconnected,
    /// An append failed and was answered with 500
    WriteFailed,
}

/// Accepts agent connections and persists their streams
pub struct CollectorServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl CollectorServer {
    /// Bind the listen address and make sure the log directory exists
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.log_path)
            .await
            .with_context(|| format!("Failed to create log path {}", config.log_path.display()))?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?;

        info!(
            log_path = %config.log_path.display(),
            listen = %listener.local_addr()?,
            "collector listening"
        );

        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires; each connection runs on its own task
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("collector stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted.context("Failed to accept connection")?,
            };

            let config = self.config.clone();
            tokio::spawn(async move {
                let end = Self::handle_connection(stream, peer, &config).await;
                debug!(peer = %peer, reason = ?end, "connection closed");
            });
        }
    }

    /// Drive one connection from handshake to close
    pub async fn handle_connection<S>(mut stream: S, peer: SocketAddr, config: &ServerConfig) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake_timeout = Some(config.handshake_timeout());

        let frame = match protocol::with_deadline(
            handshake_timeout,
            read_frame(&mut stream, config.max_frame_size),
        )
        .await
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to read handshake");
                return SessionEnd::HandshakeFailed;
            }
        };

        let identity = match parse_identity(&frame) {
            Ok(identity) => identity,
            Err(reason) => {
                warn!(
                    peer = %peer,
                    handshake = %String::from_utf8_lossy(&frame),
                    reason,
                    "rejecting handshake"
                );
                if let Err(e) = respond(&mut stream, STATUS_BAD_REQUEST, config).await {
                    debug!(peer = %peer, error = %e, "failed to send rejection");
                }
                return SessionEnd::Rejected;
            }
        };

        if let Err(e) = respond(&mut stream, STATUS_OK, config).await {
            warn!(peer = %peer, error = %e, "failed to write response");
            return SessionEnd::Disconnected;
        }
        info!(peer = %peer, identity = %identity, "new connection");

        let mut log = match IdentityLog::open_or_rotate(&config.log_path, &identity, config.max_log_size).await {
            Ok(OpenOutcome::Opened(log)) => log,
            Ok(OpenOutcome::Rotated(_)) => return SessionEnd::Rotated,
            Err(e) => {
                error!(peer = %peer, identity = %identity, error = %e, "failed to open log");
                return SessionEnd::OpenFailed;
            }
        };

        loop {
            let frame = match read_frame(&mut stream, config.max_frame_size).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "failed to read frame");
                    return SessionEnd::Disconnected;
                }
            };
            debug!(peer = %peer, bytes = frame.len(), "got frame");

            if let Err(e) = log.append(&frame).await {
                error!(peer = %peer, path = %log.path().display(), error = %e, "failed to append");
                let _ = respond(&mut stream, STATUS_INTERNAL_ERROR, config).await;
                return SessionEnd::WriteFailed;
            }
            if let Err(e) = respond(&mut stream, STATUS_OK, config).await {
                warn!(peer = %peer, error = %e, "failed to write response");
                return SessionEnd::Disconnected;
            }

            if log.is_full() {
                info!(peer = %peer, identity = %identity, "closing connection for log rotation");
                return SessionEnd::LogFull;
            }
        }
    }
}

async fn respond<S>(stream: &mut S, status: i32, config: &ServerConfig) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    protocol::with_deadline(Some(config.handshake_timeout()), write_status(stream, status)).await
}

/// Identity carried by a handshake payload, with path separators replaced
///
/// An empty identity is refused: its backups would be named `-<stamp>.log`,
/// which the retention pattern never matches.
fn parse_identity(frame: &[u8]) -> Result<String, &'static str> {
    let labels: HashMap<String, String> =
        serde_json::from_slice(frame).map_err(|_| "labels are not a JSON object of strings")?;
    let identity = labels
        .get(IDENTITY_LABEL)
        .ok_or("missing docker.name label")?;
    if identity.is_empty() {
        return Err("empty docker.name label");
    }
    Ok(identity.replace('/', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_status, write_frame};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn config(dir: &Path, max_log_size: u64) -> ServerConfig {
        ServerConfig {
            log_path: dir.to_path_buf(),
            listen: "127.0.0.1:0".to_string(),
            max_log_size,
            max_frame_size: 1024,
            ..ServerConfig::default()
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn session(config: ServerConfig) -> (DuplexStream, JoinHandle<SessionEnd>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            CollectorServer::handle_connection(server, peer(), &config).await
        });
        (client, task)
    }

    async fn exchange(client: &mut DuplexStream, payload: &[u8]) -> i32 {
        write_frame(client, payload).await.unwrap();
        read_status(client).await.unwrap()
    }

    fn setup() -> TempDir {
        tempdir().unwrap()
    }

    #[test]
    fn test_parse_identity() {
        assert_eq!(parse_identity(br#"{"docker.name":"web"}"#).unwrap(), "web");
        assert_eq!(parse_identity(br#"{"docker.name":"a/../b"}"#).unwrap(), "a_.._b");
        assert!(parse_identity(br#"{"other":"web"}"#).is_err());
        assert!(parse_identity(br#"{"docker.name":""}"#).is_err());
        assert!(parse_identity(b"not json").is_err());
        assert!(parse_identity(br#"{"docker.name":1}"#).is_err());
    }

    #[tokio::test]
    async fn test_handshake_without_identity_is_rejected() {
        let dir = setup();
        let (mut client, task) = session(config(dir.path(), 1024));

        assert_eq!(exchange(&mut client, br#"{"app":"web"}"#).await, STATUS_BAD_REQUEST);
        assert_eq!(task.await.unwrap(), SessionEnd::Rejected);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_empty_identity_is_rejected() {
        let dir = setup();
        let (mut client, task) = session(config(dir.path(), 1024));

        assert_eq!(exchange(&mut client, br#"{"docker.name":""}"#).await, STATUS_BAD_REQUEST);
        assert_eq!(task.await.unwrap(), SessionEnd::Rejected);
        assert!(!dir.path().join(".log").exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_rejected() {
        let dir = setup();
        let (mut client, task) = session(config(dir.path(), 1024));

        assert_eq!(exchange(&mut client, b"{broken").await, STATUS_BAD_REQUEST);
        assert_eq!(task.await.unwrap(), SessionEnd::Rejected);
    }

    #[tokio::test]
    async fn test_frames_are_appended_in_order() {
        let dir = setup();
        std::fs::write(dir.path().join("web.log"), "existing\n").unwrap();
        let (mut client, task) = session(config(dir.path(), 1024));

        assert_eq!(exchange(&mut client, br#"{"docker.name":"web"}"#).await, STATUS_OK);
        assert_eq!(exchange(&mut client, b"one\n").await, STATUS_OK);
        assert_eq!(exchange(&mut client, b"two\n").await, STATUS_OK);
        drop(client);

        assert_eq!(task.await.unwrap(), SessionEnd::Disconnected);
        let content = std::fs::read_to_string(dir.path().join("web.log")).unwrap();
        assert_eq!(content, "existing\none\ntwo\n");
    }

    #[tokio::test]
    async fn test_full_log_rotates_and_closes() {
        let dir = setup();
        std::fs::write(dir.path().join("web.log"), "0123456789").unwrap();
        let (mut client, task) = session(config(dir.path(), 10));

        assert_eq!(exchange(&mut client, br#"{"docker.name":"web"}"#).await, STATUS_OK);
        assert_eq!(task.await.unwrap(), SessionEnd::Rotated);

        // The rotated connection accepts no data.
        let _ = write_frame(&mut client, b"lost").await;
        assert!(read_status(&mut client).await.is_err());

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(crate::collector::retention::is_backup_file_name(&names[0]));
    }

    #[tokio::test]
    async fn test_session_closes_when_log_fills_up() {
        let dir = setup();
        let (mut client, task) = session(config(dir.path(), 8));

        assert_eq!(exchange(&mut client, br#"{"docker.name":"db"}"#).await, STATUS_OK);
        assert_eq!(exchange(&mut client, b"1234").await, STATUS_OK);
        assert_eq!(exchange(&mut client, b"5678").await, STATUS_OK);
        assert_eq!(task.await.unwrap(), SessionEnd::LogFull);

        // The next connection rotates the full file.
        let (mut client, task) = session(config(dir.path(), 8));
        assert_eq!(exchange(&mut client, br#"{"docker.name":"db"}"#).await, STATUS_OK);
        assert_eq!(task.await.unwrap(), SessionEnd::Rotated);
        assert!(!dir.path().join("db.log").exists());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_session() {
        let dir = setup();
        let (mut client, task) = session(config(dir.path(), 1 << 20));

        assert_eq!(exchange(&mut client, br#"{"docker.name":"web"}"#).await, STATUS_OK);
        write_frame(&mut client, &vec![b'x'; 2048]).await.unwrap();
        assert_eq!(task.await.unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn test_slow_handshake_times_out() {
        let dir = setup();
        let mut config = config(dir.path(), 1024);
        config.handshake_timeout = 1;
        let (_client, task) = session(config);

        let end = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::HandshakeFailed);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let dir = setup();
        let server = CollectorServer::bind(config(dir.path(), 1024)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let serving = tokio::spawn(server.serve(cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        protocol::send_and_confirm(&mut stream, br#"{"docker.name":"ns/web"}"#, None)
            .await
            .unwrap();
        protocol::send_and_confirm(&mut stream, b"hello\n", None).await.unwrap();

        cancel.cancel();
        serving.await.unwrap().unwrap();

        let content = std::fs::read_to_string(dir.path().join("ns_web.log")).unwrap();
        assert_eq!(content, "hello\n");
    }
}
