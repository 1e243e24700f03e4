//! Local IPC between the endpoint processes.
//!
//! Newline-delimited JSON over a unix-domain socket (posix) or a named
//! pipe (windows). Both the supervisor nudge channel and the helper
//! control channel use the same framing; only the message enums differ.
//! The endpoint is restricted to the owning account: file mode 0600 on
//! posix, the default SYSTEM/administrators descriptor on windows.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum accepted line length. A peer that sends more is broken.
const MAX_LINE_SIZE: usize = 1_048_576;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IPC I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("IPC message is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("IPC message exceeds {MAX_LINE_SIZE} bytes")]
    Oversized,
}

// ── Message sets ────────────────────────────────────────────────────

/// Agent → supervisor realtime signals. The request file stays the
/// durable contract; these only shortcut the supervisor's poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    UpdateRequestReady { request_path: PathBuf },
}

/// Frames on the agent ↔ helper channel, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    /// Helper → agent, first frame: prove identity.
    Auth { session_id: u32, token: String },
    /// Agent → helper.
    AuthOk,
    /// Agent → helper; the helper exits with its auth-failed code.
    AuthDenied { reason: String },
    /// Agent → helper: begin serving a remote-desktop session.
    StartSession { session_id: String },
    /// Agent → helper.
    StopSession { session_id: String },
    /// Agent → helper: opaque input event bytes (base64).
    Input { session_id: String, data: String },
    /// Helper → agent: captured frame bytes (base64).
    Frame { session_id: String, data: String },
    /// Helper → agent.
    Status { state: String },
    /// Helper → agent, every 5 seconds.
    Heartbeat,
    /// Agent → helper: exit with the shutdown-requested code.
    Shutdown,
}

// ── Stream ──────────────────────────────────────────────────────────

/// One connected IPC peer, reading and writing NDJSON.
pub struct IpcStream {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl IpcStream {
    /// Wrap any bidirectional byte stream (used by tests with a duplex pair).
    pub fn from_io(io: impl AsyncRead + AsyncWrite + Send + Unpin + 'static) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
        }
    }

    /// Connect to a listening endpoint.
    pub async fn connect(endpoint: &Path) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(endpoint).await?;
            Ok(Self::from_io(stream))
        }
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ClientOptions;
            let client = ClientOptions::new().open(endpoint)?;
            Ok(Self::from_io(client))
        }
    }

    /// Send one message as one line.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next message, or `None` on clean EOF.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_LINE_SIZE {
            return Err(IpcError::Oversized);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }
}

// ── Listener ────────────────────────────────────────────────────────

/// Server side of an IPC endpoint.
pub struct IpcListener {
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(unix)]
    path: PathBuf,
    #[cfg(windows)]
    endpoint: PathBuf,
    #[cfg(windows)]
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

impl IpcListener {
    /// Bind the endpoint, replacing a stale one left by a crashed process.
    pub fn bind(endpoint: &Path) -> io::Result<Self> {
        #[cfg(unix)]
        {
            if endpoint.exists() {
                std::fs::remove_file(endpoint)?;
            }
            if let Some(parent) = endpoint.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let inner = tokio::net::UnixListener::bind(endpoint)?;
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(endpoint, std::fs::Permissions::from_mode(0o600))?;
            }
            Ok(Self {
                inner,
                path: endpoint.to_path_buf(),
            })
        }
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(endpoint)?;
            Ok(Self {
                endpoint: endpoint.to_path_buf(),
                server: Some(server),
            })
        }
    }

    /// Wait for the next client.
    pub async fn accept(&mut self) -> io::Result<IpcStream> {
        #[cfg(unix)]
        {
            let (stream, _addr) = self.inner.accept().await?;
            Ok(IpcStream::from_io(stream))
        }
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;
            let server = match self.server.take() {
                Some(server) => server,
                None => ServerOptions::new().create(&self.endpoint)?,
            };
            server.connect().await?;
            // Stand up the next instance before handing this one out so a
            // second client never sees a missing pipe.
            self.server = Some(ServerOptions::new().create(&self.endpoint)?);
            Ok(IpcStream::from_io(server))
        }
    }
}

#[cfg(unix)]
impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = IpcStream::from_io(a);
        let mut rx = IpcStream::from_io(b);

        tx.send(&HelperMessage::Heartbeat).await.unwrap();
        tx.send(&HelperMessage::Status {
            state: "active".into(),
        })
        .await
        .unwrap();

        assert_eq!(
            rx.recv::<HelperMessage>().await.unwrap(),
            Some(HelperMessage::Heartbeat)
        );
        assert_eq!(
            rx.recv::<HelperMessage>().await.unwrap(),
            Some(HelperMessage::Status {
                state: "active".into()
            })
        );
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut rx = IpcStream::from_io(b);
        assert!(rx.recv::<HelperMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_line_is_a_parse_error() {
        let (a, b) = tokio::io::duplex(64);
        let mut rx = IpcStream::from_io(b);
        tokio::spawn(async move {
            let mut raw = a;
            raw.write_all(b"not json\n").await.unwrap();
        });
        assert!(matches!(
            rx.recv::<HelperMessage>().await,
            Err(IpcError::Parse(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_round_trip_with_restricted_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let endpoint = tmp.path().join("test.sock");
        let mut listener = IpcListener::bind(&endpoint).unwrap();

        let mode = std::fs::metadata(&endpoint).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let endpoint_clone = endpoint.clone();
        let client = tokio::spawn(async move {
            let mut stream = IpcStream::connect(&endpoint_clone).await.unwrap();
            stream
                .send(&SupervisorMessage::UpdateRequestReady {
                    request_path: "/tmp/update-request.json".into(),
                })
                .await
                .unwrap();
        });

        let mut server_side = listener.accept().await.unwrap();
        let message = server_side
            .recv::<SupervisorMessage>()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            SupervisorMessage::UpdateRequestReady {
                request_path: "/tmp/update-request.json".into()
            }
        );
        client.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rebind_replaces_stale_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = tmp.path().join("stale.sock");
        let first = IpcListener::bind(&endpoint).unwrap();
        std::mem::forget(first); // simulate a crash that leaves the file
        let _second = IpcListener::bind(&endpoint).unwrap();
    }
}
