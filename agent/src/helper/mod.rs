//! Helper lifecycle: the per-user desktop worker.
//!
//! The agent runs as a system service in a non-interactive session, so
//! anything that must touch the interactive desktop is delegated to the
//! helper binary spawned inside the console user's session. The spawn
//! protocol: write a short-lived bootstrap config (session id, one-shot
//! auth token, channel name), trigger the pre-registered scheduled task,
//! fall back to a direct spawn, then authenticate the helper on the named
//! channel. The token expires after 60 seconds; the helper heartbeats
//! every 5 seconds and three misses terminate it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use sentinel_core::handshake::write_json_atomic_with_mode;
use sentinel_core::ipc::{HelperMessage, IpcListener, IpcStream};
use sentinel_core::paths;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Auth tokens are single-use and expire quickly.
const TOKEN_TTL: Duration = Duration::from_secs(60);

/// Helpers heartbeat every 5 s; three consecutive misses are fatal.
const HEARTBEAT_LIMIT: Duration = Duration::from_secs(15);

/// How long to wait for the spawned helper to connect and authenticate.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("failed to launch helper: {0}")]
    Spawn(String),
    #[error("helper did not connect in time")]
    ConnectTimeout,
    #[error("helper authentication failed: {0}")]
    AuthFailed(String),
    #[error("helper I/O error: {0}")]
    Io(String),
    #[error("interactive desktop unavailable: {0}")]
    Unavailable(String),
}

/// One remote-desktop session's view of the helper connection.
pub struct RemoteSessionChannel {
    /// Decoded frame bytes captured by the helper for this session.
    pub frames_rx: mpsc::Receiver<Vec<u8>>,
    /// Control and input frames toward the helper.
    pub control_tx: mpsc::Sender<HelperMessage>,
    /// Cancelled when the helper connection dies.
    pub closed: CancellationToken,
}

#[derive(Clone)]
struct HelperConn {
    control_tx: mpsc::Sender<HelperMessage>,
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
    alive: CancellationToken,
}

/// Owns the single helper process per interactive session.
pub struct HelperManager {
    data_dir: PathBuf,
    conn: Mutex<Option<HelperConn>>,
    shutdown: CancellationToken,
}

impl HelperManager {
    pub fn new(data_dir: PathBuf, shutdown: CancellationToken) -> Self {
        Self {
            data_dir,
            conn: Mutex::new(None),
            shutdown,
        }
    }

    /// Open a remote-desktop session, spawning and authenticating the
    /// helper first if none is connected.
    pub async fn open_remote_session(
        &self,
        session_id: &str,
    ) -> Result<RemoteSessionChannel, HelperError> {
        let mut guard = self.conn.lock().await;
        let conn = match guard.as_ref() {
            Some(conn) if !conn.alive.is_cancelled() => conn.clone(),
            _ => {
                let conn = self.connect_helper().await?;
                *guard = Some(conn.clone());
                conn
            }
        };
        drop(guard);

        let (frames_tx, frames_rx) = mpsc::channel(64);
        conn.routes
            .lock()
            .await
            .insert(session_id.to_string(), frames_tx);
        conn.control_tx
            .send(HelperMessage::StartSession {
                session_id: session_id.to_string(),
            })
            .await
            .map_err(|_| HelperError::Io("helper connection closed".into()))?;

        Ok(RemoteSessionChannel {
            frames_rx,
            control_tx: conn.control_tx.clone(),
            closed: conn.alive.clone(),
        })
    }

    /// Drop the frame route for a finished remote session.
    pub async fn close_remote_session(&self, session_id: &str) {
        let guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            conn.routes.lock().await.remove(session_id);
            let _ = conn
                .control_tx
                .send(HelperMessage::StopSession {
                    session_id: session_id.to_string(),
                })
                .await;
        }
    }

    /// Full spawn protocol: config file, scheduled task (fallback: direct
    /// spawn), accept, authenticate.
    async fn connect_helper(&self) -> Result<HelperConn, HelperError> {
        let console_session = resolve_console_session()
            .ok_or_else(|| HelperError::Unavailable("no active console session".into()))?;

        let endpoint = paths::helper_endpoint(&self.data_dir, console_session);
        let token = generate_token();
        let issued = Instant::now();

        let config_path = paths::helper_config_path(&self.data_dir, console_session);
        write_json_atomic_with_mode(
            &config_path,
            &json!({
                "session_id": console_session,
                "auth_token": token,
                "channel_name": endpoint.to_string_lossy(),
            }),
            0o600,
        )
        .map_err(|e| HelperError::Spawn(format!("config write failed: {e}")))?;

        let mut listener =
            IpcListener::bind(&endpoint).map_err(|e| HelperError::Io(e.to_string()))?;

        // Scheduled task first; direct spawn only as fallback.
        if let Err(task_err) = launch_via_scheduled_task() {
            debug!("Scheduled-task launch unavailable ({task_err}), spawning directly");
            launch_directly(&self.data_dir, console_session).map_err(HelperError::Spawn)?;
        }

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| HelperError::ConnectTimeout)?
            .map_err(|e| HelperError::Io(e.to_string()))?;

        let first = tokio::time::timeout(CONNECT_TIMEOUT, stream.recv::<HelperMessage>())
            .await
            .map_err(|_| HelperError::ConnectTimeout)?
            .map_err(|e| HelperError::Io(e.to_string()))?
            .ok_or_else(|| HelperError::Io("helper hung up before auth".into()))?;

        if let Err(reason) = verify_auth(&first, console_session, &token, issued.elapsed()) {
            let _ = stream
                .send(&HelperMessage::AuthDenied {
                    reason: reason.clone(),
                })
                .await;
            return Err(HelperError::AuthFailed(reason));
        }

        stream
            .send(&HelperMessage::AuthOk)
            .await
            .map_err(|e| HelperError::Io(e.to_string()))?;

        info!("Helper authenticated for console session {console_session}");

        let (control_tx, control_rx) = mpsc::channel(64);
        let routes: Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = self.shutdown.child_token();

        tokio::spawn(serve_helper(
            stream,
            control_rx,
            routes.clone(),
            alive.clone(),
        ));

        Ok(HelperConn {
            control_tx,
            routes,
            alive,
        })
    }
}

/// Pump the authenticated helper connection: outbound control frames,
/// inbound captured frames, heartbeat supervision.
async fn serve_helper(
    mut stream: IpcStream,
    mut control_rx: mpsc::Receiver<HelperMessage>,
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
    alive: CancellationToken,
) {
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut last_heartbeat = Instant::now();
    let mut watchdog = tokio::time::interval(Duration::from_secs(5));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = alive.cancelled() => {
                let _ = stream.send(&HelperMessage::Shutdown).await;
                break;
            }

            _ = watchdog.tick() => {
                if last_heartbeat.elapsed() > HEARTBEAT_LIMIT {
                    warn!("Helper missed three heartbeats, terminating");
                    let _ = stream.send(&HelperMessage::Shutdown).await;
                    break;
                }
            }

            control = control_rx.recv() => {
                let Some(message) = control else { break };
                if stream.send(&message).await.is_err() {
                    break;
                }
            }

            inbound = stream.recv::<HelperMessage>() => match inbound {
                Err(e) => {
                    warn!("Helper channel error: {e}");
                    break;
                }
                Ok(None) => {
                    debug!("Helper disconnected");
                    break;
                }
                Ok(Some(HelperMessage::Heartbeat)) => last_heartbeat = Instant::now(),
                Ok(Some(HelperMessage::Status { state })) => {
                    debug!("Helper status: {state}");
                    last_heartbeat = Instant::now();
                }
                Ok(Some(HelperMessage::Frame { session_id, data })) => {
                    last_heartbeat = Instant::now();
                    let Ok(bytes) = b64.decode(&data) else {
                        warn!("Helper sent undecodable frame for {session_id}");
                        continue;
                    };
                    let routes = routes.lock().await;
                    if let Some(tx) = routes.get(&session_id) {
                        // Dropping here is fine: the remote session's own
                        // queue applies latest-frame-wins anyway.
                        let _ = tx.try_send(bytes);
                    }
                }
                Ok(Some(other)) => debug!("Ignoring helper message {other:?}"),
            },
        }
    }

    alive.cancel();
}

/// Check the helper's first frame against the issued token, the console
/// session it must live in, and the token TTL.
fn verify_auth(
    message: &HelperMessage,
    expected_session: u32,
    expected_token: &str,
    token_age: Duration,
) -> Result<(), String> {
    let HelperMessage::Auth { session_id, token } = message else {
        return Err("first frame was not auth".to_string());
    };
    if token_age > TOKEN_TTL {
        return Err("auth token expired".to_string());
    }
    if *session_id != expected_session {
        return Err(format!(
            "session mismatch: expected {expected_session}, got {session_id}"
        ));
    }
    if token != expected_token {
        return Err("auth token mismatch".to_string());
    }
    Ok(())
}

fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// The interactive session the helper must run in.
fn resolve_console_session() -> Option<u32> {
    #[cfg(windows)]
    {
        // The console session is the one marked Active in `qwinsta`.
        let output = std::process::Command::new("qwinsta").output().ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            if line.contains("Active") {
                for field in line.split_whitespace() {
                    if let Ok(id) = field.parse::<u32>() {
                        return Some(id);
                    }
                }
            }
        }
        None
    }
    #[cfg(not(windows))]
    {
        // Remote desktop is windows-only; session 0 stands in so the
        // spawn/auth machinery stays exercisable on the development host.
        Some(0)
    }
}

/// Preferred launch path: the pre-registered scheduled task runs the
/// helper inside the interactive session with the user's token.
fn launch_via_scheduled_task() -> Result<(), String> {
    #[cfg(windows)]
    {
        let status = std::process::Command::new("schtasks")
            .args(["/run", "/tn", "Sentinel Helper"])
            .status()
            .map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("schtasks exited with {status}"))
        }
    }
    #[cfg(not(windows))]
    {
        Err("scheduled tasks unsupported on this platform".to_string())
    }
}

/// Fallback launch path: spawn the helper binary directly.
fn launch_directly(data_dir: &std::path::Path, console_session: u32) -> Result<(), String> {
    let helper_exe = std::env::current_exe()
        .map_err(|e| e.to_string())?
        .with_file_name(helper_binary_name());
    if !helper_exe.exists() {
        return Err(format!("helper binary not found at {}", helper_exe.display()));
    }
    std::process::Command::new(&helper_exe)
        .env(paths::DATA_DIR_ENV, data_dir)
        .arg(format!("--session={console_session}"))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::inherit())
        .spawn()
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn helper_binary_name() -> &'static str {
    if cfg!(windows) {
        "sentinel-helper.exe"
    } else {
        "sentinel-helper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(session_id: u32, token: &str) -> HelperMessage {
        HelperMessage::Auth {
            session_id,
            token: token.to_string(),
        }
    }

    #[test]
    fn auth_accepts_matching_token_and_session() {
        let result = verify_auth(&auth(3, "tok"), 3, "tok", Duration::from_secs(5));
        assert!(result.is_ok());
    }

    #[test]
    fn auth_rejects_expired_token() {
        let result = verify_auth(&auth(3, "tok"), 3, "tok", Duration::from_secs(61));
        assert_eq!(result.unwrap_err(), "auth token expired");
    }

    #[test]
    fn auth_rejects_wrong_session() {
        let result = verify_auth(&auth(4, "tok"), 3, "tok", Duration::from_secs(5));
        assert!(result.unwrap_err().contains("session mismatch"));
    }

    #[test]
    fn auth_rejects_wrong_token() {
        let result = verify_auth(&auth(3, "other"), 3, "tok", Duration::from_secs(5));
        assert_eq!(result.unwrap_err(), "auth token mismatch");
    }

    #[test]
    fn auth_rejects_non_auth_first_frame() {
        let result = verify_auth(
            &HelperMessage::Heartbeat,
            3,
            "tok",
            Duration::from_secs(5),
        );
        assert!(result.unwrap_err().contains("not auth"));
    }
}
