//! The helper's side of the authenticated agent channel.
//!
//! Bootstrap: read the short-lived config the agent wrote (and delete it
//! so the token cannot be replayed), connect to the named channel,
//! present the token, then serve session control frames with status and
//! heartbeats upstream until told to stop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sentinel_core::ipc::{HelperMessage, IpcStream};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::exit_codes;

/// Heartbeat cadence toward the agent.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// With no active session for this long, the helper retires itself.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// The bootstrap record the agent writes before launching the helper.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    pub session_id: u32,
    pub auth_token: String,
    pub channel_name: PathBuf,
}

/// Read and immediately delete the bootstrap config. The delete is part
/// of the contract: the one-shot token must not linger on disk.
pub fn read_bootstrap(path: &Path) -> Result<BootstrapConfig, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("config read: {e}"))?;
    let config: BootstrapConfig =
        serde_json::from_str(&contents).map_err(|e| format!("config parse: {e}"))?;
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Could not delete bootstrap config: {e}");
    }
    Ok(config)
}

/// Connect, authenticate, and serve until a terminal condition. Returns
/// the process exit code.
pub async fn run(config: BootstrapConfig) -> i32 {
    let mut stream = match IpcStream::connect(&config.channel_name).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not reach agent channel: {e}");
            return exit_codes::CHANNEL_DISCONNECTED;
        }
    };

    let auth = HelperMessage::Auth {
        session_id: config.session_id,
        token: config.auth_token.clone(),
    };
    if stream.send(&auth).await.is_err() {
        return exit_codes::CHANNEL_DISCONNECTED;
    }

    match stream.recv::<HelperMessage>().await {
        Ok(Some(HelperMessage::AuthOk)) => {}
        Ok(Some(HelperMessage::AuthDenied { reason })) => {
            warn!("Agent denied auth: {reason}");
            return if reason.contains("expired") {
                exit_codes::TOKEN_EXPIRED
            } else {
                exit_codes::AUTH_FAILED
            };
        }
        Ok(Some(other)) => {
            warn!("Unexpected frame before auth result: {other:?}");
            return exit_codes::AUTH_FAILED;
        }
        Ok(None) | Err(_) => return exit_codes::CHANNEL_DISCONNECTED,
    }

    info!(
        "Helper authenticated for interactive session {}",
        config.session_id
    );
    serve(stream).await
}

/// Steady state after auth: heartbeats out, control frames in.
async fn serve(mut stream: IpcStream) -> i32 {
    let mut active_sessions: Vec<String> = Vec::new();
    let mut last_activity = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if stream.send(&HelperMessage::Heartbeat).await.is_err() {
                    return exit_codes::CHANNEL_DISCONNECTED;
                }
                if active_sessions.is_empty()
                    && last_activity.elapsed() > IDLE_TIMEOUT
                {
                    info!("No session activity, retiring");
                    return exit_codes::IDLE_TIMEOUT;
                }
            }

            inbound = stream.recv::<HelperMessage>() => {
                let message = match inbound {
                    Ok(Some(message)) => message,
                    Ok(None) => return exit_codes::CHANNEL_DISCONNECTED,
                    Err(e) => {
                        warn!("Channel error: {e}");
                        return exit_codes::CHANNEL_DISCONNECTED;
                    }
                };
                last_activity = Instant::now();

                match message {
                    HelperMessage::StartSession { session_id } => {
                        info!("Serving remote session {session_id}");
                        if !active_sessions.contains(&session_id) {
                            active_sessions.push(session_id.clone());
                        }
                        let status = HelperMessage::Status {
                            state: format!("session_active:{session_id}"),
                        };
                        if stream.send(&status).await.is_err() {
                            return exit_codes::CHANNEL_DISCONNECTED;
                        }
                    }
                    HelperMessage::StopSession { session_id } => {
                        info!("Stopping remote session {session_id}");
                        active_sessions.retain(|s| s != &session_id);
                        let status = HelperMessage::Status {
                            state: format!("session_stopped:{session_id}"),
                        };
                        if stream.send(&status).await.is_err() {
                            return exit_codes::CHANNEL_DISCONNECTED;
                        }
                    }
                    HelperMessage::Input { session_id, .. } => {
                        // Input events go to the desktop of the addressed
                        // session; unknown ids are stale and dropped.
                        if !active_sessions.contains(&session_id) {
                            debug!("Input for inactive session {session_id}");
                        }
                    }
                    HelperMessage::Shutdown => {
                        info!("Agent requested shutdown");
                        return exit_codes::SHUTDOWN_REQUESTED;
                    }
                    other => debug!("Ignoring frame {other:?}"),
                }
            }
        }
    }
}
