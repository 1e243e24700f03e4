//! Remote-desktop sessions bridged through the interactive-session helper.
//!
//! The dispatcher opens the helper channel before the session exists, so
//! a missing desktop fails the open instead of producing a dead session.
//! Captured frames ride the session queue with the DropOldest policy:
//! under congestion the newest frame wins.

use std::sync::Arc;

use base64::Engine;
use sentinel_core::frames::{kind, output, Frame};
use sentinel_core::ipc::HelperMessage;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::queue::FrameQueue;
use super::SessionInput;
use crate::helper::{HelperManager, RemoteSessionChannel};

/// Start a remote-desktop session worker over an already-authenticated
/// helper channel.
pub fn spawn(
    session_id: &str,
    channel: RemoteSessionChannel,
    manager: Arc<HelperManager>,
    queue: FrameQueue,
) -> (mpsc::Sender<SessionInput>, JoinHandle<()>) {
    let (input_tx, input_rx) = mpsc::channel(64);
    let worker = tokio::spawn(run_worker(
        session_id.to_string(),
        channel,
        manager,
        input_rx,
        queue,
    ));
    (input_tx, worker)
}

async fn run_worker(
    session_id: String,
    mut channel: RemoteSessionChannel,
    manager: Arc<HelperManager>,
    mut input_rx: mpsc::Receiver<SessionInput>,
    queue: FrameQueue,
) {
    let b64 = base64::engine::general_purpose::STANDARD;

    loop {
        tokio::select! {
            _ = channel.closed.cancelled() => {
                debug!("Remote {session_id}: helper connection closed");
                break;
            }

            input = input_rx.recv() => match input {
                None | Some(SessionInput::Close) => break,
                Some(SessionInput::RemoteInput(bytes)) => {
                    let message = HelperMessage::Input {
                        session_id: session_id.clone(),
                        data: b64.encode(&bytes),
                    };
                    if channel.control_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Some(other) => warn!("Remote {session_id}: unsupported input {other:?}"),
            },

            frame = channel.frames_rx.recv() => match frame {
                None => break,
                Some(bytes) => {
                    let wire = Frame::new(
                        kind::SESSION_OUTPUT,
                        json!({
                            "session_id": session_id,
                            "subtype": output::REMOTE_FRAME,
                            "data": b64.encode(&bytes),
                        }),
                    );
                    if queue.push(wire).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    manager.close_remote_session(&session_id).await;
    queue.close();
    debug!("Remote session {session_id} ended");
}
