//! Terminal sessions backed by a local pty.
//!
//! Each session owns the pty pair and the shell child. A blocking reader
//! thread pumps pty output into the worker, which frames it as
//! `terminal_output` and pushes onto the session's outbound queue (Block
//! policy, so a congested channel stalls the pty instead of dropping
//! interactive output).

use std::io::Write;
use std::path::Path;

use base64::Engine;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use sentinel_core::frames::{kind, output, Frame};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::queue::FrameQueue;
use super::SessionInput;

/// Upper bound for one `terminal_output` frame before base64 expansion.
const OUTPUT_CHUNK: usize = 49_152;

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("pty error: {0}")]
    Pty(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone)]
pub struct TerminalParams {
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Pick the shell for a terminal session: the requested one, else the
/// platform default.
fn resolve_shell(requested: Option<&str>) -> String {
    if let Some(shell) = requested {
        return shell.to_string();
    }
    #[cfg(windows)]
    {
        "cmd.exe".to_string()
    }
    #[cfg(not(windows))]
    {
        if let Ok(shell) = std::env::var("SHELL") {
            if Path::new(&shell).exists() {
                return shell;
            }
        }
        for candidate in ["/bin/bash", "/usr/bin/bash", "/bin/sh"] {
            if Path::new(candidate).exists() {
                return candidate.to_string();
            }
        }
        "/bin/sh".to_string()
    }
}

/// Start a terminal session worker. Returns the input sender and the
/// worker handle; output flows into `queue` until the shell exits or the
/// session is closed.
pub fn spawn(
    session_id: &str,
    params: TerminalParams,
    queue: FrameQueue,
) -> Result<(mpsc::Sender<SessionInput>, JoinHandle<()>), TerminalError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: params.rows,
            cols: params.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TerminalError::Pty(e.to_string()))?;

    let shell = resolve_shell(params.shell.as_deref());
    let mut command = CommandBuilder::new(&shell);
    command.env("TERM", "xterm-256color");

    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|e| TerminalError::Spawn(e.to_string()))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TerminalError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| TerminalError::Pty(e.to_string()))?;

    // Blocking pty reads happen on a dedicated thread; the bounded channel
    // carries backpressure from the worker back to the pty.
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buf = [0u8; 8192];
        loop {
            match std::io::Read::read(&mut reader, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (input_tx, input_rx) = mpsc::channel(64);
    let worker = tokio::spawn(run_worker(
        session_id.to_string(),
        child,
        pair.master,
        writer,
        input_rx,
        output_rx,
        queue,
    ));

    debug!("Terminal session {session_id} started with shell {shell}");
    Ok((input_tx, worker))
}

async fn run_worker(
    session_id: String,
    mut child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<SessionInput>,
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    queue: FrameQueue,
) {
    let b64 = base64::engine::general_purpose::STANDARD;

    'main: loop {
        tokio::select! {
            input = input_rx.recv() => match input {
                None | Some(SessionInput::Close) => break 'main,
                Some(SessionInput::TerminalInput(bytes)) => {
                    if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                        warn!("Terminal {session_id}: pty write failed: {e}");
                        break 'main;
                    }
                }
                Some(SessionInput::Resize { cols, rows }) => {
                    if let Err(e) = master.resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    }) {
                        warn!("Terminal {session_id}: resize failed: {e}");
                    }
                }
                Some(other) => {
                    warn!("Terminal {session_id}: unsupported input {other:?}");
                }
            },

            chunk = output_rx.recv() => match chunk {
                None => break 'main, // pty EOF: the shell exited
                Some(bytes) => {
                    for piece in bytes.chunks(OUTPUT_CHUNK) {
                        let frame = Frame::new(
                            kind::SESSION_OUTPUT,
                            json!({
                                "session_id": session_id,
                                "subtype": output::TERMINAL_OUTPUT,
                                "data": b64.encode(piece),
                            }),
                        );
                        if queue.push(frame).await.is_err() {
                            break 'main;
                        }
                    }
                }
            },
        }
    }

    if let Err(e) = child.kill() {
        debug!("Terminal {session_id}: kill after close: {e}");
    }
    // Reap off the async thread; pty children exit quickly after SIGKILL.
    let _ = tokio::task::spawn_blocking(move || child.wait()).await;
    queue.close();
    debug!("Terminal session {session_id} ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::OverflowPolicy;
    use std::time::Duration;

    #[test]
    fn resolve_shell_prefers_request() {
        assert_eq!(resolve_shell(Some("/bin/dash")), "/bin/dash");
    }

    #[cfg(unix)]
    #[test]
    fn resolve_shell_default_exists() {
        let shell = resolve_shell(None);
        assert!(Path::new(&shell).exists(), "default shell missing: {shell}");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn echo_round_trip() {
        let queue = FrameQueue::new(128, OverflowPolicy::Block);
        let params = TerminalParams {
            shell: Some("/bin/sh".into()),
            cols: 80,
            rows: 24,
        };
        let (input_tx, worker) = spawn("t-1", params, queue.clone()).unwrap();

        input_tx
            .send(SessionInput::TerminalInput(
                b"echo sentinel-$((40+2))\n".to_vec(),
            ))
            .await
            .unwrap();

        let b64 = base64::engine::general_purpose::STANDARD;
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let frame = tokio::time::timeout_at(deadline, queue.pop())
                .await
                .expect("timed out waiting for output")
                .expect("queue closed before output");
            assert_eq!(frame.payload["subtype"], "terminal_output");
            let data = frame.payload["data"].as_str().unwrap();
            collected.extend(b64.decode(data).unwrap());
            if String::from_utf8_lossy(&collected).contains("sentinel-42") {
                break;
            }
        }

        input_tx.send(SessionInput::Close).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .unwrap()
            .unwrap();
        // After the worker ends the queue is closed and drains to None.
        while queue.pop().await.is_some() {}
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn shell_exit_closes_queue() {
        let queue = FrameQueue::new(128, OverflowPolicy::Block);
        let params = TerminalParams {
            shell: Some("/bin/sh".into()),
            cols: 80,
            rows: 24,
        };
        let (input_tx, worker) = spawn("t-2", params, queue.clone()).unwrap();

        input_tx
            .send(SessionInput::TerminalInput(b"exit\n".to_vec()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .unwrap()
            .unwrap();
        while queue.pop().await.is_some() {}
    }
}
