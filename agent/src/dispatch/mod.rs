//! The session dispatcher: one consumer of the control channel's event
//! stream, multiplexing commands and long-lived sessions over it.
//!
//! Sessions live in a dispatcher-owned table keyed by `session_id`;
//! workers hold only their input receiver and a handle to their bounded
//! outbound queue (arena + handle, no cycles). A drain task per session
//! forwards queued frames into the channel, so per-session order is
//! preserved while sessions interleave. On every reconnect the table is
//! cleared: the server opens fresh sessions against the new generation.

pub mod file_browser;
pub mod queue;
pub mod remote;
pub mod terminal;

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use sentinel_core::config::ConfigStore;
use sentinel_core::frames::{
    close_reason, kind, AgentInventoryPayload, Frame, ListFilesPayload, RemoteInputPayload,
    SessionRefPayload, StartTerminalPayload, TerminalInputPayload, TerminalResizePayload,
    UploadFilePayload,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelHandle};
use crate::command::CommandEngine;
use crate::helper::HelperManager;
use crate::update::UpdateCoordinator;

use self::queue::{FrameQueue, OverflowPolicy};

const TERMINAL_QUEUE_DEPTH: usize = 128;
const FILE_QUEUE_DEPTH: usize = 64;
const REMOTE_QUEUE_DEPTH: usize = 32;

/// The three session kinds the server can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Terminal,
    FileBrowser,
    RemoteDesktop,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::FileBrowser => "file_browser",
            Self::RemoteDesktop => "remote_desktop",
        }
    }
}

/// Inputs routed from inbound frames to a session worker.
#[derive(Debug)]
pub enum SessionInput {
    TerminalInput(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    ListFiles { path: String },
    Download { path: String },
    Upload { path: String, data: Vec<u8> },
    RemoteInput(Vec<u8>),
    Close,
}

/// Dispatcher-side record of a live session. The worker and drain tasks
/// run detached; closing the queue and the input channel winds them down.
/// The nonce distinguishes this instance from an earlier session that
/// reused the same id, so a stale worker-exit note cannot kill it.
struct SessionHandle {
    kind: SessionKind,
    nonce: u64,
    input_tx: mpsc::Sender<SessionInput>,
    queue: FrameQueue,
}

/// Internal notifications from per-session tasks back to the run loop.
enum Note {
    SessionEnded {
        session_id: String,
        nonce: u64,
    },
    RemoteOpened {
        session_id: String,
        channel: crate::helper::RemoteSessionChannel,
    },
    RemoteOpenFailed {
        session_id: String,
        reason: String,
    },
}

pub struct Dispatcher {
    handle: ChannelHandle,
    config_store: Arc<ConfigStore>,
    engine: Arc<CommandEngine>,
    update: Arc<UpdateCoordinator>,
    helper: Arc<HelperManager>,
    shutdown: CancellationToken,
    sessions: HashMap<String, SessionHandle>,
    next_nonce: u64,
    notes_tx: mpsc::UnboundedSender<Note>,
    notes_rx: mpsc::UnboundedReceiver<Note>,
    inventory: AgentInventoryPayload,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: ChannelHandle,
        config_store: Arc<ConfigStore>,
        engine: Arc<CommandEngine>,
        update: Arc<UpdateCoordinator>,
        helper: Arc<HelperManager>,
        inventory: AgentInventoryPayload,
        shutdown: CancellationToken,
    ) -> Self {
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            config_store,
            engine,
            update,
            helper,
            shutdown,
            sessions: HashMap::new(),
            next_nonce: 0,
            notes_tx,
            notes_rx,
            inventory,
        }
    }

    /// Consume channel events until the channel stops or the agent shuts
    /// down. This is the agent's main loop.
    pub async fn run(mut self, mut events: mpsc::Receiver<ChannelEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.close_all(close_reason::SHUTDOWN).await;
                    return;
                }

                note = self.notes_rx.recv() => {
                    if let Some(note) = note {
                        self.handle_note(note).await;
                    }
                }

                event = events.recv() => match event {
                    None => {
                        self.close_all(close_reason::CHANNEL_CLOSED).await;
                        return;
                    }
                    Some(ChannelEvent::Connected { generation, device_id }) => {
                        self.on_connected(generation, device_id).await;
                    }
                    Some(ChannelEvent::Frame(frame)) => self.handle_frame(frame).await,
                    Some(ChannelEvent::Reconnecting) => {
                        self.close_all(close_reason::CHANNEL_CLOSED).await;
                    }
                    Some(ChannelEvent::Stopped { reason }) => {
                        info!("Channel stopped ({reason}), dispatcher exiting");
                        self.close_all(close_reason::CHANNEL_CLOSED).await;
                        return;
                    }
                },
            }
        }
    }

    async fn on_connected(&mut self, generation: u64, device_id: Option<String>) {
        debug!(generation, "Dispatcher saw new connection");
        // Sessions never survive a generation change.
        self.close_all(close_reason::CHANNEL_CLOSED).await;

        if let Some(device_id) = device_id {
            if let Err(e) = self.config_store.record_enrollment(&device_id).await {
                warn!("Failed to persist enrollment: {e}");
            }
        }

        let inventory = Frame::new(
            kind::AGENT_INFO,
            serde_json::to_value(&self.inventory).unwrap_or_else(|_| json!({})),
        );
        let _ = self.handle.send(inventory).await;

        // Relay the supervisor's verdict from a just-applied update.
        if let Some(status) = self.update.last_status() {
            let frame = Frame::new(
                kind::UPDATE_STATUS,
                serde_json::to_value(&status).unwrap_or_else(|_| json!({})),
            );
            let _ = self.handle.send(frame).await;
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.kind.as_str() {
            kind::EXECUTE_COMMAND => self.spawn_command(&frame, false),
            kind::EXECUTE_SCRIPT => self.spawn_command(&frame, true),

            kind::START_TERMINAL => self.open_terminal(&frame).await,
            kind::TERMINAL_INPUT => self.route_terminal_input(&frame).await,
            kind::TERMINAL_RESIZE => self.route_resize(&frame).await,
            kind::CLOSE_TERMINAL => self.close_by_ref(&frame).await,

            kind::LIST_FILES => self.route_file_op(&frame).await,
            kind::DOWNLOAD_FILE => self.route_file_op(&frame).await,
            kind::UPLOAD_FILE => self.route_file_op(&frame).await,

            kind::START_REMOTE => self.open_remote(&frame).await,
            kind::REMOTE_INPUT => self.route_remote_input(&frame).await,
            kind::STOP_REMOTE => self.close_by_ref(&frame).await,

            kind::UPDATE_AVAILABLE => self.spawn_update(&frame),

            kind::SHUTDOWN => {
                info!("Server requested shutdown");
                self.shutdown.cancel();
            }

            // Unknown kinds never cause a disconnect.
            other => debug!("Ignoring unknown frame kind '{other}'"),
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    fn spawn_command(&self, frame: &Frame, script: bool) {
        let engine = self.engine.clone();
        let handle = self.handle.clone();
        let shutdown = self.shutdown.clone();
        let request_id = frame.request_id.clone();
        let frame = frame.clone();

        tokio::spawn(async move {
            let result = if script {
                match frame.decode() {
                    Ok(payload) => engine.execute_script(payload, &shutdown).await,
                    Err(e) => {
                        warn!("Bad execute_script payload: {e}");
                        return;
                    }
                }
            } else {
                match frame.decode() {
                    Ok(payload) => engine.execute_command(payload, &shutdown).await,
                    Err(e) => {
                        warn!("Bad execute_command payload: {e}");
                        return;
                    }
                }
            };

            let mut result_frame = Frame::new(
                kind::COMMAND_RESULT,
                serde_json::to_value(&result).unwrap_or_else(|_| json!({})),
            );
            if let Some(request_id) = request_id {
                result_frame = result_frame.with_request_id(request_id);
            }
            if handle.send(result_frame).await.is_err() {
                debug!("Command result dropped, channel not connected");
            }
        });
    }

    fn spawn_update(&self, frame: &Frame) {
        let payload = match frame.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad update_available payload: {e}");
                return;
            }
        };
        let update = self.update.clone();
        let handle = self.handle.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = update.handle_update(payload, &handle, &shutdown).await {
                warn!("Update handling failed: {e}");
            }
        });
    }

    // ── Terminal sessions ───────────────────────────────────────────

    async fn open_terminal(&mut self, frame: &Frame) {
        let payload: StartTerminalPayload = match frame.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad start_terminal payload: {e}");
                return;
            }
        };
        if self.sessions.contains_key(&payload.session_id) {
            warn!("Duplicate session id {}, ignoring open", payload.session_id);
            return;
        }

        let queue = FrameQueue::new(TERMINAL_QUEUE_DEPTH, OverflowPolicy::Block);
        let params = terminal::TerminalParams {
            shell: payload.shell.clone(),
            cols: payload.cols,
            rows: payload.rows,
        };
        match terminal::spawn(&payload.session_id, params, queue.clone()) {
            Ok((input_tx, worker)) => {
                self.install_session(
                    payload.session_id.clone(),
                    SessionKind::Terminal,
                    input_tx,
                    queue,
                    worker,
                )
                .await;
            }
            Err(e) => {
                warn!("Terminal open failed: {e}");
                self.send_session_closed(&payload.session_id, close_reason::OPEN_FAILED)
                    .await;
            }
        }
    }

    async fn route_terminal_input(&mut self, frame: &Frame) {
        let payload: TerminalInputPayload = match frame.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad terminal_input payload: {e}");
                return;
            }
        };
        let b64 = base64::engine::general_purpose::STANDARD;
        let bytes = match b64.decode(&payload.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Undecodable terminal input for {}: {e}", payload.session_id);
                return;
            }
        };
        self.route_input(&payload.session_id, SessionInput::TerminalInput(bytes))
            .await;
    }

    async fn route_resize(&mut self, frame: &Frame) {
        let payload: TerminalResizePayload = match frame.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad terminal_resize payload: {e}");
                return;
            }
        };
        self.route_input(
            &payload.session_id,
            SessionInput::Resize {
                cols: payload.cols,
                rows: payload.rows,
            },
        )
        .await;
    }

    // ── File-browser sessions ───────────────────────────────────────

    /// File operations lazily open their session: the first op for an
    /// unknown id creates the file_browser session it addresses.
    /// `list_files` and `download_file` share the {session_id, path}
    /// shape and decode through the same payload struct.
    async fn route_file_op(&mut self, frame: &Frame) {
        let (session_id, input) = match frame.kind.as_str() {
            kind::LIST_FILES => {
                let payload: ListFilesPayload = match frame.decode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Bad list_files payload: {e}");
                        return;
                    }
                };
                (
                    payload.session_id,
                    SessionInput::ListFiles { path: payload.path },
                )
            }
            kind::DOWNLOAD_FILE => {
                let payload: ListFilesPayload = match frame.decode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Bad download_file payload: {e}");
                        return;
                    }
                };
                (
                    payload.session_id,
                    SessionInput::Download { path: payload.path },
                )
            }
            _ => {
                let payload: UploadFilePayload = match frame.decode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Bad upload_file payload: {e}");
                        return;
                    }
                };
                let b64 = base64::engine::general_purpose::STANDARD;
                let data = match b64.decode(&payload.data) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Undecodable upload for {}: {e}", payload.session_id);
                        return;
                    }
                };
                (
                    payload.session_id,
                    SessionInput::Upload {
                        path: payload.path,
                        data,
                    },
                )
            }
        };

        if !self.sessions.contains_key(&session_id) {
            let queue = FrameQueue::new(FILE_QUEUE_DEPTH, OverflowPolicy::Block);
            let (input_tx, worker) = file_browser::spawn(&session_id, queue.clone());
            self.install_session(
                session_id.clone(),
                SessionKind::FileBrowser,
                input_tx,
                queue,
                worker,
            )
            .await;
        }
        self.route_input(&session_id, input).await;
    }

    // ── Remote-desktop sessions ─────────────────────────────────────

    async fn open_remote(&mut self, frame: &Frame) {
        let payload: SessionRefPayload = match frame.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad start_remote payload: {e}");
                return;
            }
        };
        if self.sessions.contains_key(&payload.session_id) {
            warn!("Duplicate session id {}, ignoring open", payload.session_id);
            return;
        }

        // The helper handshake can take seconds; never stall the run loop.
        let helper = self.helper.clone();
        let notes_tx = self.notes_tx.clone();
        let session_id = payload.session_id.clone();
        tokio::spawn(async move {
            let note = match helper.open_remote_session(&session_id).await {
                Ok(channel) => Note::RemoteOpened {
                    session_id,
                    channel,
                },
                Err(e) => Note::RemoteOpenFailed {
                    session_id,
                    reason: e.to_string(),
                },
            };
            let _ = notes_tx.send(note);
        });
    }

    async fn route_remote_input(&mut self, frame: &Frame) {
        let payload: RemoteInputPayload = match frame.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad remote_input payload: {e}");
                return;
            }
        };
        let b64 = base64::engine::general_purpose::STANDARD;
        let bytes = match b64.decode(&payload.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Undecodable remote input for {}: {e}", payload.session_id);
                return;
            }
        };
        self.route_input(&payload.session_id, SessionInput::RemoteInput(bytes))
            .await;
    }

    // ── Shared session plumbing ─────────────────────────────────────

    async fn handle_note(&mut self, note: Note) {
        match note {
            Note::SessionEnded { session_id, nonce } => {
                let matches_instance = self
                    .sessions
                    .get(&session_id)
                    .is_some_and(|s| s.nonce == nonce);
                if matches_instance {
                    self.terminate_session(&session_id, close_reason::WORKER_EXIT)
                        .await;
                }
            }
            Note::RemoteOpened {
                session_id,
                channel,
            } => {
                if self.sessions.contains_key(&session_id) {
                    // Open raced a duplicate; drop the late channel.
                    self.helper.close_remote_session(&session_id).await;
                    return;
                }
                let queue = FrameQueue::new(REMOTE_QUEUE_DEPTH, OverflowPolicy::DropOldest);
                let (input_tx, worker) = remote::spawn(
                    &session_id,
                    channel,
                    self.helper.clone(),
                    queue.clone(),
                );
                self.install_session(
                    session_id,
                    SessionKind::RemoteDesktop,
                    input_tx,
                    queue,
                    worker,
                )
                .await;
            }
            Note::RemoteOpenFailed { session_id, reason } => {
                warn!("Remote session {session_id} failed to open: {reason}");
                self.send_session_closed(&session_id, close_reason::DESKTOP_UNAVAILABLE)
                    .await;
            }
        }
    }

    async fn install_session(
        &mut self,
        session_id: String,
        session_kind: SessionKind,
        input_tx: mpsc::Sender<SessionInput>,
        queue: FrameQueue,
        worker: JoinHandle<()>,
    ) {
        // Drain task: per-session order preserved, sessions interleaved.
        {
            let queue = queue.clone();
            let handle = self.handle.clone();
            tokio::spawn(async move {
                while let Some(frame) = queue.pop().await {
                    if handle.send(frame).await.is_err() {
                        break;
                    }
                }
            });
        }

        let nonce = self.next_nonce;
        self.next_nonce += 1;

        // Monitor: worker exit surfaces as a note so the table stays clean.
        {
            let notes_tx = self.notes_tx.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                let _ = worker.await;
                let _ = notes_tx.send(Note::SessionEnded { session_id, nonce });
            });
        }

        let ack = Frame::new(
            kind::SESSION_OPEN_ACK,
            json!({"session_id": session_id, "kind": session_kind.as_str()}),
        );
        let _ = self.handle.send(ack).await;

        info!("Session {session_id} opened ({})", session_kind.as_str());
        self.sessions.insert(
            session_id,
            SessionHandle {
                kind: session_kind,
                nonce,
                input_tx,
                queue,
            },
        );
    }

    async fn route_input(&mut self, session_id: &str, input: SessionInput) {
        match self.sessions.get(session_id) {
            Some(session) => {
                if session.input_tx.send(input).await.is_err() {
                    debug!("Session {session_id} worker gone, input dropped");
                }
            }
            None => warn!("Frame for unknown session {session_id}, dropped"),
        }
    }

    async fn close_by_ref(&mut self, frame: &Frame) {
        let payload: SessionRefPayload = match frame.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad close payload: {e}");
                return;
            }
        };
        if self.sessions.contains_key(&payload.session_id) {
            self.terminate_session(&payload.session_id, close_reason::CLOSED_BY_SERVER)
                .await;
        } else {
            warn!("Close for unknown session {}", payload.session_id);
        }
    }

    async fn terminate_session(&mut self, session_id: &str, reason: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };
        debug!(
            "Terminating session {session_id} ({}) reason={reason}",
            session.kind.as_str()
        );
        // Best effort: the worker may already be gone.
        let _ = session.input_tx.try_send(SessionInput::Close);
        session.queue.close();
        self.send_session_closed(session_id, reason).await;
    }

    async fn send_session_closed(&self, session_id: &str, reason: &str) {
        let frame = Frame::new(
            kind::SESSION_CLOSED,
            json!({"session_id": session_id, "reason": reason}),
        );
        if self.handle.send(frame).await.is_err() {
            debug!("session_closed for {session_id} dropped, not connected");
        }
    }

    async fn close_all(&mut self, reason: &str) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for session_id in ids {
            self.terminate_session(&session_id, reason).await;
        }
    }
}
