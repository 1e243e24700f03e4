//! The control-channel frame model.
//!
//! Every message between agent and server is one JSON object with a
//! `type`, a `payload`, and an optional `request_id`, sent as a single
//! WebSocket text frame. Payloads are carried as opaque JSON and decoded
//! into a kind-specific struct immediately after kind dispatch; a payload
//! that does not parse cleanly discards the frame, never the connection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame kind strings as they appear on the wire.
pub mod kind {
    // Agent -> server.
    pub const AUTH: &str = "auth";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const METRICS: &str = "metrics";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const SESSION_OPEN_ACK: &str = "session_open_ack";
    pub const SESSION_CLOSED: &str = "session_closed";
    pub const SESSION_OUTPUT: &str = "session_output";
    pub const AGENT_INFO: &str = "agent_info";
    pub const UPDATE_STATUS: &str = "update_status";

    // Server -> agent.
    pub const AUTH_RESPONSE: &str = "auth_response";
    pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
    pub const EXECUTE_COMMAND: &str = "execute_command";
    pub const EXECUTE_SCRIPT: &str = "execute_script";
    pub const START_TERMINAL: &str = "start_terminal";
    pub const TERMINAL_INPUT: &str = "terminal_input";
    pub const TERMINAL_RESIZE: &str = "terminal_resize";
    pub const CLOSE_TERMINAL: &str = "close_terminal";
    pub const LIST_FILES: &str = "list_files";
    pub const DOWNLOAD_FILE: &str = "download_file";
    pub const UPLOAD_FILE: &str = "upload_file";
    pub const START_REMOTE: &str = "start_remote";
    pub const REMOTE_INPUT: &str = "remote_input";
    pub const STOP_REMOTE: &str = "stop_remote";
    pub const UPDATE_AVAILABLE: &str = "update_available";
    pub const SHUTDOWN: &str = "shutdown";
}

/// `session_output` subtype strings.
pub mod output {
    pub const TERMINAL_OUTPUT: &str = "terminal_output";
    pub const FILE_LIST: &str = "file_list";
    pub const FILE_CHUNK: &str = "file_chunk";
    pub const REMOTE_FRAME: &str = "remote_frame";
}

/// One control-channel frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Payload did not match the shape expected for the frame kind.
#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} payload: {source}")]
pub struct PayloadError {
    pub kind: String,
    #[source]
    pub source: serde_json::Error,
}

impl Frame {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Decode the payload into the typed struct for this frame kind.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| PayloadError {
            kind: self.kind.clone(),
            source,
        })
    }
}

// ── Authentication ──────────────────────────────────────────────────

/// First frame on every connection. The enrollment token is sent verbatim;
/// the server compares it in constant time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub agent_id: String,
    pub enrollment_token: String,
    pub version: String,
    pub hostname: String,
    pub os_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    pub accepted: bool,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Commands ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandPayload {
    pub command_id: String,
    pub command: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteScriptPayload {
    pub command_id: String,
    pub language: String,
    pub body: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Emitted exactly once per command, after the child exits or is killed.
/// `exit_code` is `-1` when the process never started or was killed on
/// timeout; `error` carries the failure kind (`timeout`, `rate_limited`,
/// `validation_denied`, `spawn_failed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultPayload {
    pub command_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Sessions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTerminalPayload {
    pub session_id: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInputPayload {
    pub session_id: String,
    /// Base64-encoded bytes for the pty.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalResizePayload {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRefPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesPayload {
    pub session_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFilePayload {
    pub session_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFilePayload {
    pub session_id: String,
    pub path: String,
    /// Base64-encoded file content.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInputPayload {
    pub session_id: String,
    /// Base64-encoded input event bytes, forwarded to the helper opaquely.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClosedPayload {
    pub session_id: String,
    pub reason: String,
}

/// Session termination reasons reported in `session_closed`.
pub mod close_reason {
    pub const CLOSED_BY_SERVER: &str = "closed_by_server";
    pub const WORKER_EXIT: &str = "worker_exit";
    pub const CHANNEL_CLOSED: &str = "channel_closed";
    pub const SHUTDOWN: &str = "shutdown";
    pub const OPEN_FAILED: &str = "open_failed";
    pub const DESKTOP_UNAVAILABLE: &str = "desktop_unavailable";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

// ── Update ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAvailablePayload {
    pub version: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
}

// ── Metrics / inventory ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_available_bytes: u64,
    pub disk_percent: f64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub process_count: u32,
    pub uptime_secs: u64,
}

/// Static inventory sent once per connection, plus on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInventoryPayload {
    pub agent_id: String,
    pub version: String,
    pub hostname: String,
    pub os_type: String,
    pub arch: String,
}
