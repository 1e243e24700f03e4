//! The agent ↔ supervisor handshake files.
//!
//! Three JSON files in a shared privileged directory carry the update
//! contract across process restarts: the agent writes `update-request.json`
//! and `agent-info.json`, the supervisor writes `update-status.json`.
//! Each file is exclusively owned by its writer; readers must tolerate a
//! file that is missing, truncated, or mid-rename, and return `None`
//! rather than fail.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const REQUEST_FILE: &str = "update-request.json";
pub const STATUS_FILE: &str = "update-status.json";
pub const AGENT_INFO_FILE: &str = "agent-info.json";

/// Agent → supervisor: a staged binary is ready to be applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequest {
    pub version: String,
    pub staged_path: PathBuf,
    pub sha256: String,
    pub target_path: PathBuf,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Pending,
    Applying,
    Complete,
    Failed,
    RolledBack,
}

/// Supervisor → agent (and onward to the server): outcome of an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub state: UpdateState,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollback_failed: bool,
}

impl UpdateStatus {
    pub fn new(state: UpdateState, version: &str) -> Self {
        Self {
            state,
            version: version.to_string(),
            error: None,
            backup_path: None,
            started_at: None,
            completed_at: None,
            rollback_failed: false,
        }
    }
}

/// Written by the agent on startup and refreshed while it runs; the
/// supervisor uses presence + mtime as the liveness signal and the
/// `version` field to verify an applied update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub version: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub agent_id: Uuid,
}

// ── File access ─────────────────────────────────────────────────────

/// Read and parse a handshake file, tolerating absence and corruption.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unparsable {}: {}", path.display(), e);
            None
        }
    }
}

/// Write JSON atomically: serialize to a sibling temp file, then rename
/// over the destination.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    write_atomic_impl(path, value, None)
}

/// Atomic write with a unix file mode applied before the rename
/// (ignored on non-unix platforms).
pub fn write_json_atomic_with_mode<T: Serialize>(
    path: &Path,
    value: &T,
    mode: u32,
) -> io::Result<()> {
    write_atomic_impl(path, value, Some(mode))
}

fn write_atomic_impl<T: Serialize>(path: &Path, value: &T, mode: Option<u32>) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    std::fs::rename(&tmp, path)
}

/// Paths into one handshake directory.
#[derive(Debug, Clone)]
pub struct HandshakeDir {
    dir: PathBuf,
}

impl HandshakeDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn request_path(&self) -> PathBuf {
        self.dir.join(REQUEST_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn agent_info_path(&self) -> PathBuf {
        self.dir.join(AGENT_INFO_FILE)
    }

    pub fn load_request(&self) -> Option<UpdateRequest> {
        load_json(&self.request_path())
    }

    pub fn load_status(&self) -> Option<UpdateStatus> {
        load_json(&self.status_path())
    }

    pub fn load_agent_info(&self) -> Option<AgentInfo> {
        load_json(&self.agent_info_path())
    }

    pub fn write_request(&self, request: &UpdateRequest) -> io::Result<()> {
        write_json_atomic(&self.request_path(), request)
    }

    pub fn write_status(&self, status: &UpdateStatus) -> io::Result<()> {
        write_json_atomic(&self.status_path(), status)
    }

    pub fn write_agent_info(&self, info: &AgentInfo) -> io::Result<()> {
        write_json_atomic(&self.agent_info_path(), info)
    }

    /// Seconds since the agent-info file was last written, if it exists.
    pub fn agent_info_age_secs(&self) -> Option<u64> {
        let meta = std::fs::metadata(self.agent_info_path()).ok()?;
        let mtime = meta.modified().ok()?;
        mtime.elapsed().ok().map(|d| d.as_secs())
    }

    pub fn remove_request(&self) -> io::Result<()> {
        match std::fs::remove_file(self.request_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
