//! Install, uninstall, and status for the agent's OS service
//! registration, plus validation of server-issued uninstall tokens.

use std::io;
use std::path::Path;

use base64::Engine;
use chrono::{DateTime, Utc};
use sentinel_core::config::ConfigStore;
use sentinel_core::handshake::HandshakeDir;
use sentinel_core::hashing::sha256_hex;
use sentinel_core::paths;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Service name under the OS service manager.
pub const SERVICE_NAME: &str = "sentinel-agent";

#[cfg(target_os = "linux")]
const SYSTEMD_UNIT_PATH: &str = "/etc/systemd/system/sentinel-agent.service";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("service operation failed: {0}")]
    Failed(String),
}

impl From<io::Error> for ServiceError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
            Self::Permission(e.to_string())
        } else {
            Self::Failed(e.to_string())
        }
    }
}

// ── Install / uninstall ─────────────────────────────────────────────

/// `--install`: write the initial config, register the OS service, and
/// start it.
pub async fn install(
    data_dir: &Path,
    server_url: &str,
    enrollment_token: &str,
) -> Result<(), ServiceError> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(paths::handshake_dir(data_dir))?;

    let store = ConfigStore::open_or_init(
        paths::config_path(data_dir),
        server_url,
        enrollment_token,
    )
    .map_err(|e| ServiceError::Config(e.to_string()))?;
    let config = store.snapshot().await;
    info!("Installed config for agent {}", config.agent_id);

    register_service(data_dir)?;
    start_service()?;
    Ok(())
}

/// `--uninstall`: validate the server-issued token against the stored
/// identity, then stop and remove the service.
pub async fn uninstall(data_dir: &Path, token: &str) -> Result<(), ServiceError> {
    let store = ConfigStore::open(paths::config_path(data_dir))
        .map_err(|e| ServiceError::Config(format!("agent is not installed: {e}")))?;
    let config = store.snapshot().await;

    let device_id = config
        .device_id
        .as_deref()
        .ok_or_else(|| ServiceError::Config("agent was never enrolled".into()))?;

    let parsed = UninstallToken::decode(token)
        .map_err(|e| ServiceError::Permission(format!("invalid uninstall token: {e}")))?;
    parsed
        .validate(device_id, &config.enrollment_token, Utc::now())
        .map_err(ServiceError::Permission)?;

    stop_service()?;
    remove_service()?;
    info!("Service removed; config left in place at {}", data_dir.display());
    Ok(())
}

/// `--status`: a human summary from the config and agent-info files.
pub async fn status_summary(data_dir: &Path) -> String {
    let mut lines = Vec::new();

    match ConfigStore::open(paths::config_path(data_dir)) {
        Ok(store) => {
            let config = store.snapshot().await;
            lines.push(format!("agent_id:  {}", config.agent_id));
            lines.push(format!("server:    {}", config.server_url));
            lines.push(format!(
                "enrolled:  {} ({})",
                config.enrolled,
                config.device_id.as_deref().unwrap_or("no device id")
            ));
        }
        Err(_) => lines.push("not installed (no config file)".to_string()),
    }

    let handshake = HandshakeDir::new(paths::handshake_dir(data_dir));
    match handshake.load_agent_info() {
        Some(info) => {
            let age = handshake.agent_info_age_secs().unwrap_or(u64::MAX);
            lines.push(format!(
                "service:   running (version {}, pid {}, liveness {age}s ago)",
                info.version, info.pid
            ));
        }
        None => lines.push("service:   not running (no agent-info)".to_string()),
    }
    if let Some(status) = handshake.load_status() {
        lines.push(format!("update:    {:?} ({})", status.state, status.version));
    }
    lines.join("\n")
}

// ── Uninstall token ─────────────────────────────────────────────────

/// A server-issued uninstall authorization: base64 over a JSON record.
/// The signature binds the device id and expiry to the enrollment
/// secret; nothing beyond that hash is assumed about the server's
/// issuing scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UninstallToken {
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl UninstallToken {
    pub fn decode(token: &str) -> Result<Self, String> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let raw = b64.decode(token.trim()).map_err(|e| e.to_string())?;
        serde_json::from_slice(&raw).map_err(|e| e.to_string())
    }

    pub fn encode(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD;
        b64.encode(serde_json::to_vec(self).expect("token serializes"))
    }

    /// The signature input the server and agent agree on.
    pub fn expected_signature(
        device_id: &str,
        expires_at: DateTime<Utc>,
        enrollment_token: &str,
    ) -> String {
        sha256_hex(
            format!(
                "{device_id}|{}|{enrollment_token}",
                expires_at.to_rfc3339()
            )
            .as_bytes(),
        )
    }

    pub fn validate(
        &self,
        device_id: &str,
        enrollment_token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if self.device_id != device_id {
            return Err("token was issued for a different device".to_string());
        }
        if now > self.expires_at {
            return Err("token has expired".to_string());
        }
        let expected = Self::expected_signature(device_id, self.expires_at, enrollment_token);
        if self.signature != expected {
            return Err("token signature mismatch".to_string());
        }
        Ok(())
    }
}

// ── Platform service plumbing ───────────────────────────────────────

#[cfg(target_os = "linux")]
fn register_service(data_dir: &Path) -> Result<(), ServiceError> {
    let exe = std::env::current_exe()?;
    let unit = format!(
        "[Unit]\n\
         Description=Sentinel endpoint agent\n\
         After=network-online.target\n\n\
         [Service]\n\
         ExecStart={}\n\
         Environment={}={}\n\
         Restart=no\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe.display(),
        paths::DATA_DIR_ENV,
        data_dir.display(),
    );
    std::fs::write(SYSTEMD_UNIT_PATH, unit)?;
    run_checked("systemctl", &["daemon-reload"])?;
    run_checked("systemctl", &["enable", SERVICE_NAME])?;
    Ok(())
}

#[cfg(windows)]
fn register_service(data_dir: &Path) -> Result<(), ServiceError> {
    let exe = std::env::current_exe()?;
    let bin_path = format!("{} ", exe.display());
    run_checked(
        "sc",
        &[
            "create",
            SERVICE_NAME,
            &format!("binPath={bin_path}"),
            "start=auto",
        ],
    )?;
    let _ = data_dir;
    Ok(())
}

#[cfg(not(any(target_os = "linux", windows)))]
fn register_service(_data_dir: &Path) -> Result<(), ServiceError> {
    Err(ServiceError::Failed(
        "service registration is not supported on this platform".into(),
    ))
}

#[cfg(target_os = "linux")]
fn start_service() -> Result<(), ServiceError> {
    run_checked("systemctl", &["start", SERVICE_NAME])
}

#[cfg(target_os = "linux")]
fn stop_service() -> Result<(), ServiceError> {
    run_checked("systemctl", &["stop", SERVICE_NAME])
}

#[cfg(target_os = "linux")]
fn remove_service() -> Result<(), ServiceError> {
    run_checked("systemctl", &["disable", SERVICE_NAME])?;
    std::fs::remove_file(SYSTEMD_UNIT_PATH)?;
    run_checked("systemctl", &["daemon-reload"])
}

#[cfg(windows)]
fn start_service() -> Result<(), ServiceError> {
    run_checked("sc", &["start", SERVICE_NAME])
}

#[cfg(windows)]
fn stop_service() -> Result<(), ServiceError> {
    run_checked("sc", &["stop", SERVICE_NAME])
}

#[cfg(windows)]
fn remove_service() -> Result<(), ServiceError> {
    run_checked("sc", &["delete", SERVICE_NAME])
}

#[cfg(not(any(target_os = "linux", windows)))]
fn start_service() -> Result<(), ServiceError> {
    Err(ServiceError::Failed("unsupported platform".into()))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn stop_service() -> Result<(), ServiceError> {
    Err(ServiceError::Failed("unsupported platform".into()))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn remove_service() -> Result<(), ServiceError> {
    Err(ServiceError::Failed("unsupported platform".into()))
}

#[allow(dead_code)]
fn run_checked(program: &str, args: &[&str]) -> Result<(), ServiceError> {
    let output = std::process::Command::new(program).args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ServiceError::Failed(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}
