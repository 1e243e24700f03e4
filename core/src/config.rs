//! Persistent agent identity and configuration.
//!
//! One JSON file holds the stable `agent_id`, the server coordinates, and
//! the tunable intervals. Writes go through write-then-rename with the
//! file restricted to the owning account (0600 on posix); read-modify-write
//! is serialized by an in-process lock. The agent never deletes this file.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::handshake::write_json_atomic_with_mode;

const CONFIG_FILE_MODE: u32 = 0o600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The persisted configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: Uuid,
    pub server_url: String,
    pub enrollment_token: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub enrolled: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_metrics_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_update_poll_secs")]
    pub update_poll_interval_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_metrics_secs() -> u64 {
    60
}

fn default_update_poll_secs() -> u64 {
    3600
}

impl AgentConfig {
    /// A fresh config with a newly generated identity.
    pub fn new(server_url: String, enrollment_token: String) -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            server_url,
            enrollment_token,
            device_id: None,
            enrolled: false,
            heartbeat_interval_secs: default_heartbeat_secs(),
            metrics_interval_secs: default_metrics_secs(),
            update_poll_interval_secs: default_update_poll_secs(),
        }
    }
}

/// Shared handle to the config file.
///
/// Holds the current value in memory; `update` mutates under the lock and
/// persists atomically before returning.
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<AgentConfig>,
}

impl ConfigStore {
    /// Open an existing config file.
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&path)?;
        let config: AgentConfig = serde_json::from_str(&contents)?;
        Ok(Self {
            path,
            current: Mutex::new(config),
        })
    }

    /// Open the config file, creating it with a fresh identity if absent.
    pub fn open_or_init(
        path: PathBuf,
        server_url: &str,
        enrollment_token: &str,
    ) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let config: AgentConfig = serde_json::from_str(&contents)?;
                Ok(Self {
                    path,
                    current: Mutex::new(config),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = AgentConfig::new(server_url.to_string(), enrollment_token.to_string());
                write_json_atomic_with_mode(&path, &config, CONFIG_FILE_MODE)?;
                info!("Generated new agent identity {}", config.agent_id);
                Ok(Self {
                    path,
                    current: Mutex::new(config),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A point-in-time copy of the config.
    pub async fn snapshot(&self) -> AgentConfig {
        self.current.lock().await.clone()
    }

    /// Mutate the config under the store lock and persist atomically.
    pub async fn update<F>(&self, mutate: F) -> Result<AgentConfig, ConfigError>
    where
        F: FnOnce(&mut AgentConfig),
    {
        let mut current = self.current.lock().await;
        mutate(&mut current);
        write_json_atomic_with_mode(&self.path, &*current, CONFIG_FILE_MODE)?;
        Ok(current.clone())
    }

    /// Record the server-assigned device id after a successful enrollment.
    pub async fn record_enrollment(&self, device_id: &str) -> Result<(), ConfigError> {
        let current = self.current.lock().await;
        if current.enrolled && current.device_id.as_deref() == Some(device_id) {
            return Ok(());
        }
        drop(current);
        self.update(|c| {
            if c.device_id.as_deref().is_some_and(|d| d != device_id) {
                warn!(
                    "Server reassigned device id {} -> {}",
                    c.device_id.as_deref().unwrap_or("?"),
                    device_id
                );
            }
            c.device_id = Some(device_id.to_string());
            c.enrolled = true;
        })
        .await?;
        Ok(())
    }
}
