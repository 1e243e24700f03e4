//! The seam to the OS service manager.
//!
//! The supervisor only ever talks to the agent service through this
//! trait, so the update and liveness loops are testable against an
//! in-memory fake while production uses systemctl / sc.exe.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    NotInstalled,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service manager call failed: {0}")]
    Manager(String),
    #[error("service I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn state(&self) -> Result<ServiceState, ServiceError>;
    async fn start(&self) -> Result<(), ServiceError>;
    async fn stop(&self) -> Result<(), ServiceError>;
    /// Re-register the service from the known-good installed binary.
    async fn reinstall(&self) -> Result<(), ServiceError>;
}

/// The agent service name this supervisor watches.
pub const AGENT_SERVICE: &str = "sentinel-agent";

// ── systemd implementation ──────────────────────────────────────────

#[cfg(unix)]
pub struct SystemdControl {
    unit: String,
}

#[cfg(unix)]
impl SystemdControl {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<std::process::Output, ServiceError> {
        let output = std::process::Command::new("systemctl")
            .args(args)
            .arg(&self.unit)
            .output()?;
        Ok(output)
    }
}

#[cfg(unix)]
#[async_trait]
impl ServiceControl for SystemdControl {
    async fn state(&self) -> Result<ServiceState, ServiceError> {
        // `cat` fails for units that do not exist at all.
        let exists = self.systemctl(&["cat"])?.status.success();
        if !exists {
            return Ok(ServiceState::NotInstalled);
        }
        let output = self.systemctl(&["is-active"])?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(match text.trim() {
            "active" | "activating" => ServiceState::Running,
            "inactive" | "failed" | "deactivating" => ServiceState::Stopped,
            _ => ServiceState::Other,
        })
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let output = self.systemctl(&["start"])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Manager(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let output = self.systemctl(&["stop"])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Manager(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn reinstall(&self) -> Result<(), ServiceError> {
        // The unit file ships with the installer; re-enable and start.
        let enable = self.systemctl(&["enable"])?;
        if !enable.status.success() {
            return Err(ServiceError::Manager(
                String::from_utf8_lossy(&enable.stderr).trim().to_string(),
            ));
        }
        self.start().await
    }
}

// ── sc.exe implementation ───────────────────────────────────────────

#[cfg(windows)]
pub struct ScControl {
    name: String,
}

#[cfg(windows)]
impl ScControl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn sc(&self, verb: &str) -> Result<std::process::Output, ServiceError> {
        let output = std::process::Command::new("sc")
            .args([verb, &self.name])
            .output()?;
        Ok(output)
    }
}

#[cfg(windows)]
#[async_trait]
impl ServiceControl for ScControl {
    async fn state(&self) -> Result<ServiceState, ServiceError> {
        let output = self.sc("query")?;
        if !output.status.success() {
            return Ok(ServiceState::NotInstalled);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(if text.contains("RUNNING") {
            ServiceState::Running
        } else if text.contains("STOPPED") {
            ServiceState::Stopped
        } else {
            ServiceState::Other
        })
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let output = self.sc("start")?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Manager(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        }
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let output = self.sc("stop")?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Manager(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        }
    }

    async fn reinstall(&self) -> Result<(), ServiceError> {
        let exe = std::env::current_exe()?
            .with_file_name("sentinel-agent.exe");
        let output = std::process::Command::new("sc")
            .args([
                "create",
                &self.name,
                &format!("binPath={}", exe.display()),
                "start=auto",
            ])
            .output()?;
        if !output.status.success() {
            return Err(ServiceError::Manager(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ));
        }
        self.start().await
    }
}

// ── Test fake ───────────────────────────────────────────────────────
