//! The nine-step update application with verify-and-rollback.
//!
//! Everything up to the atomic swap is abortable without touching the
//! installed binary; from the swap onward the only recovery is restoring
//! the backup copy. A failed restoration is the one escalating condition:
//! it is logged at error level and recorded in the status file with
//! `rollback_failed = true`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sentinel_core::handshake::{HandshakeDir, UpdateRequest, UpdateState, UpdateStatus};
use sentinel_core::hashing::sha256_file;
use tracing::{error, info, warn};

use crate::protect;
use crate::service::{ServiceControl, ServiceState};

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub verify_timeout: Duration,
    pub verify_poll: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            verify_timeout: Duration::from_secs(30),
            verify_poll: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Complete,
    Failed,
    RolledBack,
}

pub struct Updater<S> {
    svc: Arc<S>,
    handshake: HandshakeDir,
    staging_dir: PathBuf,
    config: UpdaterConfig,
    busy: AtomicBool,
}

impl<S: ServiceControl> Updater<S> {
    pub fn new(
        svc: Arc<S>,
        handshake: HandshakeDir,
        staging_dir: PathBuf,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            svc,
            handshake,
            staging_dir,
            config,
            busy: AtomicBool::new(false),
        }
    }

    /// Check for a pending request and apply it. Only one update runs at
    /// a time; a request arriving mid-flight is ignored, not queued.
    pub async fn poll_once(&self) -> Option<UpdateOutcome> {
        let request = self.handshake.load_request()?;
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        info!(
            "Applying update to {} ({} -> {})",
            request.version,
            request.staged_path.display(),
            request.target_path.display()
        );
        let outcome = self.apply(&request).await;
        self.busy.store(false, Ordering::SeqCst);
        Some(outcome)
    }

    async fn apply(&self, request: &UpdateRequest) -> UpdateOutcome {
        let mut status = UpdateStatus::new(UpdateState::Applying, &request.version);
        status.started_at = Some(Utc::now());
        let _ = self.handshake.write_status(&status);

        // Step 1: re-verify the staged file before anything is touched.
        if let Err(reason) = verify_staged(&request.staged_path, &request.sha256) {
            warn!("Staged file failed re-verification: {reason}");
            return self.fail_before_swap(request, reason).await;
        }

        // Step 2: unprotect just the target path.
        if let Err(e) = protect::unprotect(&request.target_path) {
            return self
                .fail_before_swap(request, format!("unprotect failed: {e}"))
                .await;
        }

        // Step 3: stop the agent service.
        if let Err(e) = self.svc.stop().await {
            return self
                .fail_before_swap(request, format!("service stop failed: {e}"))
                .await;
        }
        if !self
            .wait_for_state(ServiceState::Stopped, self.config.stop_timeout)
            .await
        {
            return self
                .fail_before_swap(request, "service did not stop in time".to_string())
                .await;
        }

        // Step 4: backup by full copy; the live file must keep existing
        // until the rename lands.
        let backup_path = backup_path_for(&request.target_path);
        if let Err(e) = std::fs::copy(&request.target_path, &backup_path) {
            return self
                .fail_before_swap(request, format!("backup copy failed: {e}"))
                .await;
        }

        // Step 5: the atomic swap. From here on, rollback is the only way
        // back.
        if let Err(e) = atomic_replace(&request.staged_path, &request.target_path) {
            error!("Swap failed after backup: {e}");
            return self.rollback(request, &backup_path, format!("swap failed: {e}")).await;
        }

        // Step 6: reprotect the new binary.
        if let Err(e) = protect::protect(&request.target_path) {
            return self
                .rollback(request, &backup_path, format!("reprotect failed: {e}"))
                .await;
        }

        // Step 7: start the service again.
        if self.svc.start().await.is_err()
            || !self
                .wait_for_state(ServiceState::Running, self.config.start_timeout)
                .await
        {
            return self
                .rollback(request, &backup_path, "service did not start".to_string())
                .await;
        }

        // Step 8: the new agent must announce the requested version.
        if !self.verify_new_version(&request.version).await {
            return self
                .rollback(
                    request,
                    &backup_path,
                    format!("agent did not report version {}", request.version),
                )
                .await;
        }

        // Step 9: commit.
        let mut status = UpdateStatus::new(UpdateState::Complete, &request.version);
        status.started_at = Some(Utc::now());
        status.completed_at = Some(Utc::now());
        let _ = self.handshake.write_status(&status);
        let _ = self.handshake.remove_request();
        let _ = std::fs::remove_file(&backup_path);
        clean_dir(&self.staging_dir);
        info!("Update to {} complete", request.version);
        UpdateOutcome::Complete
    }

    /// Failure before the swap: the installed binary is untouched, so the
    /// request is consumed, protection restored, and the service brought
    /// back up.
    async fn fail_before_swap(&self, request: &UpdateRequest, reason: String) -> UpdateOutcome {
        let mut status = UpdateStatus::new(UpdateState::Failed, &request.version);
        status.error = Some(reason);
        status.completed_at = Some(Utc::now());
        let _ = self.handshake.write_status(&status);
        let _ = self.handshake.remove_request();
        let _ = std::fs::remove_file(&request.staged_path);
        let _ = std::fs::remove_file(backup_path_for(&request.target_path));
        let _ = protect::protect(&request.target_path);
        if matches!(self.svc.state().await, Ok(ServiceState::Stopped)) {
            let _ = self.svc.start().await;
        }
        UpdateOutcome::Failed
    }

    /// Restore the backup over the target and bring the old binary back.
    async fn rollback(
        &self,
        request: &UpdateRequest,
        backup_path: &Path,
        reason: String,
    ) -> UpdateOutcome {
        warn!("Rolling back update to {}: {reason}", request.version);

        let restore = async {
            self.svc.stop().await.map_err(|e| e.to_string())?;
            if !self
                .wait_for_state(ServiceState::Stopped, self.config.stop_timeout)
                .await
            {
                return Err("service did not stop for rollback".to_string());
            }
            protect::unprotect(&request.target_path).map_err(|e| e.to_string())?;
            atomic_replace(backup_path, &request.target_path).map_err(|e| e.to_string())?;
            protect::protect(&request.target_path).map_err(|e| e.to_string())?;
            self.svc.start().await.map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        }
        .await;

        let _ = self.handshake.remove_request();
        let _ = std::fs::remove_file(&request.staged_path);

        match restore {
            Ok(()) => {
                let mut status = UpdateStatus::new(UpdateState::RolledBack, &request.version);
                status.error = Some(reason);
                status.backup_path = Some(backup_path.to_path_buf());
                status.completed_at = Some(Utc::now());
                let _ = self.handshake.write_status(&status);
                UpdateOutcome::RolledBack
            }
            Err(restore_error) => {
                // The one critical failure mode: the host may be left
                // without a working agent binary.
                error!(
                    "ROLLBACK FAILED for {}: {restore_error} (original failure: {reason})",
                    request.target_path.display()
                );
                log_to_event_log(&format!(
                    "Sentinel update rollback failed for {}: {restore_error}",
                    request.target_path.display()
                ));
                let mut status = UpdateStatus::new(UpdateState::Failed, &request.version);
                status.error = Some(format!("{reason}; rollback: {restore_error}"));
                status.rollback_failed = true;
                status.backup_path = Some(backup_path.to_path_buf());
                status.completed_at = Some(Utc::now());
                let _ = self.handshake.write_status(&status);
                UpdateOutcome::Failed
            }
        }
    }

    async fn wait_for_state(&self, want: ServiceState, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = (timeout / 10).max(Duration::from_millis(50));
        loop {
            if self.svc.state().await.ok() == Some(want) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Poll the agent-info file until it reports the new version.
    async fn verify_new_version(&self, version: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.verify_timeout;
        loop {
            if let Some(info) = self.handshake.load_agent_info() {
                if info.version == version {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.verify_poll).await;
        }
    }
}

fn backup_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sentinel-agent".to_string());
    name.push_str(".backup");
    target.with_file_name(name)
}

fn verify_staged(staged: &Path, expected_sha256: &str) -> Result<(), String> {
    let metadata = std::fs::metadata(staged).map_err(|e| format!("staged file missing: {e}"))?;
    if metadata.len() == 0 {
        return Err("staged file is empty".to_string());
    }
    let actual = sha256_file(staged).map_err(|e| format!("hash failed: {e}"))?;
    if !actual.eq_ignore_ascii_case(expected_sha256) {
        return Err(format!(
            "sha256 mismatch: expected {expected_sha256}, got {actual}"
        ));
    }
    Ok(())
}

/// Rename with write-through: the parent directory is synced so the swap
/// survives power loss.
fn atomic_replace(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::rename(from, to)?;
    #[cfg(unix)]
    if let Some(parent) = to.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn clean_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let _ = std::fs::remove_file(entry.path());
    }
}

/// Rollback failure must reach the OS event log; everywhere else plain
/// tracing suffices.
fn log_to_event_log(message: &str) {
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("eventcreate")
            .args(["/T", "ERROR", "/ID", "100", "/L", "APPLICATION", "/SO", "Sentinel", "/D", message])
            .output();
    }
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("logger")
            .args(["-p", "daemon.err", "-t", "sentinel-supervisor", message])
            .output();
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    let _ = message;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::FakeServiceControl;
    use sentinel_core::handshake::AgentInfo;
    use sentinel_core::hashing::sha256_hex;
    use uuid::Uuid;

    struct Fixture {
        _tmp: tempfile::TempDir,
        handshake: HandshakeDir,
        staging: PathBuf,
        target: PathBuf,
        svc: Arc<FakeServiceControl>,
    }

    const OLD_BINARY: &[u8] = b"old agent binary v1";
    const NEW_BINARY: &[u8] = b"new agent binary v2";

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let handshake = HandshakeDir::new(tmp.path().join("update"));
        let staging = tmp.path().join("update").join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let target = tmp.path().join("bin").join("sentinel-agent");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, OLD_BINARY).unwrap();
        let svc = Arc::new(FakeServiceControl::new(ServiceState::Running));
        Fixture {
            _tmp: tmp,
            handshake,
            staging,
            target,
            svc,
        }
    }

    fn fast_config() -> UpdaterConfig {
        UpdaterConfig {
            stop_timeout: Duration::from_millis(500),
            start_timeout: Duration::from_millis(500),
            verify_timeout: Duration::from_millis(500),
            verify_poll: Duration::from_millis(50),
        }
    }

    fn stage_request(fixture: &Fixture, binary: &[u8], sha: &str) -> UpdateRequest {
        let staged = fixture.staging.join("sentinel-agent-2.0.0-test");
        std::fs::write(&staged, binary).unwrap();
        let request = UpdateRequest {
            version: "2.0.0".into(),
            staged_path: staged,
            sha256: sha.to_string(),
            target_path: fixture.target.clone(),
            requested_at: Utc::now(),
            requested_by: "agent".into(),
        };
        fixture.handshake.write_request(&request).unwrap();
        request
    }

    fn write_agent_info(handshake: &HandshakeDir, version: &str) {
        handshake
            .write_agent_info(&AgentInfo {
                version: version.to_string(),
                pid: 1234,
                started_at: Utc::now(),
                agent_id: Uuid::new_v4(),
            })
            .unwrap();
    }

    fn updater(fixture: &Fixture) -> Updater<FakeServiceControl> {
        Updater::new(
            fixture.svc.clone(),
            fixture.handshake.clone(),
            fixture.staging.clone(),
            fast_config(),
        )
    }

    #[tokio::test]
    async fn successful_update_commits() {
        let fixture = fixture();
        stage_request(&fixture, NEW_BINARY, &sha256_hex(NEW_BINARY));

        // When the fake service starts the "new agent", it reports 2.0.0.
        let handshake = fixture.handshake.clone();
        fixture
            .svc
            .on_start(move || write_agent_info(&handshake, "2.0.0"));

        let outcome = updater(&fixture).poll_once().await;
        assert_eq!(outcome, Some(UpdateOutcome::Complete));

        // Target now holds the staged bytes; backup and request are gone.
        assert_eq!(std::fs::read(&fixture.target).unwrap(), NEW_BINARY);
        assert!(!backup_path_for(&fixture.target).exists());
        assert!(fixture.handshake.load_request().is_none());
        assert_eq!(std::fs::read_dir(&fixture.staging).unwrap().count(), 0);

        let status = fixture.handshake.load_status().unwrap();
        assert_eq!(status.state, UpdateState::Complete);
        assert!(!status.rollback_failed);
    }

    #[tokio::test]
    async fn sha_mismatch_leaves_target_untouched() {
        let fixture = fixture();
        stage_request(&fixture, NEW_BINARY, &"ab".repeat(32));

        let outcome = updater(&fixture).poll_once().await;
        assert_eq!(outcome, Some(UpdateOutcome::Failed));

        // Invariant: the installed binary is byte-identical.
        assert_eq!(std::fs::read(&fixture.target).unwrap(), OLD_BINARY);
        assert!(fixture.handshake.load_request().is_none());
        let status = fixture.handshake.load_status().unwrap();
        assert_eq!(status.state, UpdateState::Failed);
        // The service was never stopped for a pre-swap verification failure.
        assert_eq!(fixture.svc.stops.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn verification_timeout_rolls_back() {
        let fixture = fixture();
        stage_request(&fixture, NEW_BINARY, &sha256_hex(NEW_BINARY));

        // The "new" agent comes up but keeps reporting the old version,
        // as a binary that crashes into the old build would.
        let handshake = fixture.handshake.clone();
        fixture
            .svc
            .on_start(move || write_agent_info(&handshake, "1.0.0"));

        let outcome = updater(&fixture).poll_once().await;
        assert_eq!(outcome, Some(UpdateOutcome::RolledBack));

        // Rollback equivalence: pre-update bytes restored.
        assert_eq!(std::fs::read(&fixture.target).unwrap(), OLD_BINARY);
        assert!(fixture.handshake.load_request().is_none());

        let status = fixture.handshake.load_status().unwrap();
        assert_eq!(status.state, UpdateState::RolledBack);
        assert!(!status.rollback_failed);

        // Stopped for swap, stopped for rollback; started after each.
        assert!(fixture.svc.stops.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert!(fixture.svc.starts.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn empty_staged_file_fails() {
        let fixture = fixture();
        stage_request(&fixture, b"", &sha256_hex(b""));

        let outcome = updater(&fixture).poll_once().await;
        assert_eq!(outcome, Some(UpdateOutcome::Failed));
        assert_eq!(std::fs::read(&fixture.target).unwrap(), OLD_BINARY);
    }

    #[tokio::test]
    async fn no_request_is_a_quiet_noop() {
        let fixture = fixture();
        assert_eq!(updater(&fixture).poll_once().await, None);
        assert!(fixture.handshake.load_status().is_none());
    }

    #[tokio::test]
    async fn missing_staged_file_fails_cleanly() {
        let fixture = fixture();
        let request = UpdateRequest {
            version: "2.0.0".into(),
            staged_path: fixture.staging.join("never-downloaded"),
            sha256: "aa".repeat(32),
            target_path: fixture.target.clone(),
            requested_at: Utc::now(),
            requested_by: "agent".into(),
        };
        fixture.handshake.write_request(&request).unwrap();

        let outcome = updater(&fixture).poll_once().await;
        assert_eq!(outcome, Some(UpdateOutcome::Failed));
        assert_eq!(std::fs::read(&fixture.target).unwrap(), OLD_BINARY);
    }

    #[test]
    fn backup_path_is_sibling_with_suffix() {
        let path = backup_path_for(Path::new("/opt/sentinel/sentinel-agent"));
        assert_eq!(path, Path::new("/opt/sentinel/sentinel-agent.backup"));
    }
}
