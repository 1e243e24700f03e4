//! Agent-side update coordination.
//!
//! The agent never swaps its own binary. It stages the download, verifies
//! the digest, persists `update-request.json`, nudges the supervisor over
//! local IPC, and exits; the supervisor owns every mutation of the
//! installed binary. The request file is the only durable contract; the
//! nudge is best effort and the supervisor's poll covers a missed signal.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use sentinel_core::backoff::Backoff;
use sentinel_core::frames::{kind, Frame, UpdateAvailablePayload};
use sentinel_core::handshake::{HandshakeDir, UpdateRequest, UpdateState, UpdateStatus};
use sentinel_core::hashing::sha256_file;
use sentinel_core::ipc::{IpcStream, SupervisorMessage};
use sentinel_core::paths;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelHandle;

const DOWNLOAD_ATTEMPTS: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("an update is already in flight")]
    Busy,
    #[error("download failed: {0}")]
    Download(String),
    #[error("staged binary failed verification: {0}")]
    Verify(String),
    #[error("update I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("update canceled by shutdown")]
    Canceled,
}

pub struct UpdateCoordinator {
    data_dir: PathBuf,
    handshake: HandshakeDir,
    http: reqwest::Client,
    current_version: String,
    in_flight: AtomicBool,
}

impl UpdateCoordinator {
    pub fn new(data_dir: PathBuf, current_version: String) -> Self {
        let handshake = HandshakeDir::new(paths::handshake_dir(&data_dir));
        Self {
            data_dir,
            handshake,
            http: reqwest::Client::new(),
            current_version,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Remove leftover staged binaries from superseded update attempts.
    /// Called once on startup, before any new download begins.
    pub fn clean_stale_staging(&self) {
        let staging = paths::staging_dir(&self.data_dir);
        let Ok(entries) = std::fs::read_dir(&staging) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Removed stale staged file {}", path.display()),
                Err(e) => warn!("Could not remove {}: {e}", path.display()),
            }
        }
    }

    /// The supervisor's last written status, for relaying to the server
    /// after the post-update reconnect.
    pub fn last_status(&self) -> Option<UpdateStatus> {
        self.handshake.load_status()
    }

    /// Full coordination for one `update_available` push: stage, verify,
    /// hand off, exit.
    pub async fn handle_update(
        &self,
        payload: UpdateAvailablePayload,
        handle: &ChannelHandle,
        shutdown: &CancellationToken,
    ) -> Result<(), UpdateError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // A second push while one runs is ignored, not queued.
            return Err(UpdateError::Busy);
        }
        let result = self.run_update(payload, handle, shutdown).await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_update(
        &self,
        payload: UpdateAvailablePayload,
        handle: &ChannelHandle,
        shutdown: &CancellationToken,
    ) -> Result<(), UpdateError> {
        if payload.version == self.current_version {
            info!("Already at version {}, skipping update", payload.version);
            return Ok(());
        }

        let staging = paths::staging_dir(&self.data_dir);
        std::fs::create_dir_all(&staging)?;
        let staged_path = staging.join(paths::staged_binary_name(&payload.version));
        let part_path = staged_path.with_extension("part");

        info!(
            "Staging update {} -> {} from {}",
            self.current_version, payload.version, payload.url
        );

        self.download_with_retries(&payload.url, &part_path, shutdown)
            .await?;

        if let Err(reason) = verify_staged(&part_path, &payload) {
            let _ = std::fs::remove_file(&part_path);
            self.report_status(
                handle,
                UpdateStatus {
                    error: Some(reason.clone()),
                    ..UpdateStatus::new(UpdateState::Failed, &payload.version)
                },
            )
            .await;
            return Err(UpdateError::Verify(reason));
        }

        // The final name only ever refers to a verified binary.
        std::fs::rename(&part_path, &staged_path)?;

        let target_path = std::env::current_exe()?;
        let request = UpdateRequest {
            version: payload.version.clone(),
            staged_path: staged_path.clone(),
            sha256: payload.sha256.to_ascii_lowercase(),
            target_path,
            requested_at: Utc::now(),
            requested_by: "agent".to_string(),
        };
        self.handshake.write_request(&request)?;

        self.nudge_supervisor().await;
        self.report_status(
            handle,
            UpdateStatus::new(UpdateState::Pending, &payload.version),
        )
        .await;

        info!(
            "Update {} staged and handed to supervisor, exiting for swap",
            payload.version
        );
        shutdown.cancel();
        Ok(())
    }

    async fn download_with_retries(
        &self,
        url: &str,
        dest: &Path,
        shutdown: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));
        loop {
            match self.download(url, dest, shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Partial files never survive a failed attempt.
                    let _ = std::fs::remove_file(dest);
                    if shutdown.is_cancelled() {
                        return Err(UpdateError::Canceled);
                    }
                    if backoff.attempt() + 1 >= DOWNLOAD_ATTEMPTS {
                        return Err(UpdateError::Download(e));
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "Download attempt {} failed ({e}), retrying in {:?}",
                        backoff.attempt(),
                        delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(UpdateError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        shutdown: &CancellationToken,
    ) -> Result<(), String> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("server answered {}", response.status()));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| e.to_string())?;
        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => return Err("canceled".to_string()),
                chunk = response.chunk() => chunk.map_err(|e| e.to_string())?,
            };
            match chunk {
                Some(bytes) => file.write_all(&bytes).await.map_err(|e| e.to_string())?,
                None => break,
            }
        }
        file.flush().await.map_err(|e| e.to_string())?;
        file.sync_all().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Realtime signal to the supervisor. Failure is fine: the supervisor
    /// polls the request file anyway.
    async fn nudge_supervisor(&self) {
        let endpoint = paths::supervisor_endpoint(&self.data_dir);
        match IpcStream::connect(&endpoint).await {
            Ok(mut stream) => {
                let message = SupervisorMessage::UpdateRequestReady {
                    request_path: self.handshake.request_path(),
                };
                if let Err(e) = stream.send(&message).await {
                    debug!("Supervisor nudge failed: {e}");
                }
            }
            Err(e) => debug!("Supervisor not reachable ({e}), relying on its poll"),
        }
    }

    async fn report_status(&self, handle: &ChannelHandle, status: UpdateStatus) {
        let frame = Frame::new(
            kind::UPDATE_STATUS,
            serde_json::to_value(&status).unwrap_or_else(|_| json!({})),
        );
        if handle.send(frame).await.is_err() {
            debug!("Channel not connected, update status not relayed");
        }
    }
}

/// Size (when declared) and SHA-256 must match the manifest before the
/// staged file gets its final name.
fn verify_staged(path: &Path, payload: &UpdateAvailablePayload) -> Result<(), String> {
    let metadata = std::fs::metadata(path).map_err(|e| format!("stat failed: {e}"))?;
    if metadata.len() == 0 {
        return Err("staged file is empty".to_string());
    }
    if let Some(expected) = payload.size {
        if metadata.len() != expected {
            return Err(format!(
                "size mismatch: expected {expected}, got {}",
                metadata.len()
            ));
        }
    }
    let actual = sha256_file(path).map_err(|e| format!("hashing failed: {e}"))?;
    if !actual.eq_ignore_ascii_case(&payload.sha256) {
        return Err(format!(
            "sha256 mismatch: expected {}, got {actual}",
            payload.sha256
        ));
    }
    Ok(())
}
