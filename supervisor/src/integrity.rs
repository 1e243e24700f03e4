//! Protected-file baseline: digests of the files the supervisor defends.
//!
//! Generated on install and after every successful update; the monitor
//! loop re-verifies on an interval and logs any drift. Detection only;
//! remediation is the update/reinstall machinery's job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sentinel_core::handshake::{load_json, write_json_atomic};
use sentinel_core::hashing::sha256_file;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const BASELINE_FILE: &str = "baseline.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDigest {
    pub sha256: String,
    pub size: u64,
    /// Seconds since the epoch of the file's mtime.
    pub mtime: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Baseline {
    pub files: BTreeMap<PathBuf, FileDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Missing(PathBuf),
    Modified(PathBuf),
}

impl Baseline {
    /// Digest every given path that exists right now.
    pub fn generate(paths: &[PathBuf]) -> Self {
        let mut files = BTreeMap::new();
        for path in paths {
            match digest_file(path) {
                Some(digest) => {
                    files.insert(path.clone(), digest);
                }
                None => warn!("Baseline skipping unreadable {}", path.display()),
            }
        }
        Self { files }
    }

    /// Compare the recorded digests against the filesystem. A size or
    /// content change is a modification; mtime alone is not trusted
    /// either way.
    pub fn verify(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        for (path, recorded) in &self.files {
            match digest_file(path) {
                None => violations.push(Violation::Missing(path.clone())),
                Some(current) => {
                    if current.sha256 != recorded.sha256 || current.size != recorded.size {
                        violations.push(Violation::Modified(path.clone()));
                    }
                }
            }
        }
        violations
    }

    pub fn load(path: &Path) -> Option<Self> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        write_json_atomic(path, self)
    }
}

fn digest_file(path: &Path) -> Option<FileDigest> {
    let metadata = std::fs::metadata(path).ok()?;
    let mtime = metadata
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    Some(FileDigest {
        sha256: sha256_file(path).ok()?,
        size: metadata.len(),
        mtime,
    })
}

/// Periodic verification against the stored baseline. Regenerating the
/// baseline after updates is the updater's responsibility; this loop
/// only watches.
pub fn spawn_monitor(
    baseline_path: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(baseline) = Baseline::load(&baseline_path) else {
                debug!("No integrity baseline at {}", baseline_path.display());
                continue;
            };
            for violation in baseline.verify() {
                match violation {
                    Violation::Missing(path) => {
                        warn!("Protected file missing: {}", path.display());
                    }
                    Violation::Modified(path) => {
                        warn!("Protected file modified: {}", path.display());
                    }
                }
            }
        }
    })
}
