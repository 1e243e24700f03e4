//! One helper per interactive session.
//!
//! A lock file keyed by the session id plays the role of the
//! session-scoped named mutex: created exclusively with the holder's pid
//! inside, removed on clean exit. A lock whose recorded pid no longer
//! runs is stale (the previous helper crashed) and is broken once.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another helper already serves this session (pid {0})")]
    Held(u32),
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Acquire the per-session lock, breaking a stale one if its owner
    /// is gone.
    pub fn acquire(data_dir: &Path, session_id: u32) -> Result<Self, LockError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("helper-{session_id}.lock"));

        match try_create(&path) {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_holder(&path);
                match holder {
                    Some(pid) if process_alive(pid) => Err(LockError::Held(pid)),
                    _ => {
                        // Stale: the recorded pid is dead or unreadable.
                        std::fs::remove_file(&path)?;
                        try_create(&path)?;
                        Ok(Self { path })
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn try_create(path: &Path) -> io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    write!(file, "{}", std::process::id())
}

fn read_holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        // Without a cheap liveness probe, assume the holder is alive;
        // a crashed helper's lock is cleared by the agent's next spawn
        // cycle timing out and the user session ending.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = SessionLock::acquire(tmp.path(), 1).unwrap();
        let path = tmp.path().join("helper-1.lock");
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let _held = SessionLock::acquire(tmp.path(), 2).unwrap();
        match SessionLock::acquire(tmp.path(), 2) {
            Err(LockError::Held(pid)) => assert_eq!(pid, std::process::id()),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("lock should already be held"),
        }
    }

    #[test]
    fn different_sessions_do_not_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let _a = SessionLock::acquire(tmp.path(), 3).unwrap();
        let _b = SessionLock::acquire(tmp.path(), 4).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_is_broken() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("helper-5.lock");
        // A pid far above pid_max that cannot be alive.
        std::fs::write(&path, "999999999").unwrap();
        let _lock = SessionLock::acquire(tmp.path(), 5).unwrap();
    }

    #[test]
    fn garbage_lock_content_is_treated_as_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("helper-6.lock");
        std::fs::write(&path, "not-a-pid").unwrap();
        let _lock = SessionLock::acquire(tmp.path(), 6).unwrap();
    }
}
