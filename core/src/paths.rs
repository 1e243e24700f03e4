//! Filesystem layout shared by the three processes.
//!
//! Everything lives under one data directory. `SENTINEL_DATA_DIR`
//! overrides the platform default, which also gives tests a tempdir
//! escape hatch.

use std::path::PathBuf;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "SENTINEL_DATA_DIR";

/// Root data directory for config, handshake files, and staging.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    {
        let program_data =
            std::env::var("PROGRAMDATA").unwrap_or_else(|_| "C:\\ProgramData".to_string());
        PathBuf::from(program_data).join("Sentinel")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/var/lib/sentinel-agent")
    }
}

/// The agent config/identity file.
pub fn config_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("config.json")
}

/// Directory holding the supervisor handshake files.
pub fn handshake_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("update")
}

/// Directory where downloaded-but-not-installed binaries are staged.
pub fn staging_dir(data_dir: &std::path::Path) -> PathBuf {
    handshake_dir(data_dir).join("staging")
}

/// File name of a staged agent binary for `version` on this platform.
pub fn staged_binary_name(version: &str) -> String {
    format!(
        "sentinel-agent-{}-{}-{}",
        version,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Local IPC endpoint the supervisor listens on for agent nudges.
pub fn supervisor_endpoint(data_dir: &std::path::Path) -> PathBuf {
    #[cfg(windows)]
    {
        let _ = data_dir;
        PathBuf::from(r"\\.\pipe\sentinel-supervisor")
    }
    #[cfg(not(windows))]
    {
        data_dir.join("supervisor.sock")
    }
}

/// Local IPC endpoint for the helper serving interactive session `session_id`.
pub fn helper_endpoint(data_dir: &std::path::Path, session_id: u32) -> PathBuf {
    #[cfg(windows)]
    {
        let _ = data_dir;
        PathBuf::from(format!(r"\\.\pipe\sentinel-helper-{session_id}"))
    }
    #[cfg(not(windows))]
    {
        data_dir.join(format!("helper-{session_id}.sock"))
    }
}

/// Short-lived helper bootstrap config for interactive session `session_id`.
pub fn helper_config_path(data_dir: &std::path::Path, session_id: u32) -> PathBuf {
    data_dir.join(format!("helper-{session_id}.json"))
}
