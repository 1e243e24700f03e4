mod channel;
mod exit_codes;
mod session_lock;

use sentinel_core::paths;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("Usage: sentinel-helper --session=<id> [--data-dir=PATH]");
    eprintln!();
    eprintln!("Spawned by the agent inside the interactive user session;");
    eprintln!("not intended to be run by hand.");
}

#[tokio::main]
async fn main() {
    let mut session_id: Option<u32> = None;
    let mut data_dir: Option<std::path::PathBuf> = None;

    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--session=") {
            session_id = value.parse().ok();
        } else if let Some(value) = arg.strip_prefix("--data-dir=") {
            data_dir = Some(std::path::PathBuf::from(value));
        } else {
            match arg.as_str() {
                "--version" => {
                    println!("sentinel-helper {VERSION}");
                    std::process::exit(exit_codes::SUCCESS);
                }
                "--help" => {
                    print_usage();
                    std::process::exit(exit_codes::SUCCESS);
                }
                other => {
                    eprintln!("Unknown option: {other}");
                    print_usage();
                    std::process::exit(exit_codes::INTERNAL_ERROR);
                }
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(session_id) = session_id else {
        eprintln!("--session=<id> is required");
        std::process::exit(exit_codes::DESKTOP_UNAVAILABLE);
    };
    let data_dir = data_dir.unwrap_or_else(paths::data_dir);

    info!("sentinel-helper {VERSION} starting in session {session_id}");

    // At most one helper per interactive session.
    let _lock = match session_lock::SessionLock::acquire(&data_dir, session_id) {
        Ok(lock) => lock,
        Err(session_lock::LockError::Held(pid)) => {
            warn!("Session already served by pid {pid}");
            std::process::exit(exit_codes::MUTEX_CONFLICT);
        }
        Err(e) => {
            warn!("Session lock failed: {e}");
            std::process::exit(exit_codes::INTERNAL_ERROR);
        }
    };

    let config_path = paths::helper_config_path(&data_dir, session_id);
    let config = match channel::read_bootstrap(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Bootstrap failed: {e}");
            std::process::exit(exit_codes::INTERNAL_ERROR);
        }
    };

    let code = channel::run(config).await;
    info!("sentinel-helper exiting with code {code}");
    std::process::exit(code);
}
