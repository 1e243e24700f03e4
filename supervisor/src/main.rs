mod integrity;
mod liveness;
mod protect;
mod service;
mod updater;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::handshake::HandshakeDir;
use sentinel_core::ipc::{IpcListener, SupervisorMessage};
use sentinel_core::paths;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::integrity::{Baseline, BASELINE_FILE};
use crate::liveness::LivenessConfig;
use crate::updater::{UpdateOutcome, Updater, UpdaterConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the update loop polls for a request file; the IPC nudge
/// shortcuts the wait.
const UPDATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How often the integrity monitor re-verifies the baseline.
const INTEGRITY_INTERVAL: Duration = Duration::from_secs(300);

fn print_usage() {
    eprintln!("Usage: sentinel-supervisor [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --data-dir=PATH   Override the data directory");
    eprintln!("  --version         Print version and exit");
    eprintln!("  --help            Print this help message");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut data_dir: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--data-dir=") {
            data_dir = Some(PathBuf::from(value));
        } else {
            match arg.as_str() {
                "--version" => {
                    println!("sentinel-supervisor {VERSION}");
                    return Ok(());
                }
                "--help" => {
                    print_usage();
                    return Ok(());
                }
                other => {
                    eprintln!("Unknown option: {other}");
                    print_usage();
                    std::process::exit(64);
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

    let data_dir = data_dir.unwrap_or_else(paths::data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let handshake = HandshakeDir::new(paths::handshake_dir(&data_dir));
    std::fs::create_dir_all(handshake.dir())?;
    let staging = paths::staging_dir(&data_dir);

    info!(
        "sentinel-supervisor {VERSION} starting (data dir {})",
        data_dir.display()
    );

    let svc = Arc::new(platform_service_control());
    let updater = Arc::new(Updater::new(
        svc.clone(),
        handshake.clone(),
        staging,
        UpdaterConfig::default(),
    ));

    let shutdown = setup_shutdown_signal();

    // First install: record a baseline if none exists yet.
    let baseline_path = handshake.dir().join(BASELINE_FILE);
    if Baseline::load(&baseline_path).is_none() {
        let baseline = Baseline::generate(&protected_paths());
        if let Err(e) = baseline.save(&baseline_path) {
            warn!("Could not write initial baseline: {e}");
        }
    }

    // Realtime nudge channel from the agent.
    let nudge = Arc::new(Notify::new());
    spawn_nudge_listener(&data_dir, nudge.clone(), shutdown.clone());

    tokio::spawn(liveness::run_liveness_loop(
        svc,
        handshake.clone(),
        LivenessConfig::default(),
        shutdown.clone(),
    ));

    integrity::spawn_monitor(baseline_path.clone(), INTEGRITY_INTERVAL, shutdown.clone());

    // The update loop runs on the main task.
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(UPDATE_POLL_INTERVAL) => {}
            _ = nudge.notified() => debug!("Update nudge received"),
        }

        if let Some(outcome) = updater.poll_once().await {
            info!("Update finished: {outcome:?}");
            if outcome == UpdateOutcome::Complete {
                // The installed tree changed; the old digests are dead.
                let baseline = Baseline::generate(&protected_paths());
                if let Err(e) = baseline.save(&baseline_path) {
                    warn!("Could not refresh baseline: {e}");
                }
            }
        }
    }

    info!("sentinel-supervisor exiting");
    Ok(())
}

#[cfg(unix)]
fn platform_service_control() -> service::SystemdControl {
    service::SystemdControl::new(service::AGENT_SERVICE)
}

#[cfg(windows)]
fn platform_service_control() -> service::ScControl {
    service::ScControl::new(service::AGENT_SERVICE)
}

/// The files this supervisor defends: the agent binary installed next to
/// it, and itself.
fn protected_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        let agent = exe.with_file_name(if cfg!(windows) {
            "sentinel-agent.exe"
        } else {
            "sentinel-agent"
        });
        paths.push(agent);
        paths.push(exe);
    }
    paths
}

/// Accept agent connections on the supervisor endpoint and translate
/// `update_request_ready` into a poll nudge.
fn spawn_nudge_listener(data_dir: &std::path::Path, nudge: Arc<Notify>, shutdown: CancellationToken) {
    let endpoint = paths::supervisor_endpoint(data_dir);
    let mut listener = match IpcListener::bind(&endpoint) {
        Ok(listener) => listener,
        Err(e) => {
            // Not fatal: the poll loop still finds request files.
            warn!("Could not bind supervisor endpoint: {e}");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            let mut stream = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("IPC accept failed: {e}");
                        continue;
                    }
                },
            };

            let nudge = nudge.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        message = stream.recv::<SupervisorMessage>() => message,
                    };
                    match message {
                        Ok(Some(SupervisorMessage::UpdateRequestReady { request_path })) => {
                            info!("Agent announced {}", request_path.display());
                            nudge.notify_one();
                        }
                        Ok(None) => return,
                        Err(e) => {
                            debug!("IPC receive error: {e}");
                            return;
                        }
                    }
                }
            });
        }
    });
}

fn setup_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C), initiating shutdown");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, initiating shutdown");
        }

        token_clone.cancel();
    });

    token
}
