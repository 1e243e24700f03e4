//! Wiring for the agent's service mode: config, liveness file, control
//! channel, metrics, and the dispatcher main loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use sentinel_core::config::ConfigStore;
use sentinel_core::frames::{AgentInventoryPayload, AuthPayload};
use sentinel_core::handshake::{AgentInfo, HandshakeDir};
use sentinel_core::paths;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{self, ChannelConfig};
use crate::command::CommandEngine;
use crate::dispatch::Dispatcher;
use crate::helper::HelperManager;
use crate::metrics;
use crate::update::UpdateCoordinator;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The agent-info file doubles as the supervisor's liveness signal, so
/// it is rewritten on a short fixed cadence.
const AGENT_INFO_REFRESH: Duration = Duration::from_secs(10);

/// Run the agent until shutdown or a fatal channel stop.
pub async fn run_agent(data_dir: PathBuf, shutdown: CancellationToken) -> anyhow::Result<()> {
    let store = Arc::new(
        ConfigStore::open(paths::config_path(&data_dir))
            .context("agent is not installed (config missing); run --install first")?,
    );
    let config = store.snapshot().await;

    info!(
        "sentinel-agent {VERSION} starting (agent_id={}, server={})",
        config.agent_id, config.server_url
    );

    let handshake = HandshakeDir::new(paths::handshake_dir(&data_dir));
    spawn_agent_info_writer(handshake.clone(), config.agent_id, shutdown.clone());

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let auth = AuthPayload {
        agent_id: config.agent_id.to_string(),
        enrollment_token: config.enrollment_token.clone(),
        version: VERSION.to_string(),
        hostname: hostname.clone(),
        os_type: std::env::consts::OS.to_string(),
    };
    let (handle, events) = channel::start(
        ChannelConfig {
            server_url: config.server_url.clone(),
            auth,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        },
        shutdown.clone(),
    );

    metrics::spawn_collector(
        handle.clone(),
        Duration::from_secs(config.metrics_interval_secs.max(1)),
        shutdown.clone(),
    );

    let engine = Arc::new(CommandEngine::new());
    let update = Arc::new(UpdateCoordinator::new(data_dir.clone(), VERSION.to_string()));
    update.clean_stale_staging();
    let helper = Arc::new(HelperManager::new(data_dir.clone(), shutdown.clone()));

    let inventory = AgentInventoryPayload {
        agent_id: config.agent_id.to_string(),
        version: VERSION.to_string(),
        hostname,
        os_type: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    };

    let dispatcher = Dispatcher::new(
        handle,
        store,
        engine,
        update,
        helper,
        inventory,
        shutdown.clone(),
    );
    dispatcher.run(events).await;

    info!("sentinel-agent exiting");
    Ok(())
}

/// Write agent-info now and keep its mtime fresh; the supervisor treats
/// a stale file as a hung agent.
fn spawn_agent_info_writer(
    handshake: HandshakeDir,
    agent_id: uuid::Uuid,
    shutdown: CancellationToken,
) {
    let info = AgentInfo {
        version: VERSION.to_string(),
        pid: std::process::id(),
        started_at: Utc::now(),
        agent_id,
    };
    if let Err(e) = handshake.write_agent_info(&info) {
        warn!("Could not write agent-info: {e}");
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(AGENT_INFO_REFRESH);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = handshake.write_agent_info(&info) {
                        warn!("Could not refresh agent-info: {e}");
                    }
                }
            }
        }
    });
}
