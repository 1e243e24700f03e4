//! Keep the agent service running.
//!
//! Healthy means two things at once: the service manager reports
//! `Running`, and the agent-info file has been touched recently enough
//! that the process is actually making progress. A service that is
//! "running" with a stale liveness file gets bounced like a dead one.
//! Restarts are budgeted inside a rolling window so a crash-looping
//! binary cannot be restarted forever.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::handshake::HandshakeDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::{ServiceControl, ServiceState};

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub check_interval: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        }
    }
}

/// Rolling restart counter: at most `max` consumptions inside `window`.
pub struct RestartBudget {
    window: Duration,
    max: u32,
    events: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            window,
            max,
            events: VecDeque::new(),
        }
    }

    /// Consume one restart slot if the window allows it.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() < self.max as usize {
            self.events.push_back(now);
            true
        } else {
            false
        }
    }
}

/// The agent-liveness loop. Runs until shutdown.
pub async fn run_liveness_loop<S: ServiceControl>(
    svc: Arc<S>,
    handshake: HandshakeDir,
    config: LivenessConfig,
    shutdown: CancellationToken,
) {
    let mut budget = RestartBudget::new(config.max_restarts, config.restart_window);
    // 3·C, with a floor so sub-second test intervals don't flag a file
    // written moments ago.
    let stale_limit = config.check_interval.as_secs().saturating_mul(3).max(2);
    let mut ticker = tokio::time::interval(config.check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Liveness loop stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let state = match svc.state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Service manager query failed: {e}");
                continue;
            }
        };

        let info_fresh = handshake
            .agent_info_age_secs()
            .is_some_and(|age| age <= stale_limit);

        if state == ServiceState::Running && info_fresh {
            continue;
        }

        if !budget.try_consume(Instant::now()) {
            warn!(
                "Restart budget exhausted ({} within {:?}), waiting out the cooldown",
                config.max_restarts, config.restart_window
            );
            continue;
        }

        match state {
            ServiceState::NotInstalled => {
                warn!("Agent service missing, reinstalling");
                if let Err(e) = svc.reinstall().await {
                    warn!("Reinstall failed: {e}");
                }
            }
            ServiceState::Running => {
                // Running but stale agent-info: the process is hung.
                warn!(
                    "Agent unresponsive (liveness file stale beyond {stale_limit}s), bouncing"
                );
                if let Err(e) = svc.stop().await {
                    warn!("Stop failed: {e}");
                }
                if let Err(e) = svc.start().await {
                    warn!("Start failed: {e}");
                }
            }
            ServiceState::Stopped | ServiceState::Other => {
                debug!("Agent service not running ({state:?}), starting");
                if let Err(e) = svc.start().await {
                    warn!("Start failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::FakeServiceControl;
    use chrono::Utc;
    use sentinel_core::handshake::AgentInfo;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn budget_allows_max_within_window() {
        let mut budget = RestartBudget::new(5, Duration::from_secs(60));
        let now = Instant::now();
        for n in 0..5 {
            assert!(budget.try_consume(now), "restart {n} should fit the budget");
        }
        assert!(!budget.try_consume(now), "sixth restart must be refused");
    }

    #[tokio::test(start_paused = true)]
    async fn budget_recovers_after_window() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(60));
        let start = Instant::now();
        assert!(budget.try_consume(start));
        assert!(budget.try_consume(start));
        assert!(!budget.try_consume(start));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(budget.try_consume(Instant::now()));
    }

    fn fresh_handshake(dir: &std::path::Path) -> HandshakeDir {
        let handshake = HandshakeDir::new(dir.join("update"));
        handshake
            .write_agent_info(&AgentInfo {
                version: "1.0.0".into(),
                pid: 1,
                started_at: Utc::now(),
                agent_id: uuid::Uuid::new_v4(),
            })
            .unwrap();
        handshake
    }

    #[tokio::test]
    async fn stopped_service_gets_started() {
        let tmp = tempfile::tempdir().unwrap();
        let handshake = fresh_handshake(tmp.path());
        let svc = Arc::new(FakeServiceControl::new(ServiceState::Stopped));
        let shutdown = CancellationToken::new();

        let config = LivenessConfig {
            check_interval: Duration::from_millis(20),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        };
        let task = tokio::spawn(run_liveness_loop(
            svc.clone(),
            handshake,
            config,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert!(svc.starts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn crash_loop_is_capped_by_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let handshake = fresh_handshake(tmp.path());
        let svc = Arc::new(FakeServiceControl::new(ServiceState::Stopped));
        *svc.fail_starts.lock().unwrap() = true;
        let shutdown = CancellationToken::new();

        let config = LivenessConfig {
            check_interval: Duration::from_millis(10),
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
        };
        let task = tokio::spawn(run_liveness_loop(
            svc.clone(),
            handshake,
            config,
            shutdown.clone(),
        ));

        // Many ticks pass, but only `max_restarts` attempts are allowed
        // inside the window.
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(svc.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn healthy_service_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let handshake = fresh_handshake(tmp.path());
        let svc = Arc::new(FakeServiceControl::new(ServiceState::Running));
        let shutdown = CancellationToken::new();

        let config = LivenessConfig {
            check_interval: Duration::from_millis(20),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        };
        let task = tokio::spawn(run_liveness_loop(
            svc.clone(),
            handshake,
            config,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(svc.starts.load(Ordering::SeqCst), 0);
        assert_eq!(svc.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_service_is_reinstalled() {
        let tmp = tempfile::tempdir().unwrap();
        let handshake = fresh_handshake(tmp.path());
        let svc = Arc::new(FakeServiceControl::new(ServiceState::NotInstalled));
        let shutdown = CancellationToken::new();

        let config = LivenessConfig {
            check_interval: Duration::from_millis(20),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        };
        let task = tokio::spawn(run_liveness_loop(
            svc.clone(),
            handshake,
            config,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        task.await.unwrap();

        // reinstall() delegates to start() in the fake.
        assert!(svc.starts.load(Ordering::SeqCst) >= 1);
    }
}
