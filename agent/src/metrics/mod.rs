//! Periodic metric frames toward the server.
//!
//! One background task samples the host on a fixed interval and enqueues
//! a `metrics` frame. Sampling is cooperative: the task exits promptly on
//! shutdown and never blocks the dispatcher or the channel (a full
//! outbound queue just delays the frame; a disconnected channel drops it).

pub mod sampler;

use std::time::Duration;

use sentinel_core::frames::{kind, Frame};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{ChannelError, ChannelHandle};
use self::sampler::Sampler;

/// Spawn the metrics loop. The first frame goes out one full interval
/// after start, which also gives the CPU delta a baseline.
pub fn spawn_collector(
    handle: ChannelHandle,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sampler = Sampler::new();
        // Prime the CPU counters so the first emitted frame has a delta.
        let _ = sampler.sample();

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + interval,
            interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Metrics collector stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let payload = sampler.sample();
            let frame = match serde_json::to_value(&payload) {
                Ok(value) => Frame::new(kind::METRICS, value),
                Err(e) => {
                    warn!("Metrics payload unserializable: {e}");
                    continue;
                }
            };
            match handle.send(frame).await {
                Ok(()) => {}
                // Disconnected: skip this tick, the next connect gets fresh data.
                Err(ChannelError::NotConnected) => {
                    debug!("Metrics skipped, channel not connected");
                }
            }
        }
    })
}
