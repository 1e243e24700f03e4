//! Process-wide token bucket for command execution.
//!
//! Default shape: 10 tokens capacity, refilled at 30 tokens per minute.
//! An empty bucket answers `rate_limited` without executing anything.
//! Time comes from `tokio::time::Instant` so tests can pause the clock.

use std::sync::Mutex;

use tokio::time::Instant;

pub const DEFAULT_CAPACITY: u32 = 10;
pub const DEFAULT_REFILL_PER_MINUTE: u32 = 30;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_minute: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_minute as f64 / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_PER_MINUTE)
    }
}
