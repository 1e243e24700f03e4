//! Exponential backoff with a cap and jitter for reconnect and retry loops.

use std::time::Duration;

use rand::Rng;

/// Reconnect schedule: `min(base * 2^attempt, cap)` plus up to ±25% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The control-channel schedule from the protocol: base 1s, cap 60s.
    pub fn for_reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Attempts made since the last `reset`.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay before the next attempt, with jitter, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        let raw = delay_for_attempt(self.base, self.cap, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        apply_jitter(raw)
    }

    /// Reset the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// The un-jittered delay for a given attempt number.
pub fn delay_for_attempt(base: Duration, cap: Duration, attempt: u32) -> Duration {
    // 2^attempt saturates well before the cap can't absorb it.
    let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
    let raw = base.saturating_mul(factor.min(u32::MAX as u64) as u32);
    raw.min(cap)
}

/// Spread a delay by up to ±25% so reconnecting fleets don't stampede.
fn apply_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return delay;
    }
    let spread = millis / 4;
    let jittered = rand::thread_rng().gen_range(millis.saturating_sub(spread)..=millis + spread);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_until_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let expected = [1u64, 2, 4, 8, 16, 32, 60, 60, 60, 60, 60];
        for (attempt, secs) in expected.iter().enumerate() {
            assert_eq!(
                delay_for_attempt(base, cap, attempt as u32),
                Duration::from_secs(*secs),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let mut backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(60));
        backoff.attempt = 0;
        for _ in 0..50 {
            backoff.attempt = 0;
            let d = backoff.next_delay();
            assert!(d >= Duration::from_secs(3), "jitter too low: {d:?}");
            assert!(d <= Duration::from_secs(5), "jitter too high: {d:?}");
        }
    }

    #[test]
    fn attempt_counter_advances_and_resets() {
        let mut backoff = Backoff::for_reconnect();
        assert_eq!(backoff.attempt(), 0);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn huge_attempt_saturates_at_cap() {
        let d = delay_for_attempt(Duration::from_secs(1), Duration::from_secs(60), 200);
        assert_eq!(d, Duration::from_secs(60));
    }
}
