//! Stable helper exit codes, read by the agent and supervisor for
//! diagnostics. Values are part of the cross-process contract; never
//! renumber.

pub const SUCCESS: i32 = 0;
pub const CHANNEL_DISCONNECTED: i32 = 10;
pub const TOKEN_EXPIRED: i32 = 11;
pub const DESKTOP_UNAVAILABLE: i32 = 12;
pub const SECURE_DESKTOP: i32 = 13;
pub const IDLE_TIMEOUT: i32 = 14;
pub const SHUTDOWN_REQUESTED: i32 = 15;
pub const MUTEX_CONFLICT: i32 = 16;
pub const AUTH_FAILED: i32 = 17;
pub const INTERNAL_ERROR: i32 = 18;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let codes = [
            SUCCESS,
            CHANNEL_DISCONNECTED,
            TOKEN_EXPIRED,
            DESKTOP_UNAVAILABLE,
            SECURE_DESKTOP,
            IDLE_TIMEOUT,
            SHUTDOWN_REQUESTED,
            MUTEX_CONFLICT,
            AUTH_FAILED,
            INTERNAL_ERROR,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn success_is_zero_and_failures_are_not() {
        assert_eq!(SUCCESS, 0);
        assert!(CHANNEL_DISCONNECTED > 0);
        assert!(INTERNAL_ERROR > 0);
    }
}
