//! Wall-clock helpers
//!
//! Sessions record the Unix time of their last upstream message, and the
//! health monitor logs how long ago that was when a session turns unhealthy. Liveness checks use `tokio::time::Instant` instead, which
//! tests can pause.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds
///
/// A clock set before 1970 reads as zero.
///
/// # Examples
/// ```
/// use kp_core::time::current_time_millis;
///
/// assert!(current_time_millis() > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Milliseconds elapsed since a timestamp, zero if it lies in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

/// Elapsed time since a millisecond timestamp as a `Duration`
pub fn elapsed_duration(since_millis: u64) -> Duration {
    Duration::from_millis(elapsed_millis(since_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_millis() {
        let now = current_time_millis();
        std::thread::sleep(Duration::from_millis(10));
        assert!(elapsed_millis(now) >= 10);
    }

    #[test]
    fn test_elapsed_millis_future_time() {
        let future = current_time_millis() + 1_000_000;
        assert_eq!(elapsed_millis(future), 0);
        assert_eq!(elapsed_duration(future), Duration::ZERO);
    }
}
