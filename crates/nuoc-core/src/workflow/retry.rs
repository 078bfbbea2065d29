//! Retry and backoff arithmetic.
//!
//! Stateless: all functions take the retry settings as parameters. Task
//! retries sleep in-process for `backoff_delay`; job retries persist
//! `next_retry_at` and wait for the retry sweep.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Upper bound on a single backoff delay (one day).
pub const MAX_BACKOFF_MS: u64 = 24 * 60 * 60 * 1000;

/// Stateless retry helper.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed. `attempt` is 1-based.
    pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }

    /// `base_delay × scaling^(attempt − 1)`, capped at [`MAX_BACKOFF_MS`];
    /// attempt 0 is treated as 1.
    ///
    /// An overflowing or NaN product saturates at the cap. Only a zero base
    /// delay (or a non-positive product) yields no delay.
    pub fn backoff_delay(attempt: u32, base_delay_ms: u64, scaling: f64) -> Duration {
        if base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = base_delay_ms as f64 * scaling.powi(exponent);
        if millis.is_nan() || millis >= MAX_BACKOFF_MS as f64 {
            Duration::from_millis(MAX_BACKOFF_MS)
        } else if millis > 0.0 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Instant of the next retry: `now + backoff_delay(attempt, ..)`.
    pub fn next_retry_at(
        now: DateTime<Utc>,
        attempt: u32,
        base_delay_ms: u64,
        scaling: f64,
    ) -> DateTime<Utc> {
        let delay = Self::backoff_delay(attempt, base_delay_ms, scaling);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_is_bounded() {
        assert!(RetryHandler::should_retry(1, 3));
        assert!(RetryHandler::should_retry(2, 3));
        assert!(!RetryHandler::should_retry(3, 3));
        assert!(!RetryHandler::should_retry(1, 1));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let delays: Vec<u64> = (1..=4)
            .map(|a| RetryHandler::backoff_delay(a, 1000, 2.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn test_next_retry_at_attempt_three() {
        let now = Utc::now();
        let at = RetryHandler::next_retry_at(now, 3, 1000, 2.0);
        assert_eq!(at - now, chrono::Duration::seconds(4));
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(RetryHandler::backoff_delay(0, 500, 2.0), Duration::from_millis(500));
        assert_eq!(RetryHandler::backoff_delay(5, 0, 2.0), Duration::ZERO);
        assert_eq!(RetryHandler::backoff_delay(3, 100, 1.0), Duration::from_millis(100));
        let now = Utc::now();
        assert!(RetryHandler::next_retry_at(now, 500, 1000, 10.0) > now);
    }

    #[test]
    fn test_overflowing_backoff_saturates_at_cap() {
        let cap = Duration::from_millis(MAX_BACKOFF_MS);
        assert_eq!(RetryHandler::backoff_delay(500, 1000, 10.0), cap);
        assert_eq!(RetryHandler::backoff_delay(u32::MAX, 1, 2.0), cap);
        assert_eq!(RetryHandler::backoff_delay(2, 1000, f64::NAN), cap);
        assert_eq!(RetryHandler::backoff_delay(1, u64::MAX, 1.0), cap);

        let now = Utc::now();
        let at = RetryHandler::next_retry_at(now, 500, 1000, 10.0);
        assert_eq!(at - now, chrono::Duration::milliseconds(MAX_BACKOFF_MS as i64));
    }

    #[test]
    fn test_backoff_never_shrinks_as_attempts_grow() {
        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let delay = RetryHandler::backoff_delay(attempt, 250, 3.0);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= Duration::from_millis(MAX_BACKOFF_MS));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(MAX_BACKOFF_MS));
    }
}
