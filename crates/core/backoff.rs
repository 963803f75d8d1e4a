//! Retry scheduling for failed jobs.
//!
//! The delay after the n-th failed attempt is `n^4 + 5` seconds: 6s, 21s,
//! 86s, 261s, 630s for the first five attempts. Other components and test
//! suites depend on these exact values.

use chrono::{DateTime, TimeDelta, Utc};

/// Default number of attempts before a job is marked as failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

/// Earliest time a job may run again after its `attempts`-th failure.
pub fn next_run_at(now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
    let delay = TimeDelta::try_seconds(retry_delay_secs(attempts)).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whether a job with `attempts` failures has exhausted its retries.
pub fn is_terminal(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

/// Delay in seconds before the next attempt, `attempts^4 + 5`.
pub fn retry_delay_secs(attempts: u32) -> i64 {
    i64::from(attempts)
        .saturating_pow(4)
        .saturating_add(5)
}

/// Backoff policy bound to a configured attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: u32,
}

impl BackoffPolicy {
    /// Create a policy that gives up after `max_attempts` failures.
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn next_run_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        next_run_at(now, attempts)
    }

    pub fn is_terminal(&self, attempts: u32) -> bool {
        is_terminal(attempts, self.max_attempts)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_millis;

    #[test]
    fn test_first_five_delays() {
        let delays: Vec<i64> = (1..=5).map(retry_delay_secs).collect();
        assert_eq!(delays, vec![6, 21, 86, 261, 630]);
    }

    #[test]
    fn test_zero_attempts_delay() {
        assert_eq!(retry_delay_secs(0), 5);
    }

    #[test]
    fn test_next_run_at_adds_exact_seconds() {
        let now = from_millis(1_700_000_000_250);
        assert_eq!(next_run_at(now, 1), now + TimeDelta::seconds(6));
        assert_eq!(next_run_at(now, 3), now + TimeDelta::seconds(86));
        assert_eq!(next_run_at(now, 10), now + TimeDelta::seconds(10_005));
    }

    #[test]
    fn test_next_run_at_is_monotonic_in_attempts() {
        let now = from_millis(0);
        let mut previous = now;
        for attempts in 1..50 {
            let run_at = next_run_at(now, attempts);
            assert!(run_at > previous);
            previous = run_at;
        }
    }

    #[test]
    fn test_next_run_at_saturates() {
        let now = from_millis(0);
        assert_eq!(next_run_at(now, u32::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            next_run_at(DateTime::<Utc>::MAX_UTC, 1),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_is_terminal() {
        assert!(!is_terminal(0, 3));
        assert!(!is_terminal(2, 3));
        assert!(is_terminal(3, 3));
        assert!(is_terminal(4, 3));
    }

    #[test]
    fn test_policy_default_is_explicit() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert!(!policy.is_terminal(24));
        assert!(policy.is_terminal(25));
    }

    #[test]
    fn test_policy_delegates() {
        let policy = BackoffPolicy::new(2);
        let now = from_millis(5_000);
        assert_eq!(policy.next_run_at(now, 2), now + TimeDelta::seconds(21));
        assert!(!policy.is_terminal(1));
        assert!(policy.is_terminal(2));
    }
}
