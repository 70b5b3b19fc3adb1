//! Retry budget and backoff timing for failed attempts.
//!
//! Delay computation is pure: the scheduler asks for a delay and sleeps in
//! its own queue without holding an execution slot. Delays grow
//! exponentially from a base, are capped, and carry equal jitter (half
//! fixed, half random) so synchronized retries from many tasks spread out.

use std::time::Duration;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Default total attempt budget per task, first attempt included.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay in milliseconds.
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Default cap on the delay in milliseconds.
const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;

/// Retry policy applied to transient attempt failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed per task, counting the first.
    pub max_attempts: u32,
    /// Base delay before the second attempt, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on any computed delay, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
        }
    }
}

impl RetryPolicy {
    /// Sets the total attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the backoff base and cap in milliseconds.
    pub fn with_backoff_bounds_ms(mut self, base: u64, cap: u64) -> Self {
        self.backoff_base_ms = base;
        self.backoff_cap_ms = cap.max(base);
        self
    }

    /// Whether the budget permits another attempt after `completed` finished ones.
    pub fn allows_another(&self, completed: u32) -> bool {
        completed < self.max_attempts
    }

    /// Deterministic backoff after the given 1-based failed attempt.
    ///
    /// Doubles per attempt from the base: 1s, 2s, 4s, ... up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // Shift capped so the multiply cannot overflow.
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(raw.min(self.backoff_cap_ms))
    }

    /// Jittered delay to wait before re-enqueueing the next attempt.
    ///
    /// Equal jitter over [`backoff_for`](Self::backoff_for): half the backoff
    /// is fixed, the other half uniformly random.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff_ms = self.backoff_for(attempt).as_millis() as u64;
        if backoff_ms == 0 {
            return Duration::ZERO;
        }
        let half = backoff_ms / 2;
        let jittered = half + rand::rng().random_range(0..=backoff_ms - half);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base_ms, 1_000);
        assert_eq!(policy.backoff_cap_ms, 60_000);
    }

    #[test]
    fn test_budget_counts_first_attempt() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
        assert!(!policy.allows_another(4));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default().with_backoff_bounds_ms(1_000, 5_000);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(5_000));
        assert_eq!(policy.backoff_for(5), Duration::from_millis(5_000));
    }

    #[test]
    fn test_backoff_never_overflows() {
        let policy = RetryPolicy::default().with_backoff_bounds_ms(u64::MAX / 2, u64::MAX);
        let delay = policy.backoff_for(200);
        assert!(delay <= Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_delay_stays_within_jitter_bounds() {
        let policy = RetryPolicy::default().with_backoff_bounds_ms(4_000, 60_000);
        for attempt in 1..=4 {
            let backoff = policy.backoff_for(attempt);
            for _ in 0..16 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= backoff / 2, "delay below jitter floor");
                assert!(delay <= backoff, "delay above backoff ceiling");
            }
        }
    }

    #[test]
    fn test_zero_attempt_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_minimum_one_attempt() {
        let policy = RetryPolicy::default().with_max_attempts(0);
        assert_eq!(policy.max_attempts, 1);
    }
}
