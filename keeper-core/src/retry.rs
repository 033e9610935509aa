//! Retry policies for operations interrupted by connection problems.

use std::fmt;
use std::time::Duration;

/// Upper bound on retries; beyond this the doubling overflows any sane delay.
pub const MAX_RETRIES_LIMIT: u32 = 29;

/// Default cap on a single backoff sleep.
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(30);

/// Decides whether, and after how long, a failed operation is attempted again.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Sleep before retry number `retry_count` (starting at 0), or `None` once
    /// the policy is exhausted and the failure must be surfaced.
    fn allow_retry(&self, retry_count: u32) -> Option<Duration>;

    /// Total attempts this policy permits, the first one included.
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff: retry `n` sleeps `base_sleep * 2^n`, capped at
/// `max_sleep`, for at most `max_retries` retries.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use keeper_core::{ExponentialBackoffRetry, RetryPolicy};
///
/// let policy = ExponentialBackoffRetry::new(Duration::from_millis(100), 3);
/// assert_eq!(policy.allow_retry(0), Some(Duration::from_millis(100)));
/// assert_eq!(policy.allow_retry(2), Some(Duration::from_millis(400)));
/// assert_eq!(policy.allow_retry(3), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoffRetry {
    base_sleep: Duration,
    max_retries: u32,
    max_sleep: Duration,
}

impl ExponentialBackoffRetry {
    pub fn new(base_sleep: Duration, max_retries: u32) -> Self {
        Self::with_max_sleep(base_sleep, max_retries, DEFAULT_MAX_SLEEP)
    }

    pub fn with_max_sleep(base_sleep: Duration, max_retries: u32, max_sleep: Duration) -> Self {
        Self {
            base_sleep,
            max_retries: max_retries.min(MAX_RETRIES_LIMIT),
            max_sleep,
        }
    }

    pub fn base_sleep(&self) -> Duration {
        self.base_sleep
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_sleep(&self) -> Duration {
        self.max_sleep
    }

    /// Backoff for retry number `retry_count`, ignoring the retry limit.
    pub fn sleep_for(&self, retry_count: u32) -> Duration {
        self.base_sleep
            .saturating_mul(2u32.saturating_pow(retry_count))
            .min(self.max_sleep)
    }
}

impl Default for ExponentialBackoffRetry {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 3)
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn allow_retry(&self, retry_count: u32) -> Option<Duration> {
        if retry_count < self.max_retries {
            Some(self.sleep_for(retry_count))
        } else {
            None
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}
