//! Retry policy: exponential backoff keyed to the attempt count.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for a single backoff delay.
///
/// The exponential grows past anything `chrono` can represent after a few
/// dozen attempts; delays saturate here instead.
pub const MAX_BACKOFF: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Outcome of evaluating a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job; it becomes eligible again at the given time.
    RetryAt(DateTime<Utc>),
    /// Attempts are exhausted; the job fails permanently.
    GiveUp,
}

/// Backoff policy: `delay = base * 2^attempts`, no jitter.
///
/// With the default one-minute base, a first failed attempt waits 2 minutes,
/// the second 4, the third 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Unit the exponential is multiplied with.
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_base(base: Duration) -> Self {
        Self { base }
    }

    /// Delay before the next attempt after `attempts` attempts have failed.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
    }

    /// Retryable iff attempts remain after the one that just failed.
    pub fn should_retry(&self, attempts: u32, max_attempts: u32) -> bool {
        attempts < max_attempts
    }

    pub fn decide(&self, attempts: u32, max_attempts: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if !self.should_retry(attempts, max_attempts) {
            return RetryDecision::GiveUp;
        }

        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        RetryDecision::RetryAt(failed_at + delay)
    }
}
