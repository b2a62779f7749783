//! Retry policy for failed download jobs
//!
//! Backoff constants are server-supplied ([`RetrySettings`] comes from the
//! settings endpoint), the decision itself is pure: the manager owns the
//! countdown timers and the resubmission.

use std::time::Duration;

use downbeat_server_client::RetrySettings;

use crate::task::{TaskEntry, TaskState};

/// Outcome of a retry eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay (zero delay still means "countdown of
    /// zero": manual retries bypass the wait, not the check)
    Retry { delay: Duration },
    /// The retry budget is spent; the entry can only be dismissed
    Exhausted,
    /// The entry is not in a retryable state
    NotRetryable,
}

/// Decides whether and when a failed job may be resubmitted
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    pub fn max_retries(&self) -> u32 {
        self.settings.max_retries
    }

    /// Linear backoff: `base + retries_spent * increase`
    pub fn delay_for(&self, retries_spent: u32) -> Duration {
        Duration::from_secs(
            self.settings.retry_delay_secs
                + u64::from(retries_spent) * self.settings.retry_delay_increase_secs,
        )
    }

    /// Check retry eligibility for an entry
    ///
    /// Only error-terminal entries are retryable; the submit request is
    /// always retained on the entry, so eligibility reduces to the state and
    /// the retry budget.
    pub fn decide(&self, entry: &TaskEntry) -> RetryDecision {
        if entry.state != TaskState::Error {
            return RetryDecision::NotRetryable;
        }
        if entry.retry_count >= self.settings.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            delay: self.delay_for(entry.retry_count),
        }
    }

    /// Whether an error status with `retries_spent` retries behind it still
    /// has budget left. Used at bootstrap, where only the cached count is
    /// available.
    pub fn retries_remain(&self, retries_spent: u32) -> bool {
        retries_spent < self.settings.max_retries
    }
}
