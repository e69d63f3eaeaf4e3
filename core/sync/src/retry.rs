//! Cross-pass retry policy for failed pending actions.
//!
//! A failed action is never re-attempted within the same sync pass. The
//! policy only decides whether it stays queued for the next pass or is
//! dropped for good.

use serde::{Deserialize, Serialize};

use fieldsync_common::{Error, Result};

/// Default number of attempts before an action is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry budget for pending actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total failed attempts allowed, counted across passes.
    pub max_retries: u32,
}

/// What to do with an action after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the action and persist the new retry count.
    Retry {
        /// Count to persist.
        retry_count: u32,
    },
    /// Remove the action permanently.
    Drop {
        /// Failed attempts, including this one.
        attempts: u32,
    },
}

impl RetryPolicy {
    /// Create a policy.
    ///
    /// # Errors
    /// - `max_retries` is zero
    pub fn new(max_retries: u32) -> Result<Self> {
        if max_retries == 0 {
            return Err(Error::InvalidInput(
                "max_retries must be at least 1".to_string(),
            ));
        }
        Ok(Self { max_retries })
    }

    /// Decide the fate of an action that just failed with `retry_count`
    /// previous failures.
    pub fn on_failure(&self, retry_count: u32) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next >= self.max_retries {
            RetryDecision::Drop { attempts: next }
        } else {
            RetryDecision::Retry { retry_count: next }
        }
    }

    /// Attempts left before the action is dropped.
    pub fn remaining(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}
