//! Bounded retry for pure queries.
//!
//! Only commands that cannot change remote state go through here. Input
//! commands are sent exactly once; a lost click is reported, never repeated.

use crate::error::Result;
use crate::protocol::Command;
use std::future::Future;
use std::time::Duration;

/// Backoff before the second attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Ceiling for the backoff between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Attempt budget and backoff for retry-eligible failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_attempts(3)
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::with_attempts(1)
    }

    /// `max_attempts` for idempotent commands, a single attempt otherwise.
    pub fn for_command(command: &Command, max_attempts: u32) -> Self {
        if command.is_idempotent() {
            Self::with_attempts(max_attempts)
        } else {
            Self::none()
        }
    }

    /// Delay before attempt number `attempt + 1` (1-based `attempt`).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retry_eligible() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        query = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
