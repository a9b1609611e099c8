//! Retry utilities with exponential backoff.
//!
//! Used for store writes issued from background loops (heartbeats,
//! terminal-result writes) where a flaky database connection must not
//! turn into a lost result.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Retry attempts after the initial one
    pub max_retries: u32,
    /// First retry delay; doubles each attempt
    pub base_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Run an async operation under a backoff policy, returning the last
/// error once retries are exhausted.
pub async fn with_backoff<F, Fut, T, E>(policy: &Backoff, operation: &str, op: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Consecutive-failure tracker for long-running loops.
///
/// Heartbeat and pickup loops run forever; after a few consecutive
/// failures further identical log lines are noise, so the tracker tells
/// the caller when to go quiet and logs the recovery.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive: u32,
    log_budget: u32,
}

impl FailureTracker {
    pub fn new(log_budget: u32) -> Self {
        Self {
            consecutive: 0,
            log_budget,
        }
    }

    /// Record success; logs recovery if failures were being suppressed.
    pub fn success(&mut self) {
        if self.consecutive > self.log_budget {
            debug!(
                "Operation recovered after {} consecutive failures",
                self.consecutive
            );
        }
        self.consecutive = 0;
    }

    /// Record a failure. Returns `true` while the failure should still be
    /// logged.
    pub fn failure(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive == self.log_budget + 1 {
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.log_budget
            );
        }
        self.consecutive <= self.log_budget
    }

    pub fn count(&self) -> u32 {
        self.consecutive
    }
}
