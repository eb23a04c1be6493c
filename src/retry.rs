//! Retry budget and backoff interval bookkeeping.

use crate::SyncConfig;
use std::time::Duration;

/// Attempt-budget accounting for transient failures.
///
/// The scheduler only does the arithmetic; the engine owns the actual timer
/// task and consults [`RetryScheduler::has_attempt_left`] before arming it.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    attempts: u32,
}

impl RetryScheduler {
    /// New scheduler with a clean budget
    pub fn new() -> Self {
        Self::default()
    }

    /// Failures recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one transient failure
    pub fn record_failure(&mut self) {
        self.attempts += 1;
    }

    /// Whether another automatic restart is allowed
    pub fn has_attempt_left(&self, config: &SyncConfig) -> bool {
        self.attempts < config.retries
    }

    /// Clear the budget; called on a clean cycle or explicit
    /// `start(retry: true)`
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Interval to wait before the next automatic attempt: the jittered poll
    /// interval, capped by the configured backoff ceiling.
    pub fn backoff_interval(&self, config: &SyncConfig) -> Duration {
        config.block_poll_interval().min(config.max_backoff_interval)
    }
}
