//! Reconnection accounting and linear-capped backoff.
//!
//! The n-th consecutive failure of an episode waits
//! `min(base_delay * n, max_delay)` before the next open attempt.

use std::time::Duration;

use backoff::backoff::Backoff;

use crate::config::ReconnectConfig;

/// Delay that follows a failure when `attempt_count` failures were already recorded.
#[must_use]
pub fn delay_for(config: &ReconnectConfig, attempt_count: u32) -> Duration {
    config
        .base_delay
        .saturating_mul(attempt_count.saturating_add(1))
        .min(config.max_delay)
}

/// [`Backoff`] implementation producing `base, 2*base, 3*base, ...` capped at `max`.
///
/// Never returns `None`; giving up is decided by [`RetryEngine`] from the attempt count.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl LinearBackoff {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = delay_for(&self.config, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

/// Snapshot of the retry bookkeeping for the current disconnection episode.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive failures in this episode. Reset on a successful connect.
    pub attempt_count: u32,
    /// Normalized reason of the most recent failure.
    pub last_failure_reason: Option<String>,
}

/// Outcome of recording one transient failure.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Attempt number carried by the `reconnecting` event (1-based).
    pub attempt: u32,
    /// How long to wait before the next open.
    pub delay: Duration,
}

/// Retry loop state owned by a single connection episode.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    max_attempts: u32,
    backoff: LinearBackoff,
    state: RetryState,
}

impl RetryEngine {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: LinearBackoff::new(config),
            state: RetryState::default(),
        }
    }

    /// Count a transient failure and compute the wait before the next attempt.
    pub fn record_failure<S: Into<String>>(&mut self, reason: S) -> Retry {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.config.max_delay);
        self.state.attempt_count = self.state.attempt_count.saturating_add(1);
        self.state.last_failure_reason = Some(reason.into());

        Retry {
            attempt: self.state.attempt_count,
            delay,
        }
    }

    /// True once a bounded policy has seen `max_attempts` consecutive failures.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts != 0 && self.state.attempt_count >= self.max_attempts
    }

    /// Called after a successful open.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.state = RetryState::default();
    }

    #[must_use]
    pub fn state(&self) -> &RetryState {
        &self.state
    }
}
