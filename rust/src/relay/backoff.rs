//! Reconnect scheduling

use std::time::Duration;

use crate::options::PoolOptions;

/// What to do after a connection failed or closed unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`. `attempt` counts from 1.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; stay disconnected until re-armed.
    GiveUp,
}

/// Capped exponential backoff with a bounded number of attempts.
///
/// Pure state: the connection task owns one and asks it for a decision on
/// every failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_options(options: &PoolOptions) -> Self {
        Self::new(
            options.reconnect_base_delay(),
            options.reconnect_max_delay(),
            options.max_reconnect_attempts,
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.is_exhausted() {
            return ReconnectDecision::GiveUp;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// Called when re-armed by hand or after a session outlived the
    /// stability window. Reaching `Connected` alone does not reset.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_options(&PoolOptions::default())
    }
}
