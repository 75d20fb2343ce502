//! Retry pacing for a peer that lost its host.

use std::time::Duration;

use rand::Rng;

use crate::ReconnectConfig;

/// Counts reconnection attempts and computes the delay before each one.
#[derive(Debug)]
pub(crate) struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectState {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Advances the attempt counter and returns how long to wait before
    /// that attempt, or `None` once `max_attempts` is used up.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self
            .config
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
        {
            return None;
        }
        self.attempts += 1;

        let base = self.config.interval;
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            // Uniform in [base * (1 - jitter), base * (1 + jitter)].
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            Some(base.mul_f64(factor))
        } else {
            Some(base)
        }
    }

    /// Attempts started so far.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}
