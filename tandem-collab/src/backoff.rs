//! Reconnect delays for the relay connection and peer dialing.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff, capped, with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Add up to 10% random extra delay so peers don't retry in lockstep.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Bounded policy used for dialing a peer.
    pub fn bounded(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..Self::default()
        }
    }

    pub fn with_initial(mut self, delay: Duration) -> Self {
        self.initial = delay;
        self
    }

    pub fn with_max(mut self, delay: Duration) -> Self {
        self.max = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// attempts are used up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }

        let factor = 2u32.saturating_pow(attempt.min(31));
        let base = self.initial.checked_mul(factor).unwrap_or(self.max).min(self.max);
        let delay = if self.jitter {
            let jitter = (base.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
            base + Duration::from_millis(jitter)
        } else {
            base
        };
        Some(delay.min(self.max))
    }
}
