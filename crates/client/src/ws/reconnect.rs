//! Reconnect backoff policy.

use std::time::Duration;

use rand::Rng;

/// Configuration for auto-reconnect behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// Delay before the first reconnect, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the un-jittered delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: u64,
    /// Upper bound of the random delay added on top. 0 disables jitter.
    pub jitter_ms: u64,
}

impl ReconnectPolicy {
    /// Policy for the realtime socket: 3s, 6s, 12s, then 12s.
    pub fn realtime() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 3_000,
            max_delay_ms: 12_000,
            backoff_multiplier: 2,
            jitter_ms: 500,
        }
    }

    /// Slower policy for re-attempting realtime while already degraded to polling.
    pub fn degraded() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 5_000,
            max_delay_ms: 20_000,
            backoff_multiplier: 2,
            jitter_ms: 500,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ms = 0;
        self
    }

    /// Delay for a given attempt number, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay for a given attempt number, jitter included.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    pub fn give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::realtime()
    }
}

/// Reconnect bookkeeping for the current logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub count: u32,
    pub next_delay: Duration,
}

impl ReconnectAttempt {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            count: 0,
            next_delay: policy.base_delay(0),
        }
    }

    pub fn reset(&mut self, policy: &ReconnectPolicy) {
        *self = Self::new(policy);
    }
}
