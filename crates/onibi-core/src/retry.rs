//! Exponential backoff for the tick loop.
//!
//! [`RetryPolicy`] computes jittered delays; [`Backoff`] tracks a run of
//! consecutive failures so the scheduler can report when it degrades and
//! when it recovers. Failures are retried forever: the tail never gives up
//! on its log file.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Multiplier applied after each consecutive failure
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (0.1 = ±10%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
            config.jitter_percent,
        )
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
    ) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // 31 doublings already exceed any sane max_delay
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64 * self.backoff_factor.powi(exp)).min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let range = base_ms * self.jitter_percent;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

/// Run of consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.failures);
        self.failures = self.failures.saturating_add(1);
        debug!(
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            "backing off after failure"
        );
        delay
    }

    /// Record a success. Returns the length of the failure run it ended, if
    /// there was one.
    pub fn record_success(&mut self) -> Option<u32> {
        let failures = std::mem::take(&mut self.failures);
        (failures > 0).then_some(failures)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.failures > 0
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
