//! Retry policy with capped exponential backoff.
//!
//! delay(n) = min(base * multiplier^n, cap), jittered by ±jitter*delay/2.

use courier_shared::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff strategy for failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Proportional jitter, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_interval: config.base_interval,
            multiplier: config.multiplier,
            max_interval: config.max_interval,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `retry_count` failures, without
    /// jitter. Non-decreasing in `retry_count` and capped.
    pub fn raw_delay(&self, retry_count: u32) -> Duration {
        let exp = self.base_interval.as_secs_f64() * self.multiplier.powi(retry_count as i32);
        Duration::from_secs_f64(exp.min(self.max_interval.as_secs_f64()))
    }

    /// Jittered delay for scheduling the next attempt.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.raw_delay(retry_count);
        if self.jitter <= 0.0 {
            return delay;
        }

        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread / 2.0..=spread / 2.0);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// The full jitter-free schedule; useful for logging and tests.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|n| self.raw_delay(n)).collect()
    }
}
