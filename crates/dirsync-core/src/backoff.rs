//! Reconnect backoff
//!
//! Exponential backoff with jitter for the broker and peer connectors. Unlike
//! a bounded retry helper it never gives up: callers loop until stopped.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any delay
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub multiplier: f64,
    /// Jitter factor to randomize delays
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Short delays for tests and local topologies
    pub fn quick() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_delay = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let base_delay = base_delay.min(self.max_delay.as_nanos() as f64);

        let jitter_range = base_delay * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;

        Duration::from_nanos((base_delay + jitter).max(0.0) as u64)
    }
}

/// Consecutive failure counter
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start with no recorded failure
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failure and return how long to wait
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for(self.attempt)
    }

    /// Forget past failures after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let config = no_jitter();
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(4), Duration::from_millis(800));
        assert_eq!(config.delay_for(5), Duration::from_secs(1));
        assert_eq!(config.delay_for(500), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = BackoffConfig::default();
        for _ in 0..100 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_millis(90));
            assert!(delay <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
