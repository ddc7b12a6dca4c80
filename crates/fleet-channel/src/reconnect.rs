//! Reconnection logic with exponential backoff and jitter

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Fraction of each delay that is randomized away (0.0 = none)
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Reconnection manager with exponential backoff
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay to use for the next attempt, advancing the backoff
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let cut = rand::thread_rng().gen_range(0.0..=jitter);
            self.current_backoff.mul_f64(1.0 - cut)
        } else {
            self.current_backoff
        };

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        delay
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
