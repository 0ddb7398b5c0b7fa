//! Bounded retry policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `initial * attempt`
    Linear,

    /// `initial * multiplier^(attempt - 1)`
    Exponential,
}

/// Retry policy for one hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier for exponential growth
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    8000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff() -> Backoff {
    Backoff::Exponential
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff: default_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Publisher policy: 3 tries, `0.5s * attempt`, ~1.5s worst case
    pub fn publish() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 1000,
            backoff_multiplier: 1.0,
            backoff: Backoff::Linear,
        }
    }

    /// Downstream delivery policy: 3 tries, exponential from 1s capped at 8s
    pub fn delivery() -> Self {
        Self::default()
    }

    /// Policy with no sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.initial_delay_ms as f64 * attempt as f64,
            Backoff::Exponential => {
                self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32)
            }
        };

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
