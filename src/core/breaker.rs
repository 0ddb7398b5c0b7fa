//! Consecutive-failure circuit breaker.
//!
//! One breaker guards one hop (publish to queue, clinical-document delivery,
//! legacy delivery); breakers never share state. The state machine is:
//!
//! - closed -> open when `consecutive_failures >= threshold`
//! - open -> closed implicitly once `now >= open_until` and the next attempt succeeds
//! - any success resets `consecutive_failures` to 0
//!
//! A failure after the cool-down re-opens immediately, because the counter is
//! still at or above the threshold.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open, in seconds
    #[serde(default = "default_reset_seconds")]
    pub reset_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_seconds() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_seconds: default_reset_seconds(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_seconds)
    }
}

/// Transition on a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    /// Counter incremented, still closed
    Counted,

    /// This failure opened the breaker
    Opened,
}

/// Plain breaker state with pure transition functions
#[derive(Debug, Clone, Default)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub open_until: Option<Instant>,
}

impl BreakerState {
    /// Whether attempts are currently short-circuited
    pub fn is_open_at(&self, now: Instant) -> bool {
        matches!(self.open_until, Some(until) if now < until)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    pub fn record_failure_at(&mut self, now: Instant, config: &BreakerConfig) -> FailureTransition {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= config.failure_threshold {
            self.open_until = Some(now + config.reset_timeout());
            FailureTransition::Opened
        } else {
            FailureTransition::Counted
        }
    }
}

/// Thread-safe breaker owned by one delivery path
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        self.lock().is_open_at(now)
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.consecutive_failures > 0 {
            tracing::info!(breaker = self.name, "breaker closed");
        }
        state.record_success();
    }

    pub fn record_failure(&self) -> FailureTransition {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> FailureTransition {
        let mut state = self.lock();
        let transition = state.record_failure_at(now, &self.config);
        if transition == FailureTransition::Opened {
            tracing::warn!(
                breaker = self.name,
                failures = state.consecutive_failures,
                reset_seconds = self.config.reset_seconds,
                "breaker opened"
            );
        }
        transition
    }

    /// Copy of the current state (for status output and tests)
    pub fn state(&self) -> BreakerState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // State is plain data; a panic mid-update cannot leave it torn.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
