//! Dead-letter queue reprocessor.
//!
//! Takes one message at a time from `<main>_dlq`, waits an exponential,
//! jittered backoff (capped at 60s), stamps `retry_attempts` and republishes to
//! the main queue. Messages past `max_attempts`, bodies that are not JSON
//! objects, and messages the consumer rejected as malformed (`invalid_json`,
//! `missing_fields`) are dropped as permanent failures. The dead-letter delivery is
//! acknowledged exactly once whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::metrics::PipelineMetrics;
use crate::domain::DeadLetterReason;
use crate::ingest::{dead_letter_queue, Broker, BrokerError, Delivery};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessorSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base() -> f64 {
    5.0
}
fn default_max_delay() -> f64 {
    60.0
}

impl Default for ReprocessorSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base(),
            max_delay_seconds: default_max_delay(),
        }
    }
}

/// `base * 2^(attempt-1) * jitter`, capped; `jitter` is expected in `[0.5, 1.0]`
pub fn backoff_delay(settings: &ReprocessorSettings, attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let seconds = settings.backoff_base_seconds * 2f64.powi(exponent) * jitter;
    Duration::from_secs_f64(seconds.clamp(0.0, settings.max_delay_seconds.max(0.0)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprocessOutcome {
    /// Sent back to the main queue
    Republished { attempts: u32 },

    /// Republish failed; returned to the dead-letter queue (best effort)
    Requeued { attempts: u32 },

    /// Dropped for good
    PermanentFailure { reason: String },
}

pub struct DeadLetterReprocessor {
    broker: Arc<dyn Broker>,
    main_queue: String,
    dlq: String,
    settings: ReprocessorSettings,
    metrics: Arc<PipelineMetrics>,
    idle_wait: Duration,
}

impl DeadLetterReprocessor {
    pub fn new(
        broker: Arc<dyn Broker>,
        main_queue: impl Into<String>,
        settings: ReprocessorSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let main_queue = main_queue.into();
        Self {
            dlq: dead_letter_queue(&main_queue),
            broker,
            main_queue,
            settings,
            metrics,
            idle_wait: Duration::from_millis(500),
        }
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub async fn poll_once(&self) -> Result<Option<ReprocessOutcome>, BrokerError> {
        match self.broker.fetch(&self.dlq).await? {
            Some(delivery) => Ok(Some(self.process(delivery).await)),
            None => Ok(None),
        }
    }

    /// Handle one dead-letter delivery and acknowledge it
    pub async fn process(&self, delivery: Delivery) -> ReprocessOutcome {
        let outcome = self.handle(&delivery.body).await;
        if let Err(e) = self.broker.ack(&self.dlq, delivery.tag).await {
            error!(tag = delivery.tag, error = %e, "dead-letter ack failed");
        }
        outcome
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(dlq = %self.dlq, main = %self.main_queue, "reprocessor started");
        while !*shutdown.borrow() {
            match self.poll_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "dead-letter fetch failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.idle_wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("reprocessor stopped");
    }

    async fn handle(&self, body: &[u8]) -> ReprocessOutcome {
        let mut message = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return self.permanent_failure("body is not a JSON object".to_string()),
            Err(e) => {
                warn!(size = body.len(), error = %e, "dropping malformed dead letter");
                return self.permanent_failure(format!("malformed: {}", e));
            }
        };

        let reason = message
            .get("reason")
            .cloned()
            .and_then(|v| serde_json::from_value::<DeadLetterReason>(v).ok());
        if let Some(reason) = reason.filter(|r| !r.is_retryable()) {
            warn!(reason = reason.as_str(), "dropping dead letter rejected as malformed");
            return self.permanent_failure(format!("not retryable: {}", reason.as_str()));
        }

        let previous = message
            .get("retry_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let attempts = u32::try_from(previous).unwrap_or(u32::MAX).saturating_add(1);
        self.metrics.reprocessor_attempt.inc();

        let filename = message
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if attempts > self.settings.max_attempts {
            error!(attempts, filename = %filename, "permanent failure");
            return self.permanent_failure(format!("exceeded {} attempts", self.settings.max_attempts));
        }

        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        let delay = backoff_delay(&self.settings, attempts, jitter);
        tokio::time::sleep(delay).await;

        message.insert("retry_attempts".to_string(), Value::from(attempts));
        let body = match serde_json::to_vec(&Value::Object(message)) {
            Ok(body) => body,
            Err(e) => return self.permanent_failure(format!("re-encode failed: {}", e)),
        };

        match self.broker.publish(&self.main_queue, body.clone()).await {
            Ok(()) => {
                self.metrics.reprocessor_success.inc();
                info!(attempts, filename = %filename, delay_ms = delay.as_millis() as u64, "reprocessed");
                ReprocessOutcome::Republished { attempts }
            }
            Err(e) => {
                self.metrics.reprocessor_failure.inc();
                warn!(attempts, error = %e, "republish failed; returning to dead-letter queue");
                if let Err(e) = self.broker.publish(&self.dlq, body).await {
                    error!(error = %e, "dead-letter requeue failed");
                }
                ReprocessOutcome::Requeued { attempts }
            }
        }
    }

    fn permanent_failure(&self, reason: String) -> ReprocessOutcome {
        self.metrics.reprocessor_permanent_failure.inc();
        ReprocessOutcome::PermanentFailure { reason }
    }
}
