//! Publish side of the pipeline.
//!
//! `publish` tries the queue a bounded number of times (linear backoff,
//! ~1.5s worst case) unless the publish breaker is open, then falls back to a
//! direct Record Store write tagged `source = "fallback"`. It only fails when
//! both paths fail, or when the publisher is draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::broker::{Broker, BrokerError};
use crate::core::breaker::{CircuitBreaker, FailureTransition};
use crate::core::metrics::PipelineMetrics;
use crate::core::retry::RetryPolicy;
use crate::domain::{NewTranscript, TranscriptMessage, SOURCE_FALLBACK};
use crate::store::{StoreError, TranscriptStore};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publisher is draining; not accepting new transcripts")]
    Draining,

    #[error("Invalid transcript: {0}")]
    Invalid(String),

    #[error("Queue unavailable and fallback persistence failed: {fallback}")]
    QueueUnavailable {
        #[source]
        fallback: StoreError,
        queue_error: Option<String>,
    },
}

/// Where a published transcript ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Accepted by the queue
    Queued,

    /// Written directly to the Record Store
    FallbackPersisted { id: i64 },
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    queue: String,
    store: Arc<TranscriptStore>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
    draining: AtomicBool,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        store: Arc<TranscriptStore>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            store,
            breaker,
            retry,
            metrics,
            draining: AtomicBool::new(false),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Stop accepting new transcripts
    pub fn begin_drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!(queue = %self.queue, "publisher draining");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, text), fields(queue = %self.queue))]
    pub async fn publish(
        &self,
        filename: &str,
        text: &str,
        correlation_id: Option<String>,
    ) -> Result<PublishOutcome, PublishError> {
        if self.is_draining() {
            return Err(PublishError::Draining);
        }
        if filename.trim().is_empty() || text.is_empty() {
            return Err(PublishError::Invalid("filename and text are required".into()));
        }

        let message = TranscriptMessage::new(filename, text).with_correlation_id(correlation_id);

        if self.breaker.is_open() {
            self.metrics.breaker_short_circuits.inc();
            warn!("publish breaker open; persisting directly");
            return self.fallback(&message, None);
        }

        let body = match message.to_json() {
            Ok(body) => body,
            Err(e) => return Err(PublishError::Invalid(e.to_string())),
        };

        let mut last_error: Option<BrokerError> = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.broker.publish(&self.queue, body.clone()).await {
                Ok(()) => {
                    self.breaker.record_success();
                    self.metrics.transcripts_published.inc();
                    return Ok(PublishOutcome::Queued);
                }
                Err(e) => {
                    self.metrics.publish_failures.inc();
                    warn!(attempt, error = %e, "publish attempt failed");
                    last_error = Some(e);
                    if self.retry.should_retry(attempt) {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        if self.breaker.record_failure() == FailureTransition::Opened {
            self.metrics.breaker_open.inc();
        }
        self.fallback(&message, last_error)
    }

    fn fallback(
        &self,
        message: &TranscriptMessage,
        queue_error: Option<BrokerError>,
    ) -> Result<PublishOutcome, PublishError> {
        let transcript = NewTranscript {
            filename: message.filename.clone(),
            text: message.text.clone(),
            source: SOURCE_FALLBACK.to_string(),
            ..Default::default()
        };

        match self.store.insert(&transcript) {
            Ok(id) => {
                self.metrics.breaker_fallback_persist.inc();
                info!(id, "transcript persisted via fallback");
                Ok(PublishOutcome::FallbackPersisted { id })
            }
            Err(e) => {
                error!(error = %e, "fallback persistence failed");
                Err(PublishError::QueueUnavailable {
                    fallback: e,
                    queue_error: queue_error.map(|e| e.to_string()),
                })
            }
        }
    }
}
