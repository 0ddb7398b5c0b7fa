//! Main-queue consumer.
//!
//! Per message: parse, deduplicate, enrich, persist, deliver. Every delivery
//! taken from the broker is acknowledged exactly once, whatever happened while
//! handling it; retry durability belongs to the dead-letter queue and its
//! reprocessor, never to in-process requeueing. The one exception is a
//! dead letter that cannot be published: the delivery is returned to the main
//! queue instead of being acked, so the message is not lost.
//!
//! Messages stamped with `record_id` were already persisted and only failed
//! downstream. They skip the gate and persistence and retry delivery against
//! the stored row.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::delivery::{DeliveryOutcome, DownstreamDelivery};
use super::idempotency::IdempotencyGate;
use super::metrics::PipelineMetrics;
use crate::adapters::{DeliveryDocument, Enricher};
use crate::domain::{
    epoch_seconds, DeadLetterReason, Enrichment, NewTranscript, RawDeadLetter, TranscriptMessage,
};
use crate::ingest::{dead_letter_queue, Broker, BrokerError, Delivery};
use crate::store::TranscriptStore;

/// Terminal result of handling one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Suppressed by the idempotency gate
    Duplicate,

    /// Stored (and delivered, if a path is configured)
    Persisted { id: i64, delivery: DeliveryOutcome },

    /// Retried delivery for an already stored row succeeded
    Redelivered { id: i64, delivery: DeliveryOutcome },

    /// Routed to the dead-letter queue
    DeadLettered {
        reason: DeadLetterReason,
        record_id: Option<i64>,
    },

    /// Acknowledged without further processing
    Dropped { reason: String },

    /// Dead-lettering failed; returned to the main queue unacked
    Requeued { reason: DeadLetterReason },

    /// Dead-lettering failed after the row was stored; the `record_id`-stamped
    /// retry was published straight to the main queue instead
    RetryQueued { record_id: i64 },
}

pub struct Consumer {
    broker: Arc<dyn Broker>,
    queue: String,
    dlq: String,
    gate: Arc<IdempotencyGate>,
    store: Arc<TranscriptStore>,
    enricher: Arc<dyn Enricher>,
    delivery: Arc<DownstreamDelivery>,
    metrics: Arc<PipelineMetrics>,
    idle_wait: Duration,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        gate: Arc<IdempotencyGate>,
        store: Arc<TranscriptStore>,
        enricher: Arc<dyn Enricher>,
        delivery: Arc<DownstreamDelivery>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let queue = queue.into();
        Self {
            dlq: dead_letter_queue(&queue),
            broker,
            queue,
            gate,
            store,
            enricher,
            delivery,
            metrics,
            idle_wait: Duration::from_millis(250),
        }
    }

    /// How long to wait when the queue is empty
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Fetch and handle at most one message; `None` if the queue was empty
    pub async fn poll_once(&self) -> Result<Option<Outcome>, BrokerError> {
        match self.broker.fetch(&self.queue).await? {
            Some(delivery) => Ok(Some(self.process(delivery).await)),
            None => Ok(None),
        }
    }

    /// Handle one delivery and acknowledge it
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        if delivery.redelivered {
            debug!(tag = delivery.tag, "redelivered message");
        }
        let outcome = self.handle(&delivery.body).await;

        if let Outcome::Requeued { reason } = &outcome {
            warn!(tag = delivery.tag, reason = reason.as_str(), "returning delivery to the queue");
            if let Err(e) = self.broker.recover(&self.queue).await {
                error!(tag = delivery.tag, error = %e, "requeue failed");
            }
            return outcome;
        }
        if let Err(e) = self.broker.ack(&self.queue, delivery.tag).await {
            error!(tag = delivery.tag, error = %e, "ack failed");
        }
        outcome
    }

    /// Consume until `shutdown` flips to true; the in-flight message always completes
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue, "consumer started");
        while !*shutdown.borrow() {
            match self.poll_once().await {
                Ok(Some(Outcome::Requeued { .. })) => {}
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "fetch failed"),
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
        info!(queue = %self.queue, "consumer stopped");
    }

    /// Run the state machine for one body (no ack)
    pub async fn handle(&self, body: &[u8]) -> Outcome {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "invalid payload");
                self.metrics.consumer_failures.inc();
                let raw = RawDeadLetter {
                    raw_body: String::from_utf8_lossy(body).into_owned(),
                    reason: DeadLetterReason::InvalidJson,
                };
                return self
                    .dead_letter(serde_json::to_vec(&raw), DeadLetterReason::InvalidJson, None)
                    .await;
            }
        };

        self.observe_latency(&value);

        let message = match serde_json::from_value::<TranscriptMessage>(value.clone()) {
            Ok(message) if !message.filename.is_empty() && !message.text.is_empty() => message,
            _ => {
                error!(filename = ?value.get("filename"), "missing fields");
                self.metrics.consumer_failures.inc();
                return self
                    .dead_letter(
                        tagged(value, DeadLetterReason::MissingFields),
                        DeadLetterReason::MissingFields,
                        None,
                    )
                    .await;
            }
        };

        match message.record_id {
            Some(id) => self.redeliver(message, id).await,
            None => self.ingest(message).await,
        }
    }

    #[instrument(skip(self, message), fields(filename = %message.filename, correlation_id = ?message.correlation_id))]
    async fn ingest(&self, message: TranscriptMessage) -> Outcome {
        let fingerprint = message.fingerprint();
        if self.gate.check(&fingerprint).is_duplicate() {
            self.metrics.duplicates_skipped.inc();
            info!("duplicate skipped");
            return Outcome::Duplicate;
        }

        let enrichment = match self.enricher.extract(&message.text) {
            Ok(enrichment) => enrichment,
            Err(e) => {
                warn!(error = %e, "enrichment failed");
                Enrichment::new()
            }
        };
        let summary = match self.enricher.summarize(&message.text) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "summary failed");
                None
            }
        };

        let transcript = NewTranscript {
            filename: message.filename.clone(),
            text: message.text.clone(),
            summary,
            enrichment: Some(enrichment),
            source: message.source.clone(),
            downstream_document_id: None,
        };

        let id = match self.store.insert(&transcript) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "persistence failed");
                self.metrics.transcripts_persist_failures.inc();
                self.metrics.consumer_failures.inc();
                self.gate.release(&fingerprint);
                let dead = message.dead_lettered(DeadLetterReason::PersistenceFailed);
                return self
                    .dead_letter(dead.to_json(), DeadLetterReason::PersistenceFailed, None)
                    .await;
            }
        };
        self.metrics.transcripts_persisted.inc();

        let document = DeliveryDocument::compose(
            &transcript.filename,
            &transcript.text,
            transcript.summary.as_deref(),
            transcript.enrichment.as_ref(),
        );
        match self.deliver(id, &document).await {
            Some(delivery) => {
                info!(record_id = id, "transcript processed");
                Outcome::Persisted { id, delivery }
            }
            None => self.dead_letter_delivery(message, id).await,
        }
    }

    #[instrument(skip(self, message), fields(filename = %message.filename))]
    async fn redeliver(&self, message: TranscriptMessage, id: i64) -> Outcome {
        let record = match self.store.get_transcript(id) {
            Ok(Some(record)) if record.is_fully_readable() => record,
            Ok(Some(record)) => {
                error!(record_id = id, sealed = ?record.sealed_fields, "stored transcript unreadable");
                self.metrics.consumer_failures.inc();
                return Outcome::Dropped {
                    reason: format!("record {} has sealed fields", id),
                };
            }
            Ok(None) => {
                warn!(record_id = id, "stored transcript no longer exists");
                self.metrics.consumer_failures.inc();
                return Outcome::Dropped {
                    reason: format!("record {} not found", id),
                };
            }
            Err(e) => {
                error!(record_id = id, error = %e, "failed to load stored transcript");
                self.metrics.consumer_failures.inc();
                return self.dead_letter_delivery(message, id).await;
            }
        };

        let document = DeliveryDocument::compose(
            &record.filename,
            &record.text,
            record.summary.as_deref(),
            record.enrichment.as_ref(),
        );
        match self.deliver(id, &document).await {
            Some(delivery) => Outcome::Redelivered { id, delivery },
            None => self.dead_letter_delivery(message, id).await,
        }
    }

    async fn deliver(&self, id: i64, document: &DeliveryDocument) -> Option<DeliveryOutcome> {
        match self.delivery.deliver(document).await {
            Ok(delivery) => {
                if let Some(document_id) = delivery.document_id() {
                    if let Err(e) = self.store.set_downstream_document_id(id, document_id) {
                        warn!(record_id = id, error = %e, "failed to record downstream document id");
                    }
                }
                Some(delivery)
            }
            Err(e) => {
                error!(record_id = id, error = %e, "downstream delivery failed");
                None
            }
        }
    }

    async fn dead_letter_delivery(&self, message: TranscriptMessage, id: i64) -> Outcome {
        let mut dead = message.dead_lettered(DeadLetterReason::DownstreamFailed);
        dead.record_id = Some(id);
        let body = match dead.to_json() {
            Ok(body) => body,
            Err(e) => {
                return self
                    .dead_letter(Err(e), DeadLetterReason::DownstreamFailed, Some(id))
                    .await
            }
        };
        let outcome = self
            .dead_letter(Ok(body.clone()), DeadLetterReason::DownstreamFailed, Some(id))
            .await;
        if !matches!(outcome, Outcome::Requeued { .. }) {
            return outcome;
        }

        // Redelivering the unstamped original would be suppressed by the gate
        match self.broker.publish(&self.queue, body).await {
            Ok(()) => {
                warn!(record_id = id, "dead-letter queue unavailable; delivery retry queued directly");
                Outcome::RetryQueued { record_id: id }
            }
            Err(e) => {
                error!(record_id = id, error = %e, "delivery retry could not be queued");
                outcome
            }
        }
    }

    /// Publish to the dead-letter queue; `Requeued` when that fails
    async fn dead_letter(
        &self,
        body: Result<Vec<u8>, serde_json::Error>,
        reason: DeadLetterReason,
        record_id: Option<i64>,
    ) -> Outcome {
        let published = match body {
            Ok(body) => self.broker.publish(&self.dlq, body).await.map_err(|e| e.to_string()),
            Err(e) => Err(format!("encode failed: {}", e)),
        };
        match published {
            Ok(()) => {
                self.metrics.consumer_dlq.inc();
                Outcome::DeadLettered { reason, record_id }
            }
            Err(e) => {
                self.metrics.consumer_dlq_publish_failed.inc();
                error!(queue = %self.dlq, reason = reason.as_str(), error = %e, "dead-letter publish failed");
                Outcome::Requeued { reason }
            }
        }
    }

    fn observe_latency(&self, value: &Value) {
        let Some(published) = value.get("publish_time").and_then(Value::as_f64) else {
            return;
        };
        if published <= 0.0 {
            return;
        }
        let latency_ms = ((epoch_seconds() - published).max(0.0) * 1000.0) as u64;
        self.metrics.e2e_latency_ms_last.set(latency_ms);
        debug!(latency_ms, "end-to-end latency");
    }
}

/// Add a `reason` tag to a JSON object body (non-objects are wrapped)
fn tagged(value: Value, reason: DeadLetterReason) -> Result<Vec<u8>, serde_json::Error> {
    let mut object = match value {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("raw_body".to_string(), Value::String(other.to_string()));
            map
        }
    };
    object.insert("reason".to_string(), Value::String(reason.as_str().to_string()));
    serde_json::to_vec(&Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_keeps_fields() {
        let body = tagged(serde_json::json!({"filename": "a.wav"}), DeadLetterReason::MissingFields).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["filename"], "a.wav");
        assert_eq!(value["reason"], "missing_fields");
    }

    #[test]
    fn test_tagged_wraps_non_objects() {
        let body = tagged(serde_json::json!([1, 2]), DeadLetterReason::MissingFields).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["raw_body"], "[1,2]");
    }
}
