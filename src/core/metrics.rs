//! Process-local pipeline counters.
//!
//! Counters are per hop, not per message. A message that is stored but then
//! fails downstream counts in both `transcripts_persisted` and `consumer_dlq`;
//! a dead letter that could not be published counts in
//! `consumer_dlq_publish_failed` and is requeued instead. Breaker counters
//! separate transitions (`*_breaker_open`) from skipped attempts
//! (`*_short_circuits`). No exporter lives here; callers read a
//! [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-written value
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// All counters shared across publisher, consumer, reprocessor and jobs
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // publisher
    pub transcripts_published: Counter,
    pub publish_failures: Counter,
    pub breaker_open: Counter,
    pub breaker_short_circuits: Counter,
    pub breaker_fallback_persist: Counter,

    // consumer
    pub duplicates_skipped: Counter,
    pub idempotency_fast_path_hits: Counter,
    pub idempotency_db_hits: Counter,
    pub idempotency_memory_hits: Counter,
    pub idempotency_bloom_hints: Counter,
    pub idempotency_errors: Counter,
    pub transcripts_persisted: Counter,
    pub transcripts_persist_failures: Counter,
    pub consumer_failures: Counter,
    pub consumer_dlq: Counter,
    pub consumer_dlq_publish_failed: Counter,
    pub e2e_latency_ms_last: Gauge,
    pub transcription_queue_depth: Gauge,

    // downstream delivery
    pub delivery_clinical_success: Counter,
    pub delivery_legacy_success: Counter,
    pub delivery_failures: Counter,
    pub delivery_breaker_open: Counter,
    pub delivery_breaker_short_circuits: Counter,
    pub delivery_legacy_fallback: Counter,

    // dead-letter reprocessor
    pub reprocessor_attempt: Counter,
    pub reprocessor_success: Counter,
    pub reprocessor_failure: Counter,
    pub reprocessor_permanent_failure: Counter,

    // encryption
    pub encryption_encrypt_failures: Counter,
    pub encryption_decrypt_failures: Counter,
    pub encryption_key_reload: Counter,
    pub encryption_active_keys: Gauge,
    pub encryption_rotate_attempt: Counter,
    pub encryption_rotate_updated: Counter,
    pub encryption_rotate_failures: Counter,

    // retention
    pub transcripts_purged: Counter,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub transcripts_published: u64,
    pub publish_failures: u64,
    pub breaker_open: u64,
    pub breaker_short_circuits: u64,
    pub breaker_fallback_persist: u64,
    pub duplicates_skipped: u64,
    pub idempotency_fast_path_hits: u64,
    pub idempotency_db_hits: u64,
    pub idempotency_memory_hits: u64,
    pub transcripts_persisted: u64,
    pub transcripts_persist_failures: u64,
    pub consumer_failures: u64,
    pub consumer_dlq: u64,
    pub consumer_dlq_publish_failed: u64,
    pub delivery_clinical_success: u64,
    pub delivery_legacy_success: u64,
    pub delivery_failures: u64,
    pub delivery_breaker_open: u64,
    pub delivery_breaker_short_circuits: u64,
    pub delivery_legacy_fallback: u64,
    pub reprocessor_attempt: u64,
    pub reprocessor_success: u64,
    pub reprocessor_failure: u64,
    pub reprocessor_permanent_failure: u64,
    pub encryption_encrypt_failures: u64,
    pub encryption_decrypt_failures: u64,
    pub encryption_rotate_updated: u64,
    pub transcripts_purged: u64,
    pub transcription_queue_depth: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transcripts_published: self.transcripts_published.get(),
            publish_failures: self.publish_failures.get(),
            breaker_open: self.breaker_open.get(),
            breaker_short_circuits: self.breaker_short_circuits.get(),
            breaker_fallback_persist: self.breaker_fallback_persist.get(),
            duplicates_skipped: self.duplicates_skipped.get(),
            idempotency_fast_path_hits: self.idempotency_fast_path_hits.get(),
            idempotency_db_hits: self.idempotency_db_hits.get(),
            idempotency_memory_hits: self.idempotency_memory_hits.get(),
            transcripts_persisted: self.transcripts_persisted.get(),
            transcripts_persist_failures: self.transcripts_persist_failures.get(),
            consumer_failures: self.consumer_failures.get(),
            consumer_dlq: self.consumer_dlq.get(),
            consumer_dlq_publish_failed: self.consumer_dlq_publish_failed.get(),
            delivery_clinical_success: self.delivery_clinical_success.get(),
            delivery_legacy_success: self.delivery_legacy_success.get(),
            delivery_failures: self.delivery_failures.get(),
            delivery_breaker_open: self.delivery_breaker_open.get(),
            delivery_breaker_short_circuits: self.delivery_breaker_short_circuits.get(),
            delivery_legacy_fallback: self.delivery_legacy_fallback.get(),
            reprocessor_attempt: self.reprocessor_attempt.get(),
            reprocessor_success: self.reprocessor_success.get(),
            reprocessor_failure: self.reprocessor_failure.get(),
            reprocessor_permanent_failure: self.reprocessor_permanent_failure.get(),
            encryption_encrypt_failures: self.encryption_encrypt_failures.get(),
            encryption_decrypt_failures: self.encryption_decrypt_failures.get(),
            encryption_rotate_updated: self.encryption_rotate_updated.get(),
            transcripts_purged: self.transcripts_purged.get(),
            transcription_queue_depth: self.transcription_queue_depth.get(),
        }
    }
}
