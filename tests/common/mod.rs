//! Shared test doubles and builders for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use scribeflow::adapters::{
    DeliveryDocument, DeliveryReceipt, DownstreamSink, Enricher, KeywordEnricher, SinkError,
};
use scribeflow::core::{
    BreakerConfig, CircuitBreaker, Consumer, DownstreamDelivery, FastPathStore, GuardedSink,
    IdempotencyGate, IdempotencySettings, MemoryFastPath, PipelineMetrics, RetryPolicy,
};
use scribeflow::crypto::{EncryptionSettings, EnvelopeCodec, KeyMaterialStore, KeyPolicy, KEY_LEN};
use scribeflow::ingest::{Broker, BrokerError, Delivery, DeliveryTag, MemoryBroker};
use scribeflow::store::{RecordStore, TranscriptStore};

pub const QUEUE: &str = "transcriptions";
pub const DLQ: &str = "transcriptions_dlq";

/// Memory broker whose publishes can be made to fail per queue
#[derive(Default)]
pub struct FlakyBroker {
    pub inner: MemoryBroker,
    failures: Mutex<HashMap<String, u32>>,
    publish_calls: Mutex<HashMap<String, u32>>,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes to `queue` (`u32::MAX` = always)
    pub fn fail_publishes(&self, queue: &str, n: u32) {
        self.failures.lock().unwrap().insert(queue.to_string(), n);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn publish_calls(&self, queue: &str) -> u32 {
        self.publish_calls.lock().unwrap().get(queue).copied().unwrap_or(0)
    }

    /// Bodies waiting on `queue`, parsed as JSON
    pub fn messages(&self, queue: &str) -> Vec<serde_json::Value> {
        self.inner
            .peek_all(queue)
            .iter()
            .map(|body| serde_json::from_slice(body).unwrap())
            .collect()
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        *self
            .publish_calls
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default() += 1;

        let should_fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(queue) {
                Some(0) | None => false,
                Some(n) if *n == u32::MAX => true,
                Some(n) => {
                    *n -= 1;
                    true
                }
            }
        };
        if should_fail {
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        self.inner.publish(queue, body).await
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.inner.fetch(queue).await
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.ack(queue, tag).await
    }

    async fn depth(&self, queue: &str) -> Result<u64, BrokerError> {
        self.inner.depth(queue).await
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        self.inner.recover(queue).await
    }
}

/// Sink that accepts everything and remembers it
pub struct RecordingSink {
    name: &'static str,
    document_id: Option<String>,
    pub delivered: Mutex<Vec<DeliveryDocument>>,
}

impl RecordingSink {
    pub fn new(name: &'static str, document_id: Option<&str>) -> Self {
        Self {
            name,
            document_id: document_id.map(str::to_string),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl DownstreamSink for RecordingSink {
    fn name(&self) -> &str {
        self.name
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn deliver(&self, document: &DeliveryDocument) -> Result<DeliveryReceipt, SinkError> {
        self.delivered.lock().unwrap().push(document.clone());
        Ok(DeliveryReceipt {
            document_id: self.document_id.clone(),
        })
    }
}

/// Sink that always answers 503
pub struct FailingSink {
    name: &'static str,
    calls: AtomicU32,
}

impl FailingSink {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownstreamSink for FailingSink {
    fn name(&self) -> &str {
        self.name
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn deliver(&self, _document: &DeliveryDocument) -> Result<DeliveryReceipt, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Status {
            status: 503,
            body: "unavailable".into(),
        })
    }
}

/// Sink that fails until told otherwise
pub struct SwitchSink {
    pub healthy: std::sync::atomic::AtomicBool,
    pub inner: RecordingSink,
}

impl SwitchSink {
    pub fn broken(document_id: &str) -> Self {
        Self {
            healthy: std::sync::atomic::AtomicBool::new(false),
            inner: RecordingSink::new("switch", Some(document_id)),
        }
    }

    pub fn heal(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DownstreamSink for SwitchSink {
    fn name(&self) -> &str {
        "switch"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn deliver(&self, document: &DeliveryDocument) -> Result<DeliveryReceipt, SinkError> {
        if self.healthy.load(Ordering::SeqCst) {
            self.inner.deliver(document).await
        } else {
            Err(SinkError::Status {
                status: 502,
                body: "bad gateway".into(),
            })
        }
    }
}

pub fn b64_key(byte: u8) -> String {
    STANDARD.encode([byte; KEY_LEN])
}

pub fn encryption(primary: &str, keys: &[(&str, u8)]) -> EncryptionSettings {
    EncryptionSettings {
        enabled: true,
        keys: keys
            .iter()
            .map(|(kid, byte)| (kid.to_string(), b64_key(*byte)))
            .collect(),
        primary_key_id: Some(primary.to_string()),
        ..Default::default()
    }
}

/// In-memory pipeline state shared by one test
pub struct Harness {
    pub metrics: Arc<PipelineMetrics>,
    pub broker: Arc<FlakyBroker>,
    pub records: Arc<RecordStore>,
    pub codec: Arc<EnvelopeCodec>,
    pub store: Arc<TranscriptStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_records(Arc::new(RecordStore::open_in_memory().unwrap()), None)
    }

    pub fn encrypted(settings: EncryptionSettings) -> Self {
        Self::with_records(Arc::new(RecordStore::open_in_memory().unwrap()), Some(settings))
    }

    pub fn with_records(records: Arc<RecordStore>, encryption: Option<EncryptionSettings>) -> Self {
        let metrics = Arc::new(PipelineMetrics::default());
        let keys = match encryption {
            Some(settings) => {
                KeyMaterialStore::load(Box::new(settings), KeyPolicy::Strict, metrics.clone()).unwrap()
            }
            None => KeyMaterialStore::disabled(metrics.clone()),
        };
        let codec = Arc::new(EnvelopeCodec::new(Arc::new(keys), metrics.clone()));
        let store = Arc::new(TranscriptStore::new(records.clone(), codec.clone()));
        Self {
            metrics,
            broker: Arc::new(FlakyBroker::new()),
            records,
            codec,
            store,
        }
    }

    pub fn gate(&self, settings: IdempotencySettings) -> Arc<IdempotencyGate> {
        let fast_path: Arc<dyn FastPathStore> = Arc::new(MemoryFastPath::new());
        Arc::new(IdempotencyGate::new(
            settings,
            Some(fast_path),
            Some(self.records.clone()),
            self.metrics.clone(),
        ))
    }

    pub fn consumer(&self, gate: Arc<IdempotencyGate>, delivery: DownstreamDelivery) -> Consumer {
        let enricher: Arc<dyn Enricher> = Arc::new(KeywordEnricher::default());
        Consumer::new(
            self.broker.clone(),
            QUEUE,
            gate,
            self.store.clone(),
            enricher,
            Arc::new(delivery),
            self.metrics.clone(),
        )
    }

    /// Consumer with the default gate and no downstream paths
    pub fn plain_consumer(&self) -> Consumer {
        self.consumer(
            self.gate(IdempotencySettings::default()),
            DownstreamDelivery::none(self.metrics.clone()),
        )
    }

    pub async fn enqueue(&self, body: &serde_json::Value) {
        self.broker
            .inner
            .publish(QUEUE, serde_json::to_vec(body).unwrap())
            .await
            .unwrap();
    }
}

/// Guarded sink with no retry sleeps
pub fn guarded(
    name: &'static str,
    sink: Arc<dyn DownstreamSink>,
    failure_threshold: u32,
    attempts: u32,
) -> GuardedSink {
    GuardedSink::new(
        sink,
        CircuitBreaker::new(
            name,
            BreakerConfig {
                failure_threshold,
                reset_seconds: 60,
            },
        ),
        RetryPolicy::immediate(attempts),
    )
}
