//! Component wiring.
//!
//! Builds the shared pieces (broker, record store, key material, codec) once
//! from [`Settings`] and hands out the pipeline roles built on top of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::adapters::{ClinicalDocumentSink, KeywordEnricher, LegacyRestSink};
use crate::config::{Settings, SettingsKeySource};
use crate::core::{
    CircuitBreaker, Consumer, DeadLetterReprocessor, DownstreamDelivery, FastPathStore,
    GuardedSink, IdempotencyGate, JobScheduler, MemoryFastPath, PipelineMetrics,
};
use crate::crypto::{EnvelopeCodec, KeyMaterialStore, KeyRotationJob, KeySource};
use crate::ingest::{Broker, JsonlBroker, Publisher};
use crate::store::{RecordStore, RetentionJob, TranscriptStore};

/// Shared pipeline components
pub struct App {
    pub settings: Settings,
    pub metrics: Arc<PipelineMetrics>,
    pub broker: Arc<dyn Broker>,
    pub records: Arc<RecordStore>,
    pub keys: Arc<KeyMaterialStore>,
    pub codec: Arc<EnvelopeCodec>,
    pub store: Arc<TranscriptStore>,
}

impl App {
    /// Open the on-disk broker and database described by `settings`
    pub async fn open(settings: Settings) -> Result<Self> {
        std::fs::create_dir_all(&settings.home)
            .with_context(|| format!("Failed to create home: {}", settings.home.display()))?;

        let broker = JsonlBroker::open(&settings.home)
            .await
            .context("Failed to open queue directory")?;
        let records = RecordStore::open(&settings.database)
            .with_context(|| format!("Failed to open database: {}", settings.database.display()))?;

        Self::from_parts(settings, Arc::new(broker), Arc::new(records), Box::new(SettingsKeySource))
    }

    /// Assemble from already opened parts
    pub fn from_parts(
        settings: Settings,
        broker: Arc<dyn Broker>,
        records: Arc<RecordStore>,
        key_source: Box<dyn KeySource>,
    ) -> Result<Self> {
        let metrics = Arc::new(PipelineMetrics::default());
        let keys = Arc::new(
            KeyMaterialStore::load(key_source, settings.key_policy, metrics.clone())
                .context("Encryption keys unusable")?,
        );
        let codec = Arc::new(EnvelopeCodec::new(keys.clone(), metrics.clone()));
        let store = Arc::new(TranscriptStore::new(records.clone(), codec.clone()));

        info!(
            environment = %settings.environment,
            queue = %settings.queue,
            encryption = keys.is_enabled(),
            "pipeline components ready"
        );

        Ok(Self {
            settings,
            metrics,
            broker,
            records,
            keys,
            codec,
            store,
        })
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.broker.clone(),
            self.settings.queue.clone(),
            self.store.clone(),
            CircuitBreaker::new("publish", self.settings.breakers.publish.clone()),
            self.settings.retry.publish.clone(),
            self.metrics.clone(),
        )
    }

    pub fn gate(&self) -> IdempotencyGate {
        let settings = self.settings.idempotency.clone();
        let fast_path: Arc<dyn FastPathStore> = Arc::new(MemoryFastPath::new());
        IdempotencyGate::new(
            settings,
            Some(fast_path),
            Some(self.records.clone()),
            self.metrics.clone(),
        )
    }

    pub fn delivery(&self) -> DownstreamDelivery {
        let clinical = GuardedSink::new(
            Arc::new(ClinicalDocumentSink::new(self.settings.clinical.clone())),
            CircuitBreaker::new("clinical", self.settings.breakers.clinical.clone()),
            self.settings.retry.delivery.clone(),
        );
        let legacy = GuardedSink::new(
            Arc::new(LegacyRestSink::new(self.settings.legacy.clone())),
            CircuitBreaker::new("legacy", self.settings.breakers.legacy.clone()),
            self.settings.retry.delivery.clone(),
        );
        DownstreamDelivery::new(Some(clinical), Some(legacy), self.metrics.clone())
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.broker.clone(),
            self.settings.queue.clone(),
            Arc::new(self.gate()),
            self.store.clone(),
            Arc::new(KeywordEnricher::default()),
            Arc::new(self.delivery()),
            self.metrics.clone(),
        )
    }

    pub fn reprocessor(&self) -> DeadLetterReprocessor {
        DeadLetterReprocessor::new(
            self.broker.clone(),
            self.settings.queue.clone(),
            self.settings.reprocessor.clone(),
            self.metrics.clone(),
        )
    }

    pub fn rotation_job(&self) -> KeyRotationJob {
        KeyRotationJob::new(
            self.records.clone(),
            self.codec.clone(),
            self.metrics.clone(),
            self.settings.encryption.rotation_batch_size,
            self.settings.encryption.rotation_max_batches,
        )
    }

    pub fn retention_job(&self) -> RetentionJob {
        RetentionJob::new(
            self.records.clone(),
            self.settings.retention_days,
            self.metrics.clone(),
        )
    }

    /// Background jobs enabled by the settings
    pub fn jobs(&self, shutdown: watch::Receiver<bool>) -> JobScheduler {
        let mut jobs = JobScheduler::new(shutdown)
            .retention(Arc::new(self.retention_job()))
            .queue_depth(
                self.broker.clone(),
                self.settings.queue.clone(),
                self.metrics.clone(),
                Duration::from_secs(self.settings.queue_depth_poll_secs.max(1)),
            );
        let rotate_hours = self.settings.encryption.rotate_hours;
        if rotate_hours > 0 && self.keys.is_enabled() {
            jobs = jobs.rotation(
                Arc::new(self.rotation_job()),
                Duration::from_secs(rotate_hours * 3600),
            );
        }
        jobs
    }
}
