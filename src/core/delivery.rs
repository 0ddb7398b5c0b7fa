//! Dual-path downstream delivery.
//!
//! The clinical-document path is tried first when it is configured. Each of its
//! attempts counts against its own breaker; once the breaker opens, remaining
//! attempts are skipped and the legacy path is used. The legacy path has an
//! independent breaker and retry policy. If no path succeeds the caller
//! dead-letters the message.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use super::breaker::{CircuitBreaker, FailureTransition};
use super::metrics::PipelineMetrics;
use super::retry::RetryPolicy;
use crate::adapters::{DeliveryDocument, DeliveryReceipt, DownstreamSink, SinkError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Breaker '{0}' is open")]
    BreakerOpen(&'static str),

    #[error("{sink} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        sink: String,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("All downstream paths failed (clinical: {clinical}; legacy: {legacy})")]
    AllPathsFailed { clinical: String, legacy: String },
}

/// Which path accepted the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Clinical(DeliveryReceipt),
    Legacy(DeliveryReceipt),

    /// No downstream path configured; the transcript is only persisted
    NotConfigured,
}

impl DeliveryOutcome {
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Clinical(receipt) | Self::Legacy(receipt) => receipt.document_id.as_deref(),
            Self::NotConfigured => None,
        }
    }
}

/// One guarded downstream path
pub struct GuardedSink {
    sink: Arc<dyn DownstreamSink>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl GuardedSink {
    pub fn new(sink: Arc<dyn DownstreamSink>, breaker: CircuitBreaker, retry: RetryPolicy) -> Self {
        Self {
            sink,
            breaker,
            retry,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn is_configured(&self) -> bool {
        self.sink.is_configured()
    }

    async fn attempt(
        &self,
        document: &DeliveryDocument,
        metrics: &PipelineMetrics,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if self.breaker.is_open() {
            metrics.delivery_breaker_short_circuits.inc();
            return Err(DeliveryError::BreakerOpen(self.breaker.name()));
        }

        let mut attempt = 1;
        loop {
            match self.sink.deliver(document).await {
                Ok(receipt) => {
                    self.breaker.record_success();
                    return Ok(receipt);
                }
                Err(e) => {
                    warn!(sink = self.sink.name(), attempt, error = %e, "delivery attempt failed");
                    let opened = self.breaker.record_failure() == FailureTransition::Opened;
                    if opened {
                        metrics.delivery_breaker_open.inc();
                    }
                    if opened || !self.retry.should_retry(attempt) {
                        return Err(DeliveryError::Exhausted {
                            sink: self.sink.name().to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub struct DownstreamDelivery {
    clinical: Option<GuardedSink>,
    legacy: Option<GuardedSink>,
    metrics: Arc<PipelineMetrics>,
}

impl DownstreamDelivery {
    pub fn new(
        clinical: Option<GuardedSink>,
        legacy: Option<GuardedSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            clinical: clinical.filter(GuardedSink::is_configured),
            legacy: legacy.filter(GuardedSink::is_configured),
            metrics,
        }
    }

    /// No downstream paths at all
    pub fn none(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            clinical: None,
            legacy: None,
            metrics,
        }
    }

    pub fn clinical(&self) -> Option<&GuardedSink> {
        self.clinical.as_ref()
    }

    pub fn legacy(&self) -> Option<&GuardedSink> {
        self.legacy.as_ref()
    }

    #[instrument(skip(self, document), fields(filename = %document.filename))]
    pub async fn deliver(&self, document: &DeliveryDocument) -> Result<DeliveryOutcome, DeliveryError> {
        if self.clinical.is_none() && self.legacy.is_none() {
            return Ok(DeliveryOutcome::NotConfigured);
        }

        let mut clinical_error = "not configured".to_string();
        if let Some(clinical) = &self.clinical {
            match clinical.attempt(document, &self.metrics).await {
                Ok(receipt) => {
                    self.metrics.delivery_clinical_success.inc();
                    info!(document_id = ?receipt.document_id, "delivered to clinical document API");
                    return Ok(DeliveryOutcome::Clinical(receipt));
                }
                Err(e) => {
                    clinical_error = e.to_string();
                    if self.legacy.is_some() {
                        self.metrics.delivery_legacy_fallback.inc();
                        warn!(error = %e, "clinical path failed; falling back to legacy API");
                    }
                }
            }
        }

        let legacy_error = match &self.legacy {
            Some(legacy) => match legacy.attempt(document, &self.metrics).await {
                Ok(receipt) => {
                    self.metrics.delivery_legacy_success.inc();
                    info!("delivered to legacy API");
                    return Ok(DeliveryOutcome::Legacy(receipt));
                }
                Err(e) => e.to_string(),
            },
            None => "not configured".to_string(),
        };

        self.metrics.delivery_failures.inc();
        Err(DeliveryError::AllPathsFailed {
            clinical: clinical_error,
            legacy: legacy_error,
        })
    }
}
