//! Adapter interfaces for external systems.
//!
//! Downstream record systems sit behind [`DownstreamSink`]; enrichment
//! (entity extraction, summarization) sits behind [`Enricher`].

pub mod enrichment;
pub mod fhir;
pub mod legacy;

use async_trait::async_trait;
use thiserror::Error;

pub use enrichment::{Enricher, KeywordEnricher};
pub use fhir::{ClinicalDocumentSettings, ClinicalDocumentSink, GrantType};
pub use legacy::{LegacyRestSettings, LegacyRestSink};

/// Errors from a downstream sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Downstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Sink not configured: {0}")]
    NotConfigured(&'static str),
}

/// What gets sent downstream: the transcript with summary and enrichment folded in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryDocument {
    pub filename: String,
    pub body: String,
}

impl DeliveryDocument {
    /// Compose `text`, `SUMMARY:` and `ENRICHMENT:` sections
    pub fn compose(
        filename: &str,
        text: &str,
        summary: Option<&str>,
        enrichment: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Self {
        let mut body = text.to_string();
        if let Some(summary) = summary.filter(|s| !s.is_empty()) {
            body.push_str("\n\nSUMMARY:\n");
            body.push_str(summary);
        }
        if let Some(enrichment) = enrichment.filter(|e| !e.is_empty()) {
            body.push_str("\n\nENRICHMENT:\n");
            body.push_str(
                &serde_json::to_string_pretty(enrichment).unwrap_or_else(|_| "{}".to_string()),
            );
        }
        Self {
            filename: filename.to_string(),
            body,
        }
    }
}

/// Acknowledgment from the downstream system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Downstream document id, when the system returns one
    pub document_id: Option<String>,
}

/// A downstream clinical record system
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    /// Human-readable sink name
    fn name(&self) -> &str;

    /// Whether enough configuration is present to attempt delivery
    fn is_configured(&self) -> bool;

    async fn deliver(&self, document: &DeliveryDocument) -> Result<DeliveryReceipt, SinkError>;
}
