//! Queue payloads.
//!
//! The main queue carries `{filename, text, source, publish_time, correlation_id?}`.
//! The dead-letter queue carries the same shape plus `retry_attempts` and a
//! `reason` tag. Messages are immutable once published; their identity is the
//! content [`Fingerprint`], never a message id.

use serde::{Deserialize, Deserializer, Serialize};

use super::fingerprint::Fingerprint;

/// Source tag for messages published by the ingress component
pub const SOURCE_API: &str = "api";

/// Source tag for rows written directly when the queue is unavailable
pub const SOURCE_FALLBACK: &str = "fallback";

/// A transcript in flight between publisher and consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub filename: String,

    pub text: String,

    #[serde(default = "default_source", deserialize_with = "source_or_default")]
    pub source: String,

    /// Epoch seconds at publish time
    #[serde(default)]
    pub publish_time: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Dead-letter attempt counter (only present on reinjected messages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,

    /// Why the message was dead-lettered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeadLetterReason>,

    /// Row already persisted for this message; set when only delivery failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
}

fn default_source() -> String {
    SOURCE_API.to_string()
}

/// An explicit `null` source means the default, not a malformed message
fn source_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_source))
}

impl TranscriptMessage {
    /// Create a fresh message stamped with the current time
    pub fn new(filename: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            text: text.into(),
            source: default_source(),
            publish_time: epoch_seconds(),
            correlation_id: None,
            retry_attempts: None,
            reason: None,
            record_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Content identity of this message
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(&self.filename, &self.text)
    }

    /// Copy of this message tagged for the dead-letter queue
    pub fn dead_lettered(&self, reason: DeadLetterReason) -> Self {
        let mut copy = self.clone();
        copy.reason = Some(reason);
        copy
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Reason tags attached to dead-lettered messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Body was not valid JSON
    InvalidJson,

    /// `filename` or `text` missing or empty
    MissingFields,

    /// Record Store write failed
    PersistenceFailed,

    /// Every downstream path failed
    DownstreamFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::MissingFields => "missing_fields",
            Self::PersistenceFailed => "persistence_failed",
            Self::DownstreamFailed => "downstream_failed",
        }
    }

    /// Malformed input is never sent back through the pipeline
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceFailed | Self::DownstreamFailed)
    }
}

/// Dead-letter envelope for bodies that could not be parsed at all
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDeadLetter {
    pub raw_body: String,
    pub reason: DeadLetterReason,
}

/// Current wall-clock time in epoch seconds
pub fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
