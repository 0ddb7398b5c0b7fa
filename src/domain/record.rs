//! Durable transcript rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::field::StoredField;

/// Enrichment output: flat JSON object (entity lists, scalar notes)
pub type Enrichment = Map<String, Value>;

/// Input to a Record Store insert (plaintext; the store envelopes it)
#[derive(Debug, Clone, Default)]
pub struct NewTranscript {
    pub filename: String,
    pub text: String,
    pub summary: Option<String>,
    pub enrichment: Option<Enrichment>,
    pub source: String,
    pub downstream_document_id: Option<String>,
}

/// A row exactly as stored (fields still enveloped)
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: i64,
    pub filename: String,
    pub text: StoredField,
    pub summary: Option<StoredField>,
    pub enrichment: Option<Enrichment>,
    pub source: String,
    pub downstream_document_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A decrypted transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: i64,
    pub filename: String,
    pub text: String,
    pub summary: Option<String>,
    pub enrichment: Option<Enrichment>,
    pub source: String,
    pub downstream_document_id: Option<String>,
    pub created_at: DateTime<Utc>,

    /// Names of fields whose key was unavailable; they hold ciphertext
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sealed_fields: Vec<String>,
}

impl TranscriptRecord {
    /// True when every field decrypted (or was plaintext)
    pub fn is_fully_readable(&self) -> bool {
        self.sealed_fields.is_empty()
    }
}
