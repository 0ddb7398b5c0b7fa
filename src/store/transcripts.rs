//! Codec-aware transcript storage.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use super::{EncodedTranscript, RecordStore, StoreError};
use crate::crypto::{EnvelopeCodec, Opened};
use crate::domain::{NewTranscript, TranscriptRecord};

/// Seals fields on write and opens them on read
pub struct TranscriptStore {
    records: Arc<RecordStore>,
    codec: Arc<EnvelopeCodec>,
}

impl TranscriptStore {
    pub fn new(records: Arc<RecordStore>, codec: Arc<EnvelopeCodec>) -> Self {
        Self { records, codec }
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub fn codec(&self) -> &Arc<EnvelopeCodec> {
        &self.codec
    }

    /// Validate, seal and insert; returns the new row id
    #[instrument(skip(self, transcript), fields(filename = %transcript.filename, source = %transcript.source))]
    pub fn insert(&self, transcript: &NewTranscript) -> Result<i64, StoreError> {
        validate(transcript)?;

        let row = EncodedTranscript {
            filename: transcript.filename.clone(),
            text: self.codec.encrypt(&transcript.text),
            summary: transcript.summary.as_deref().map(|s| self.codec.encrypt(s)),
            enrichment: transcript
                .enrichment
                .as_ref()
                .map(|e| self.codec.encrypt_enrichment(e)),
            source: transcript.source.clone(),
            downstream_document_id: transcript.downstream_document_id.clone(),
            created_at: Utc::now(),
        };

        let id = self.records.insert(&row)?;
        debug!(id, sealed = row.text.is_enveloped(), "transcript stored");
        Ok(id)
    }

    /// Read and decrypt a transcript; fields that stay sealed are listed
    pub fn get_transcript(&self, id: i64) -> Result<Option<TranscriptRecord>, StoreError> {
        let Some(row) = self.records.get(id)? else {
            return Ok(None);
        };

        let mut sealed_fields = Vec::new();

        let text = self.codec.open(&row.text);
        if text.is_sealed() {
            sealed_fields.push("text".to_string());
        }

        let summary = row.summary.as_ref().map(|s| self.codec.open(s));
        if summary.as_ref().map(Opened::is_sealed).unwrap_or(false) {
            sealed_fields.push("summary".to_string());
        }

        let enrichment = row.enrichment.as_ref().map(|e| {
            let (opened, sealed) = self.codec.open_enrichment(e);
            sealed_fields.extend(sealed.into_iter().map(|name| format!("enrichment.{}", name)));
            opened
        });

        Ok(Some(TranscriptRecord {
            id: row.id,
            filename: row.filename,
            text: text.into_display(),
            summary: summary.map(Opened::into_display),
            enrichment,
            source: row.source,
            downstream_document_id: row.downstream_document_id,
            created_at: row.created_at,
            sealed_fields,
        }))
    }

    pub fn set_downstream_document_id(&self, id: i64, document_id: &str) -> Result<(), StoreError> {
        self.records.set_downstream_document_id(id, document_id)
    }
}

fn validate(transcript: &NewTranscript) -> Result<(), StoreError> {
    if transcript.filename.trim().is_empty() {
        return Err(StoreError::Invalid("filename is empty".to_string()));
    }
    if transcript.text.is_empty() {
        return Err(StoreError::Invalid("text is empty".to_string()));
    }
    if transcript.source.trim().is_empty() {
        return Err(StoreError::Invalid("source is empty".to_string()));
    }
    Ok(())
}
