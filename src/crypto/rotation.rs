//! Online re-encryption under the current primary key.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use super::EnvelopeCodec;
use crate::core::metrics::PipelineMetrics;
use crate::store::{FieldUpdate, RecordStore, StoreError};

/// Outcome of one rotation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub scanned: usize,
    pub updated: usize,
    pub batches: usize,
}

/// Walks transcripts by id and re-seals fields not under the primary key.
///
/// Each pass resumes after the last id the previous pass reached and wraps
/// to the start once the end of the table is seen.
pub struct KeyRotationJob {
    records: Arc<RecordStore>,
    cursor: Mutex<i64>,
    codec: Arc<EnvelopeCodec>,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    max_batches: usize,
}

impl KeyRotationJob {
    pub fn new(
        records: Arc<RecordStore>,
        codec: Arc<EnvelopeCodec>,
        metrics: Arc<PipelineMetrics>,
        batch_size: usize,
        max_batches: usize,
    ) -> Self {
        Self {
            records,
            cursor: Mutex::new(0),
            codec,
            metrics,
            batch_size: batch_size.max(1),
            max_batches: max_batches.max(1),
        }
    }

    /// One bounded pass: at most `max_batches * batch_size` rows, one commit per batch
    pub fn run_once(&self) -> Result<RotationReport, StoreError> {
        let mut report = RotationReport::default();
        let Some(primary) = self.codec.primary_kid() else {
            return Ok(report);
        };

        self.metrics.encryption_rotate_attempt.inc();
        // Each pass may reload once per retired kid, not once per field
        self.codec.keys().forget_missing();
        let mut cursor = self.cursor.lock().unwrap_or_else(|p| p.into_inner());
        let mut last_id = *cursor;
        let mut reached_end = false;

        for _ in 0..self.max_batches {
            let rows = self.records.page_after(last_id, self.batch_size)?;
            let Some(last) = rows.last() else {
                reached_end = true;
                break;
            };
            last_id = last.id;
            report.scanned += rows.len();
            report.batches += 1;

            let updates: Vec<FieldUpdate> = rows
                .iter()
                .filter_map(|row| {
                    let text = self.codec.reencrypt(&row.text);
                    let summary = row.summary.as_ref().and_then(|s| self.codec.reencrypt(s));
                    let enrichment = row
                        .enrichment
                        .as_ref()
                        .and_then(|e| self.codec.reencrypt_enrichment(e));

                    if text.is_none() && summary.is_none() && enrichment.is_none() {
                        return None;
                    }
                    Some(FieldUpdate {
                        id: row.id,
                        text: text.unwrap_or_else(|| row.text.clone()),
                        summary: summary.or_else(|| row.summary.clone()),
                        enrichment: enrichment.or_else(|| row.enrichment.clone()),
                    })
                })
                .collect();

            match self.records.apply_field_updates(&updates) {
                Ok(written) => report.updated += written,
                Err(e) => {
                    self.metrics.encryption_rotate_failures.inc();
                    warn!(error = %e, last_id, "rotation batch failed");
                    return Err(e);
                }
            }

            if rows.len() < self.batch_size {
                reached_end = true;
                break;
            }
        }
        *cursor = if reached_end { 0 } else { last_id };

        self.metrics.encryption_rotate_updated.add(report.updated as u64);
        info!(
            primary = %primary,
            scanned = report.scanned,
            updated = report.updated,
            batches = report.batches,
            "key rotation pass complete"
        );
        Ok(report)
    }
}
