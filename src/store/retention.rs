//! Age-based transcript purge.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::{RecordStore, StoreError};
use crate::core::metrics::PipelineMetrics;

/// Deletes transcripts older than `retention_days`
pub struct RetentionJob {
    records: Arc<RecordStore>,
    retention_days: u32,
    metrics: Arc<PipelineMetrics>,
}

impl RetentionJob {
    pub fn new(records: Arc<RecordStore>, retention_days: u32, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            records,
            retention_days,
            metrics,
        }
    }

    /// Retention disabled when 0
    pub fn is_enabled(&self) -> bool {
        self.retention_days > 0
    }

    /// One purge pass; returns rows deleted
    pub fn run_once(&self) -> Result<usize, StoreError> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let deleted = self.records.purge_older_than(self.cutoff(Utc::now()))?;
        if deleted > 0 {
            self.metrics.transcripts_purged.add(deleted as u64);
            info!(deleted, retention_days = self.retention_days, "purged expired transcripts");
        }
        Ok(deleted)
    }

    /// Oldest creation time kept; windows reaching past the calendar keep everything
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_days(i64::from(self.retention_days))
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
