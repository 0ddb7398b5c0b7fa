//! SQLite system of record.
//!
//! Two tables:
//! - `transcripts(id, filename, text, summary, enrichment, source, downstream_document_id, created_at)`
//! - `idempotency_keys(key, created_at, expires_at)`
//!
//! This layer stores fields exactly as given (plaintext or envelope); it never
//! encrypts or decrypts. See [`super::TranscriptStore`] for the codec-aware API.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::StoreError;
use crate::domain::{Enrichment, StoredField, StoredRow};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transcripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    text TEXT NOT NULL,
    summary TEXT,
    enrichment TEXT,
    source TEXT NOT NULL,
    downstream_document_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transcripts_created_at ON transcripts(created_at);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_keys(expires_at);
";

/// A row ready to insert (fields already encoded)
#[derive(Debug, Clone)]
pub struct EncodedTranscript {
    pub filename: String,
    pub text: StoredField,
    pub summary: Option<StoredField>,
    pub enrichment: Option<Enrichment>,
    pub source: String,
    pub downstream_document_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Replacement field values for one row (rotation write-back)
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    pub id: i64,
    pub text: StoredField,
    pub summary: Option<StoredField>,
    pub enrichment: Option<Enrichment>,
}

/// SQLite-backed record store (one connection, serialized access)
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (and create if needed) the database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a transcript; returns the assigned id
    pub fn insert(&self, row: &EncodedTranscript) -> Result<i64, StoreError> {
        let enrichment = row
            .enrichment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO transcripts
                (filename, text, summary, enrichment, source, downstream_document_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.filename,
                row.text.to_column(),
                row.summary.as_ref().map(StoredField::to_column),
                enrichment,
                row.source,
                row.downstream_document_id,
                format_timestamp(&row.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<StoredRow>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, filename, text, summary, enrichment, source, downstream_document_id, created_at
                 FROM transcripts WHERE id = ?1",
                params![id],
                read_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Record the downstream system's document id
    pub fn set_downstream_document_id(&self, id: i64, document_id: &str) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE transcripts SET downstream_document_id = ?1 WHERE id = ?2",
            params![document_id, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM transcripts", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Rows with `id > after_id`, ascending, at most `limit`
    pub fn page_after(&self, after_id: i64, limit: usize) -> Result<Vec<StoredRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, filename, text, summary, enrichment, source, downstream_document_id, created_at
             FROM transcripts WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Write rotated fields back in one transaction
    pub fn apply_field_updates(&self, updates: &[FieldUpdate]) -> Result<usize, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE transcripts SET text = ?1, summary = ?2, enrichment = ?3 WHERE id = ?4",
            )?;
            for update in updates {
                let enrichment = update
                    .enrichment
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                written += stmt.execute(params![
                    update.text.to_column(),
                    update.summary.as_ref().map(StoredField::to_column),
                    enrichment,
                    update.id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Delete transcripts created before `cutoff`
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let deleted = self.conn().execute(
            "DELETE FROM transcripts WHERE created_at < ?1",
            params![format_timestamp(&cutoff)],
        )?;
        Ok(deleted)
    }

    /// Atomically check-and-record an idempotency marker.
    ///
    /// Runs `delete expired -> select -> insert` inside one `BEGIN IMMEDIATE`
    /// transaction, so two concurrent claims for the same key cannot both see
    /// it absent. Returns `true` if the key was newly claimed, `false` if a live
    /// marker already existed.
    pub fn claim_idempotency_key(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM idempotency_keys WHERE expires_at < ?1",
            params![now],
        )?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM idempotency_keys WHERE key = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            tx.execute(
                "INSERT INTO idempotency_keys (key, created_at, expires_at) VALUES (?1, ?2, ?3)",
                params![key, now, expires_at],
            )?;
        }
        tx.commit()?;
        Ok(!exists)
    }

    /// Forget a marker (used when processing of a claimed message failed)
    pub fn release_idempotency_key(&self, key: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM idempotency_keys WHERE key = ?1", params![key])?;
        Ok(())
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

type RowResult = Result<StoredRow, StoreError>;

fn read_row(row: &Row<'_>) -> rusqlite::Result<RowResult> {
    let id: i64 = row.get(0)?;
    let filename: String = row.get(1)?;
    let text: String = row.get(2)?;
    let summary: Option<String> = row.get(3)?;
    let enrichment: Option<String> = row.get(4)?;
    let source: String = row.get(5)?;
    let downstream_document_id: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(decode_row(
        id,
        filename,
        text,
        summary,
        enrichment,
        source,
        downstream_document_id,
        &created_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_row(
    id: i64,
    filename: String,
    text: String,
    summary: Option<String>,
    enrichment: Option<String>,
    source: String,
    downstream_document_id: Option<String>,
    created_at: &str,
) -> RowResult {
    let enrichment = match enrichment.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(serde_json::from_str::<Enrichment>(raw)?),
    };
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| StoreError::Corrupt(format!("row {}: created_at: {}", id, e)))?
        .with_timezone(&Utc);

    Ok(StoredRow {
        id,
        filename,
        text: StoredField::from_column(&text),
        summary: summary.as_deref().map(StoredField::from_column),
        enrichment,
        source,
        downstream_document_id,
        created_at,
    })
}
