//! System of record for transcripts and idempotency markers.
//!
//! - `sqlite`: raw row storage (fields stored as given)
//! - `transcripts`: codec-aware facade used by the pipeline
//! - `retention`: age-based purge

pub mod retention;
pub mod sqlite;
pub mod transcripts;

use thiserror::Error;

pub use retention::RetentionJob;
pub use sqlite::{EncodedTranscript, FieldUpdate, RecordStore};
pub use transcripts::TranscriptStore;

/// Errors from the record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid transcript: {0}")]
    Invalid(String),

    #[error("Transcript {0} not found")]
    NotFound(i64),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}
