//! Domain types for the transcript pipeline.
//!
//! This module contains the plain data structures:
//! - Message: queue payloads and dead-letter tags
//! - Fingerprint: content identity for deduplication
//! - Field: plaintext-or-envelope storage representation
//! - Record: durable transcript rows

pub mod field;
pub mod fingerprint;
pub mod message;
pub mod record;

// Re-export commonly used types
pub use field::StoredField;
pub use fingerprint::Fingerprint;
pub use message::{
    epoch_seconds, DeadLetterReason, RawDeadLetter, TranscriptMessage, SOURCE_API,
    SOURCE_FALLBACK,
};
pub use record::{Enrichment, NewTranscript, StoredRow, TranscriptRecord};
