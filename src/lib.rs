//! scribeflow - at-least-once transcript ingestion pipeline
//!
//! Transcripts are published to a durable queue, consumed one at a time,
//! deduplicated, enriched, persisted with optional field-level envelope
//! encryption and delivered downstream. Anything that cannot be finished is
//! routed to a dead-letter queue and retried with backoff.
//!
//! # Architecture
//!
//! - Every queue delivery is acknowledged exactly once; retries go through
//!   the dead-letter queue, and a delivery is only requeued when the
//!   dead-letter queue itself cannot be reached
//! - Each outbound hop has its own circuit breaker and bounded retry
//! - Duplicate suppression is tiered and fails open
//!
//! # Modules
//!
//! - `adapters`: Downstream sinks and the enrichment collaborator
//! - `core`: Consumer, idempotency gate, delivery, reprocessor, breakers
//! - `crypto`: Envelope codec, key material, rotation
//! - `domain`: Data structures (messages, fingerprints, records)
//! - `ingest`: Broker boundary and the publisher
//! - `store`: SQLite system of record and retention
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Publish a transcript
//! echo "Patient reports asthma." | scribeflow publish visit-001.wav
//!
//! # Consume until Ctrl-C
//! scribeflow consume --with-reprocessor
//!
//! # Inspect a stored transcript
//! scribeflow show 1
//! ```

pub mod adapters;
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod domain;
pub mod ingest;
pub mod store;

// Re-export main types at crate root for convenience
pub use app::App;
pub use config::Settings;
pub use core::{Consumer, DeadLetterReprocessor, IdempotencyGate, Outcome, PipelineMetrics};
pub use domain::{Fingerprint, TranscriptMessage, TranscriptRecord};
pub use ingest::{Broker, JsonlBroker, MemoryBroker, PublishOutcome, Publisher};
pub use store::TranscriptStore;
