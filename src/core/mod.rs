//! Core pipeline logic.
//!
//! This module contains:
//! - Consumer: main-queue state machine (dedupe, persist, deliver)
//! - IdempotencyGate: tiered duplicate suppression
//! - DownstreamDelivery: guarded dual-path delivery
//! - DeadLetterReprocessor: backoff and republish from the DLQ
//! - CircuitBreaker / RetryPolicy: failure isolation primitives
//! - JobScheduler: rotation, retention and queue-depth jobs

pub mod breaker;
pub mod consumer;
pub mod delivery;
pub mod idempotency;
pub mod jobs;
pub mod metrics;
pub mod reprocessor;
pub mod retry;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, FailureTransition};
pub use consumer::{Consumer, Outcome};
pub use delivery::{DeliveryError, DeliveryOutcome, DownstreamDelivery, GuardedSink};
pub use idempotency::{
    BloomFilter, DuplicateSource, FastPathError, FastPathStore, GateVerdict, IdempotencyGate,
    IdempotencySettings, MemoryFastPath, SeenList,
};
pub use jobs::{JobHandles, JobScheduler};
pub use metrics::{Counter, Gauge, MetricsSnapshot, PipelineMetrics};
pub use reprocessor::{backoff_delay, DeadLetterReprocessor, ReprocessOutcome, ReprocessorSettings};
pub use retry::{Backoff, RetryPolicy};
