//! Queueing and the publish side of the pipeline.
//!
//! ```text
//! ingress → Publisher ──► main queue ──► Consumer
//!              │                             │
//!              └─► Record Store (fallback)   └─► <main>_dlq ──► Reprocessor
//! ```

pub mod broker;
pub mod jsonl_broker;
pub mod publisher;

pub use broker::{dead_letter_queue, Broker, BrokerError, Delivery, DeliveryTag, MemoryBroker};
pub use jsonl_broker::JsonlBroker;
pub use publisher::{PublishError, PublishOutcome, Publisher};
