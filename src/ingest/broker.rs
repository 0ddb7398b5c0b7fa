//! Durable queue boundary.
//!
//! Semantics follow an AMQP-style broker: at-least-once delivery, manual
//! acknowledgment, prefetch of one per queue (a second `fetch` returns `None`
//! until the in-flight delivery is acked or recovered), and a dead-letter
//! queue named `<main>_dlq` per logical queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Broker-assigned handle for one delivery
pub type DeliveryTag = u64;

/// Errors from a broker implementation
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown delivery tag {tag} on queue '{queue}'")]
    UnknownTag { queue: String, tag: DeliveryTag },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,

    /// Delivered before without an ack
    pub redelivered: bool,
}

/// Dead-letter queue paired with `queue`
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}_dlq", queue)
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a persistent message to `queue`
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Take the next ready message, if any (non-blocking)
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery; the message is gone for good
    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Ready (not in-flight) message count
    async fn depth(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Return in-flight deliveries to ready, flagged redelivered
    async fn recover(&self, queue: &str) -> Result<usize, BrokerError>;
}

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: VecDeque<(Vec<u8>, bool)>,
    unacked: BTreeMap<DeliveryTag, Vec<u8>>,
}

/// Process-local broker
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    next_tag: Mutex<DeliveryTag>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut MemoryQueue) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        f(queues.entry(queue.to_string()).or_default())
    }

    fn next_tag(&self) -> DeliveryTag {
        let mut tag = self.next_tag.lock().unwrap_or_else(|p| p.into_inner());
        *tag += 1;
        *tag
    }

    /// Ready bodies in order (inspection helper)
    pub fn peek_all(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.ready.iter().map(|(body, _)| body.clone()).collect())
    }

    /// In-flight delivery count
    pub fn unacked(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.with_queue(queue, |q| q.ready.push_back((body, false)));
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let tag = self.next_tag();
        Ok(self.with_queue(queue, |q| {
            if !q.unacked.is_empty() {
                return None;
            }
            let (body, redelivered) = q.ready.pop_front()?;
            q.unacked.insert(tag, body.clone());
            Some(Delivery {
                tag,
                body,
                redelivered,
            })
        }))
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.with_queue(queue, |q| q.unacked.remove(&tag))
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownTag {
                queue: queue.to_string(),
                tag,
            })
    }

    async fn depth(&self, queue: &str) -> Result<u64, BrokerError> {
        Ok(self.with_queue(queue, |q| q.ready.len() as u64))
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self.with_queue(queue, |q| {
            let recovered = std::mem::take(&mut q.unacked);
            let count = recovered.len();
            for body in recovered.into_values().rev() {
                q.ready.push_front((body, true));
            }
            count
        }))
    }
}
