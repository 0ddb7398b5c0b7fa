//! File-backed broker: one append-only JSONL log per queue.
//!
//! Follows the event-log pattern: every state change is appended as a line and
//! the queue is derived by replay. A message is ready from its `published`
//! event until its `acked` event; `delivered` events only mark it as
//! redelivered for later fetches. In-flight deliveries are tracked in memory, so
//! after a restart every unacked message is ready again.
//!
//! A crash mid-append can leave a torn last line. Replay skips lines that do
//! not parse, and the next append starts on a fresh line. Once enough acked
//! events pile up, or a torn line was seen, the log is rewritten with only the
//! unacked messages.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::broker::{Broker, BrokerError, Delivery, DeliveryTag};

/// Acked events tolerated in a log before it is compacted
const DEFAULT_COMPACT_AFTER: usize = 1024;

/// An event in a queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,

    /// Message id (assigned at publish)
    pub message_id: Uuid,

    pub event_type: QueueEventType,

    /// Base64 body (publish events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    Published,
    Delivered,
    Acked,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    id: Uuid,
    published_at: DateTime<Utc>,
    body: Vec<u8>,
    delivered: bool,
}

/// Result of replaying one queue log
#[derive(Debug, Default)]
struct Replay {
    pending: Vec<PendingMessage>,
    acked: usize,
    corrupt: usize,
}

#[derive(Debug, Default)]
struct InFlight {
    next_tag: DeliveryTag,
    by_tag: HashMap<String, HashMap<DeliveryTag, Uuid>>,
}

/// JSONL queue directory (`<home>/queues/<name>.jsonl`)
///
/// Every operation holds the `in_flight` lock, so appends never race a
/// compaction rewriting the same log.
pub struct JsonlBroker {
    dir: PathBuf,
    in_flight: Mutex<InFlight>,
    compact_after: usize,
}

impl JsonlBroker {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            in_flight: Mutex::new(InFlight::default()),
            compact_after: DEFAULT_COMPACT_AFTER,
        }
    }

    /// Open the broker under a home directory, creating `queues/`
    pub async fn open(home: &Path) -> Result<Self, BrokerError> {
        let dir = home.join("queues");
        fs::create_dir_all(&dir).await?;
        Ok(Self::new(dir))
    }

    /// Compact a log once it holds `acked` acknowledged messages
    pub fn with_compaction_threshold(mut self, acked: usize) -> Self {
        self.compact_after = acked.max(1);
        self
    }

    fn queue_path(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", queue))
    }

    async fn append_event(&self, queue: &str, event: &QueueEvent) -> Result<(), BrokerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.queue_path(queue))
            .await?;

        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        if !ends_with_newline(&mut file).await? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Replay the log into unacked messages, oldest first
    async fn replay(&self, queue: &str) -> Result<Replay, BrokerError> {
        let path = self.queue_path(queue);
        if !path.exists() {
            return Ok(Replay::default());
        }

        let file = File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut order: Vec<PendingMessage> = Vec::new();
        let mut delivered: HashSet<Uuid> = HashSet::new();
        let mut acked: HashSet<Uuid> = HashSet::new();
        let mut corrupt = 0;
        let mut line_no = 0;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event: QueueEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(queue, line = line_no, error = %e, "skipping unreadable queue log line");
                    corrupt += 1;
                    continue;
                }
            };
            match event.event_type {
                QueueEventType::Published => {
                    let body = event
                        .body
                        .as_deref()
                        .and_then(|b| STANDARD.decode(b).ok())
                        .unwrap_or_default();
                    order.push(PendingMessage {
                        id: event.message_id,
                        published_at: event.timestamp,
                        body,
                        delivered: false,
                    });
                }
                QueueEventType::Delivered => {
                    delivered.insert(event.message_id);
                }
                QueueEventType::Acked => {
                    acked.insert(event.message_id);
                }
            }
        }

        let pending = order
            .into_iter()
            .filter(|m| !acked.contains(&m.id))
            .map(|mut m| {
                m.delivered = delivered.contains(&m.id);
                m
            })
            .collect();
        Ok(Replay {
            pending,
            acked: acked.len(),
            corrupt,
        })
    }

    /// Replay, compacting the log first when it has grown stale
    async fn load(&self, queue: &str) -> Result<Vec<PendingMessage>, BrokerError> {
        let replay = self.replay(queue).await?;
        if replay.corrupt > 0 || replay.acked >= self.compact_after {
            self.compact(queue, &replay.pending).await?;
            info!(
                queue,
                dropped_acked = replay.acked,
                dropped_corrupt = replay.corrupt,
                "queue log compacted"
            );
        }
        Ok(replay.pending)
    }

    /// Rewrite the log with only the pending messages (temp file + rename)
    async fn compact(&self, queue: &str, pending: &[PendingMessage]) -> Result<(), BrokerError> {
        let mut contents = String::new();
        for message in pending {
            let mut published = Self::event(message.id, QueueEventType::Published);
            published.timestamp = message.published_at;
            published.body = Some(STANDARD.encode(&message.body));
            contents.push_str(&serde_json::to_string(&published)?);
            contents.push('\n');
            if message.delivered {
                contents.push_str(&serde_json::to_string(&Self::event(
                    message.id,
                    QueueEventType::Delivered,
                ))?);
                contents.push('\n');
            }
        }

        let path = self.queue_path(queue);
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn event(message_id: Uuid, event_type: QueueEventType) -> QueueEvent {
        QueueEvent {
            timestamp: Utc::now(),
            message_id,
            event_type,
            body: None,
        }
    }
}

/// Empty files count as ending with a newline
async fn ends_with_newline(file: &mut File) -> Result<bool, BrokerError> {
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

#[async_trait]
impl Broker for JsonlBroker {
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let _guard = self.in_flight.lock().await;
        let mut event = Self::event(Uuid::new_v4(), QueueEventType::Published);
        event.body = Some(STANDARD.encode(body));
        self.append_event(queue, &event).await
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut in_flight = self.in_flight.lock().await;
        let taken = in_flight.by_tag.entry(queue.to_string()).or_default();
        if !taken.is_empty() {
            return Ok(None);
        }

        let Some(message) = self.load(queue).await?.into_iter().next() else {
            return Ok(None);
        };

        self.append_event(queue, &Self::event(message.id, QueueEventType::Delivered))
            .await?;

        in_flight.next_tag += 1;
        let tag = in_flight.next_tag;
        in_flight
            .by_tag
            .entry(queue.to_string())
            .or_default()
            .insert(tag, message.id);

        Ok(Some(Delivery {
            tag,
            body: message.body,
            redelivered: message.delivered,
        }))
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut in_flight = self.in_flight.lock().await;
        let message_id = in_flight
            .by_tag
            .get_mut(queue)
            .and_then(|tags| tags.remove(&tag))
            .ok_or_else(|| BrokerError::UnknownTag {
                queue: queue.to_string(),
                tag,
            })?;

        self.append_event(queue, &Self::event(message_id, QueueEventType::Acked))
            .await
    }

    async fn depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let in_flight = self.in_flight.lock().await;
        let taken: HashSet<Uuid> = in_flight
            .by_tag
            .get(queue)
            .map(|tags| tags.values().copied().collect())
            .unwrap_or_default();

        let ready = self
            .load(queue)
            .await?
            .iter()
            .filter(|m| !taken.contains(&m.id))
            .count();
        Ok(ready as u64)
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut in_flight = self.in_flight.lock().await;
        Ok(in_flight
            .by_tag
            .get_mut(queue)
            .map(|tags| tags.drain().count())
            .unwrap_or(0))
    }
}
