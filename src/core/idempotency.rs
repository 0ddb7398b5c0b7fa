//! Content-based duplicate suppression.
//!
//! Three independently configurable tiers decide whether a fingerprint was
//! already seen:
//!
//! 1. fast path: set-if-absent with TTL; a rejected write means duplicate.
//!    An optional bloom filter in front of it only counts hints.
//! 2. durable table: delete expired, select, insert, inside one immediate
//!    transaction in the Record Store.
//! 3. in-process seen list: used only when the fast path is disabled or
//!    erroring; oldest 10% evicted when over capacity.
//!
//! The gate never fails: a tier error is counted and treated as "not seen".
//! Tiers are not coordinated, so a restart that empties tier 3 while tier 2 is
//! disabled opens a duplicate window for redelivered messages.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::metrics::PipelineMetrics;
use crate::domain::Fingerprint;
use crate::store::RecordStore;

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub fast_path_enabled: bool,

    #[serde(default = "default_fast_path_ttl")]
    pub fast_path_ttl_seconds: u64,

    #[serde(default)]
    pub bloom_enabled: bool,

    #[serde(default = "default_bloom_capacity")]
    pub bloom_capacity: usize,

    #[serde(default = "default_bloom_error_rate")]
    pub bloom_error_rate: f64,

    #[serde(default)]
    pub db_enabled: bool,

    #[serde(default = "default_db_ttl")]
    pub db_ttl_seconds: u64,

    /// Capacity of the in-process seen list
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_true() -> bool {
    true
}
fn default_fast_path_ttl() -> u64 {
    3600
}
fn default_bloom_capacity() -> usize {
    100_000
}
fn default_bloom_error_rate() -> f64 {
    0.001
}
fn default_db_ttl() -> u64 {
    86_400
}
fn default_cache_size() -> usize {
    5000
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_path_enabled: true,
            fast_path_ttl_seconds: default_fast_path_ttl(),
            bloom_enabled: false,
            bloom_capacity: default_bloom_capacity(),
            bloom_error_rate: default_bloom_error_rate(),
            db_enabled: false,
            db_ttl_seconds: default_db_ttl(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FastPathError {
    #[error("Fast-path store unavailable: {0}")]
    Unavailable(String),
}

/// Shared set-if-absent store with expiry
pub trait FastPathStore: Send + Sync {
    /// Record `key` unless present; `Ok(true)` if newly recorded
    fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, FastPathError>;

    fn remove(&self, key: &str) -> Result<(), FastPathError>;
}

/// In-process fast path with lazy expiry
#[derive(Debug, Default)]
pub struct MemoryFastPath {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryFastPath {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FastPathStore for MemoryFastPath {
    fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, FastPathError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, expires| *expires > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<(), FastPathError> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Fixed-size bloom filter (double hashing over SHA-256)
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<u64>,
    bit_count: u64,
    hashes: u32,
}

impl BloomFilter {
    pub fn with_rate(capacity: usize, error_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = error_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let bit_count = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let hashes = ((bit_count as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;

        Self {
            bits: vec![0; bit_count.div_ceil(64) as usize],
            bit_count,
            hashes,
        }
    }

    fn positions(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(key.as_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        let (h1, h2) = (u64::from_le_bytes(h1), u64::from_le_bytes(h2));
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count)
    }

    /// Insert; returns whether the key may have been present already
    pub fn insert(&mut self, key: &str) -> bool {
        let positions: Vec<u64> = self.positions(key).collect();
        let mut maybe_present = true;
        for pos in positions {
            let (word, bit) = ((pos / 64) as usize, pos % 64);
            if self.bits[word] & (1u64 << bit) == 0 {
                maybe_present = false;
                self.bits[word] |= 1u64 << bit;
            }
        }
        maybe_present
    }
}

/// Ordered, capped list of recently seen fingerprints
#[derive(Debug)]
pub struct SeenList {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl SeenList {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Append; evicts the oldest 10% (at least one) once over capacity
    pub fn push(&mut self, key: &str) {
        if !self.members.insert(key.to_string()) {
            return;
        }
        self.order.push_back(key.to_string());
        if self.order.len() > self.capacity {
            let drop = (self.capacity / 10).max(1);
            for old in self.order.drain(..drop.min(self.order.len())) {
                self.members.remove(&old);
            }
        }
    }

    pub fn remove(&mut self, key: &str) {
        if self.members.remove(key) {
            self.order.retain(|k| k != key);
        }
    }
}

/// Which tier reported the duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSource {
    FastPath,
    Durable,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Novel,
    Duplicate(DuplicateSource),
}

impl GateVerdict {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

pub struct IdempotencyGate {
    settings: IdempotencySettings,
    fast_path: Option<Arc<dyn FastPathStore>>,
    bloom: Option<Mutex<BloomFilter>>,
    durable: Option<Arc<RecordStore>>,
    seen: Mutex<SeenList>,
    metrics: Arc<PipelineMetrics>,
}

impl IdempotencyGate {
    /// Build a gate; tiers are wired only when enabled in `settings`
    pub fn new(
        settings: IdempotencySettings,
        fast_path: Option<Arc<dyn FastPathStore>>,
        durable: Option<Arc<RecordStore>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let fast_path = fast_path.filter(|_| settings.fast_path_enabled);
        let durable = durable.filter(|_| settings.db_enabled);
        let bloom = (settings.bloom_enabled && fast_path.is_some()).then(|| {
            Mutex::new(BloomFilter::with_rate(
                settings.bloom_capacity,
                settings.bloom_error_rate,
            ))
        });
        let seen = Mutex::new(SeenList::new(settings.cache_size));

        Self {
            settings,
            fast_path,
            bloom,
            durable,
            seen,
            metrics,
        }
    }

    /// Gate with every tier off
    pub fn disabled(metrics: Arc<PipelineMetrics>) -> Self {
        Self::new(
            IdempotencySettings {
                enabled: false,
                ..Default::default()
            },
            None,
            None,
            metrics,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Decide duplicate vs novel, recording the fingerprint in every active tier
    pub fn check(&self, fingerprint: &Fingerprint) -> GateVerdict {
        if !self.settings.enabled {
            return GateVerdict::Novel;
        }
        let key = fingerprint.as_str();
        let mut verdict = GateVerdict::Novel;
        let mut use_memory = self.fast_path.is_none();

        if let Some(fast_path) = &self.fast_path {
            if let Some(bloom) = &self.bloom {
                if bloom.lock().unwrap_or_else(|p| p.into_inner()).insert(key) {
                    self.metrics.idempotency_bloom_hints.inc();
                }
            }

            let ttl = Duration::from_secs(self.settings.fast_path_ttl_seconds);
            match fast_path.set_if_absent(key, ttl) {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics.idempotency_fast_path_hits.inc();
                    verdict = GateVerdict::Duplicate(DuplicateSource::FastPath);
                }
                Err(e) => {
                    self.metrics.idempotency_errors.inc();
                    warn!(error = %e, "fast-path idempotency check failed; using in-process list");
                    use_memory = true;
                }
            }
        }

        if use_memory && !verdict.is_duplicate() {
            let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            if seen.contains(key) {
                self.metrics.idempotency_memory_hits.inc();
                verdict = GateVerdict::Duplicate(DuplicateSource::Memory);
            } else {
                seen.push(key);
            }
        }

        if let Some(durable) = &self.durable {
            let ttl = Duration::from_secs(self.settings.db_ttl_seconds);
            match durable.claim_idempotency_key(key, ttl) {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics.idempotency_db_hits.inc();
                    if !verdict.is_duplicate() {
                        verdict = GateVerdict::Duplicate(DuplicateSource::Durable);
                    }
                }
                Err(e) => {
                    self.metrics.idempotency_errors.inc();
                    warn!(error = %e, "durable idempotency check failed; treating as new");
                }
            }
        }

        debug!(fingerprint = %fingerprint, ?verdict, "idempotency check");
        verdict
    }

    /// Forget a fingerprint in every tier (best effort)
    pub fn release(&self, fingerprint: &Fingerprint) {
        let key = fingerprint.as_str();
        if let Some(fast_path) = &self.fast_path {
            if let Err(e) = fast_path.remove(key) {
                warn!(error = %e, "failed to release fast-path marker");
            }
        }
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.release_idempotency_key(key) {
                warn!(error = %e, "failed to release durable marker");
            }
        }
    }
}
