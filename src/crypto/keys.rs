//! Key material for field encryption.
//!
//! Keys are configured as `kid -> base64(32 bytes)` plus one primary key id.
//! Entries that are not valid base64 or not exactly 32 bytes are skipped with a
//! warning. If the primary key id is not among the loaded keys, the whole set
//! is treated as empty: under [`KeyPolicy::Permissive`] that means "encryption
//! disabled", under [`KeyPolicy::Strict`] loading fails and the process must
//! not start.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::metrics::PipelineMetrics;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// How long a kid that a reload could not find is trusted to stay missing
const MISSING_KID_RETRY: Duration = Duration::from_secs(60);

/// Raw 256-bit key
pub type KeyBytes = [u8; KEY_LEN];

/// Errors raised while loading key material
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Field encryption enabled but keys or primary key id missing")]
    NotConfigured,

    #[error("Primary encryption key id '{primary}' missing or invalid (loaded: {loaded:?})")]
    PrimaryMissing { primary: String, loaded: Vec<String> },

    #[error("Failed to read key configuration: {0}")]
    Source(String),
}

/// What to do when the key configuration is unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Fail closed to "no encryption" and keep running
    Permissive,

    /// Refuse to start or process
    Strict,
}

/// Encryption section of the configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptionSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Key id -> base64-encoded 32-byte key
    #[serde(default)]
    pub keys: BTreeMap<String, String>,

    #[serde(default)]
    pub primary_key_id: Option<String>,

    /// Rotation cadence in hours (0 disables the background job)
    #[serde(default)]
    pub rotate_hours: u64,

    #[serde(default = "default_rotation_batch_size")]
    pub rotation_batch_size: usize,

    #[serde(default = "default_rotation_max_batches")]
    pub rotation_max_batches: usize,
}

fn default_rotation_batch_size() -> usize {
    500
}
fn default_rotation_max_batches() -> usize {
    5
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            keys: BTreeMap::new(),
            primary_key_id: None,
            rotate_hours: 0,
            rotation_batch_size: default_rotation_batch_size(),
            rotation_max_batches: default_rotation_max_batches(),
        }
    }
}

// Key material must never reach logs.
impl fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("enabled", &self.enabled)
            .field("key_ids", &self.keys.keys().collect::<Vec<_>>())
            .field("primary_key_id", &self.primary_key_id)
            .field("rotate_hours", &self.rotate_hours)
            .field("rotation_batch_size", &self.rotation_batch_size)
            .field("rotation_max_batches", &self.rotation_max_batches)
            .finish()
    }
}

/// Parse `kid1:base64,kid2:base64` into ordered entries (duplicates kept)
pub fn parse_key_list(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter_map(|pair| {
            let (kid, key) = pair.split_once(':')?;
            let kid = kid.trim();
            if kid.is_empty() {
                return None;
            }
            Some((kid.to_string(), key.trim().to_string()))
        })
        .collect()
}

/// Where key material is (re)read from
pub trait KeySource: Send + Sync {
    fn load(&self) -> Result<EncryptionSettings, KeyError>;
}

impl KeySource for EncryptionSettings {
    fn load(&self) -> Result<EncryptionSettings, KeyError> {
        Ok(self.clone())
    }
}

/// A loaded, validated key set
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, KeyBytes>,
    primary: Option<String>,
}

impl KeyRing {
    /// Empty ring: encryption disabled
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate settings into a ring, applying `policy` to misconfiguration
    pub fn from_settings(settings: &EncryptionSettings, policy: KeyPolicy) -> Result<Self, KeyError> {
        if !settings.enabled {
            return Ok(Self::empty());
        }

        let primary = match settings.primary_key_id.as_deref() {
            Some(primary) if !settings.keys.is_empty() && !primary.is_empty() => primary,
            _ => {
                warn!(
                    primary = ?settings.primary_key_id,
                    keys = !settings.keys.is_empty(),
                    "encryption enabled but configuration incomplete"
                );
                return match policy {
                    KeyPolicy::Strict => Err(KeyError::NotConfigured),
                    KeyPolicy::Permissive => Ok(Self::empty()),
                };
            }
        };

        let mut keys = HashMap::new();
        let mut invalid = Vec::new();
        for (kid, encoded) in &settings.keys {
            match STANDARD.decode(encoded) {
                Ok(bytes) if bytes.len() == KEY_LEN => {
                    let mut key = [0u8; KEY_LEN];
                    key.copy_from_slice(&bytes);
                    keys.insert(kid.clone(), key);
                }
                _ => invalid.push(kid.clone()),
            }
        }

        if !invalid.is_empty() {
            warn!(?invalid, "skipping invalid encryption keys");
        }

        if !keys.contains_key(primary) {
            let mut loaded: Vec<String> = keys.keys().cloned().collect();
            loaded.sort();
            error!(primary, ?loaded, "primary encryption key missing");
            return match policy {
                KeyPolicy::Strict => Err(KeyError::PrimaryMissing {
                    primary: primary.to_string(),
                    loaded,
                }),
                KeyPolicy::Permissive => Ok(Self::empty()),
            };
        }

        Ok(Self {
            keys,
            primary: Some(primary.to_string()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn primary_kid(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    pub fn primary(&self) -> Option<(&str, &KeyBytes)> {
        let kid = self.primary.as_deref()?;
        self.keys.get(kid).map(|key| (kid, key))
    }

    pub fn get(&self, kid: &str) -> Option<&KeyBytes> {
        self.keys.get(kid)
    }
}

/// Reloadable in-memory key material
pub struct KeyMaterialStore {
    source: Box<dyn KeySource>,
    policy: KeyPolicy,
    ring: RwLock<KeyRing>,
    /// Kids a reload failed to find, and when
    missing: Mutex<HashMap<String, Instant>>,
    metrics: Arc<PipelineMetrics>,
}

impl KeyMaterialStore {
    /// Load key material; fails only under the strict policy
    pub fn load(
        source: Box<dyn KeySource>,
        policy: KeyPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, KeyError> {
        let store = Self {
            source,
            policy,
            ring: RwLock::new(KeyRing::empty()),
            missing: Mutex::new(HashMap::new()),
            metrics,
        };
        store.reload()?;
        Ok(store)
    }

    /// Store with encryption disabled
    pub fn disabled(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            source: Box::new(EncryptionSettings::default()),
            policy: KeyPolicy::Permissive,
            ring: RwLock::new(KeyRing::empty()),
            missing: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Re-read the key source and swap in the new ring; returns active key count
    pub fn reload(&self) -> Result<usize, KeyError> {
        let settings = self.source.load()?;
        let ring = KeyRing::from_settings(&settings, self.policy)?;
        let count = ring.len();

        if !ring.is_empty() {
            self.metrics.encryption_key_reload.inc();
            info!(count, primary = ?ring.primary_kid(), "encryption keys loaded");
        }
        self.metrics.encryption_active_keys.set(count as u64);

        *self.ring.write().unwrap_or_else(|p| p.into_inner()) = ring;
        self.forget_missing();
        Ok(count)
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn is_enabled(&self) -> bool {
        !self.snapshot().is_empty()
    }

    /// Current ring (cheap clone of at most a handful of keys)
    pub fn snapshot(&self) -> KeyRing {
        self.ring.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Look up a key, reloading once if it is not loaded.
    ///
    /// A kid still absent after the reload is not retried for
    /// `MISSING_KID_RETRY`, or until [`forget_missing`](Self::forget_missing).
    pub fn key_or_reload(&self, kid: &str) -> Option<KeyBytes> {
        if let Some(key) = self.snapshot().get(kid) {
            return Some(*key);
        }
        if self.recently_missing(kid) {
            debug!(kid, "kid known missing; skipping reload");
            return None;
        }
        if let Err(e) = self.reload() {
            warn!(kid, error = %e, "key reload failed");
        }
        let key = self.snapshot().get(kid).copied();
        if key.is_none() {
            warn!(kid, "no key loaded for kid");
            self.missing_kids().insert(kid.to_string(), Instant::now());
        }
        key
    }

    /// Let the next lookup of any missing kid reload again
    pub fn forget_missing(&self) {
        self.missing_kids().clear();
    }

    fn recently_missing(&self, kid: &str) -> bool {
        self.missing_kids()
            .get(kid)
            .is_some_and(|since| since.elapsed() < MISSING_KID_RETRY)
    }

    fn missing_kids(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.missing.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn b64_key(byte: u8) -> String {
        STANDARD.encode([byte; KEY_LEN])
    }

    fn settings(primary: &str, keys: &[(&str, String)]) -> EncryptionSettings {
        EncryptionSettings {
            enabled: true,
            keys: keys.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            primary_key_id: Some(primary.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_key_list() {
        let entries = parse_key_list("k1:AAAA, k2:BBBB,,bad, :CCCC");
        assert_eq!(
            entries,
            vec![
                ("k1".to_string(), "AAAA".to_string()),
                ("k2".to_string(), "BBBB".to_string())
            ]
        );
    }

    #[test]
    fn test_loads_valid_ring() {
        let s = settings("k2", &[("k1", b64_key(1)), ("k2", b64_key(2))]);
        let ring = KeyRing::from_settings(&s, KeyPolicy::Strict).unwrap();

        assert_eq!(ring.len(), 2);
        assert_eq!(ring.primary().map(|(kid, _)| kid), Some("k2"));
    }

    #[test]
    fn test_invalid_keys_are_skipped() {
        let s = settings("k1", &[("k1", b64_key(1)), ("short", STANDARD.encode([0u8; 16])), ("junk", "!!".into())]);
        let ring = KeyRing::from_settings(&s, KeyPolicy::Strict).unwrap();

        assert_eq!(ring.len(), 1);
        assert!(ring.get("short").is_none());
    }

    #[test]
    fn test_missing_primary_permissive_disables() {
        let s = settings("absent", &[("k1", b64_key(1))]);
        let ring = KeyRing::from_settings(&s, KeyPolicy::Permissive).unwrap();

        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_missing_primary_strict_fails() {
        let s = settings("absent", &[("k1", b64_key(1))]);
        let err = KeyRing::from_settings(&s, KeyPolicy::Strict).err().unwrap();

        assert!(matches!(err, KeyError::PrimaryMissing { .. }));
    }

    #[test]
    fn test_enabled_without_keys_strict_fails() {
        let s = EncryptionSettings {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            KeyRing::from_settings(&s, KeyPolicy::Strict),
            Err(KeyError::NotConfigured)
        ));
        assert!(KeyRing::from_settings(&s, KeyPolicy::Permissive).unwrap().is_empty());
    }

    struct CountingSource {
        settings: EncryptionSettings,
        loads: Arc<AtomicUsize>,
    }

    impl KeySource for CountingSource {
        fn load(&self) -> Result<EncryptionSettings, KeyError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.settings.clone())
        }
    }

    #[test]
    fn test_missing_kid_reloads_once_until_forgotten() {
        let loads = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            settings: settings("k2", &[("k2", b64_key(2))]),
            loads: loads.clone(),
        };
        let store =
            KeyMaterialStore::load(Box::new(source), KeyPolicy::Strict, Arc::new(PipelineMetrics::new()))
                .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            assert!(store.key_or_reload("retired").is_none());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(store.key_or_reload("k2").is_some());

        store.forget_missing();
        assert!(store.key_or_reload("retired").is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_debug_hides_key_material() {
        let s = settings("k1", &[("k1", b64_key(7))]);
        let rendered = format!("{:?}", s);

        assert!(rendered.contains("k1"));
        assert!(!rendered.contains(&b64_key(7)));
    }
}
