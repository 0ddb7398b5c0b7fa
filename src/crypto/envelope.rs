//! AES-256-GCM envelopes for sensitive text fields.
//!
//! Each encryption uses a fresh 12-byte nonce; the stored value is
//! `base64(nonce || ciphertext_with_tag)` tagged with the key id. Encryption
//! never blocks a write: if it fails, the plaintext is stored and
//! `encryption_encrypt_failures` is incremented. Decryption never fails a read:
//! if the key is unknown (after one reload) or authentication fails, the field
//! is returned sealed.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::keys::{KeyBytes, KeyMaterialStore};
use crate::core::metrics::PipelineMetrics;
use crate::domain::{Enrichment, StoredField};

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("No key loaded for kid '{0}'")]
    UnknownKey(String),

    #[error("Envelope payload is not valid base64")]
    Encoding,

    #[error("Envelope payload too short")]
    Truncated,

    #[error("Authentication failed")]
    Authentication,

    #[error("Decrypted payload is not UTF-8")]
    Utf8,
}

/// Result of opening a stored field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// Readable text (decrypted, or plaintext all along)
    Text(String),

    /// Still sealed: the original envelope, rendered for display
    Sealed { kid: String, raw: String },
}

impl Opened {
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed { .. })
    }

    /// Text if readable, else the raw envelope
    pub fn into_display(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Sealed { raw, .. } => raw,
        }
    }
}

/// Encrypts and decrypts fields against the current key material
pub struct EnvelopeCodec {
    keys: Arc<KeyMaterialStore>,
    metrics: Arc<PipelineMetrics>,
}

impl EnvelopeCodec {
    pub fn new(keys: Arc<KeyMaterialStore>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { keys, metrics }
    }

    pub fn keys(&self) -> &Arc<KeyMaterialStore> {
        &self.keys
    }

    /// Whether writes will be sealed
    pub fn is_enabled(&self) -> bool {
        self.keys.is_enabled()
    }

    /// Kid new writes are sealed under
    pub fn primary_kid(&self) -> Option<String> {
        self.keys.snapshot().primary_kid().map(str::to_string)
    }

    /// Seal `plaintext` under the primary key, or store it as-is
    pub fn encrypt(&self, plaintext: &str) -> StoredField {
        let ring = self.keys.snapshot();
        let Some((kid, key)) = ring.primary() else {
            return StoredField::PlainText(plaintext.to_string());
        };

        match seal(key, plaintext.as_bytes()) {
            Ok(ciphertext) => StoredField::enveloped(kid, ciphertext),
            Err(e) => {
                self.metrics.encryption_encrypt_failures.inc();
                warn!(kid, error = %e, "field encryption failed; storing plaintext");
                StoredField::PlainText(plaintext.to_string())
            }
        }
    }

    /// Strict decrypt; reloads keys once when the kid is unknown
    pub fn decrypt(&self, kid: &str, ciphertext: &str) -> Result<String, EnvelopeError> {
        let key = self
            .keys
            .key_or_reload(kid)
            .ok_or_else(|| EnvelopeError::UnknownKey(kid.to_string()))?;
        open(&key, ciphertext)
    }

    /// Open a stored field for reading
    pub fn open(&self, field: &StoredField) -> Opened {
        match field {
            StoredField::PlainText(text) => Opened::Text(text.clone()),
            StoredField::Enveloped { kid, ciphertext } => match self.decrypt(kid, ciphertext) {
                Ok(text) => Opened::Text(text),
                Err(e) => {
                    self.metrics.encryption_decrypt_failures.inc();
                    warn!(kid = %kid, error = %e, "field left sealed");
                    Opened::Sealed {
                        kid: kid.clone(),
                        raw: field.to_column(),
                    }
                }
            },
        }
    }

    /// Re-seal a field under the current primary key.
    ///
    /// Returns `None` when nothing needs to change (already primary, no
    /// primary configured, or the old key cannot open it).
    pub fn reencrypt(&self, field: &StoredField) -> Option<StoredField> {
        let primary = self.primary_kid()?;
        match field {
            StoredField::Enveloped { kid, ciphertext } if *kid != primary => {
                match self.decrypt(kid, ciphertext) {
                    Ok(text) => Some(self.encrypt(&text)),
                    Err(e) => {
                        self.metrics.encryption_rotate_failures.inc();
                        warn!(kid = %kid, error = %e, "cannot rotate field");
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Seal every string value of an enrichment map; other values stay as-is
    pub fn encrypt_enrichment(&self, enrichment: &Enrichment) -> Enrichment {
        if !self.is_enabled() {
            return enrichment.clone();
        }
        enrichment
            .iter()
            .map(|(name, value)| {
                let sealed = match value {
                    Value::String(text) => self.encrypt(text).to_json(),
                    other => other.clone(),
                };
                (name.clone(), sealed)
            })
            .collect()
    }

    /// Open every envelope in an enrichment map; returns names left sealed
    pub fn open_enrichment(&self, enrichment: &Enrichment) -> (Enrichment, Vec<String>) {
        let mut sealed = Vec::new();
        let opened = enrichment
            .iter()
            .map(|(name, value)| {
                let value = match StoredField::from_json(value) {
                    Some(field @ StoredField::Enveloped { .. }) => match self.open(&field) {
                        Opened::Text(text) => Value::String(text),
                        Opened::Sealed { .. } => {
                            sealed.push(name.clone());
                            value.clone()
                        }
                    },
                    _ => value.clone(),
                };
                (name.clone(), value)
            })
            .collect();
        (opened, sealed)
    }

    /// Re-seal enrichment envelopes under the primary key; `None` if unchanged
    pub fn reencrypt_enrichment(&self, enrichment: &Enrichment) -> Option<Enrichment> {
        let mut changed = false;
        let rotated = enrichment
            .iter()
            .map(|(name, value)| {
                let value = match StoredField::from_json(value).and_then(|f| self.reencrypt(&f)) {
                    Some(field) => {
                        changed = true;
                        field.to_json()
                    }
                    None => value.clone(),
                };
                (name.clone(), value)
            })
            .collect();
        changed.then_some(rotated)
    }
}

fn seal(key: &KeyBytes, plaintext: &[u8]) -> Result<String, EnvelopeError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EnvelopeError::Authentication)?;
    let nonce = Aes256Gcm::generate_nonce(OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EnvelopeError::Authentication)?;

    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
}

fn open(key: &KeyBytes, encoded: &str) -> Result<String, EnvelopeError> {
    let data = STANDARD.decode(encoded).map_err(|_| EnvelopeError::Encoding)?;
    if data.len() <= NONCE_LEN {
        return Err(EnvelopeError::Truncated);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EnvelopeError::Authentication)?;
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EnvelopeError::Authentication)?;
    String::from_utf8(plain).map_err(|_| EnvelopeError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{EncryptionSettings, KeyPolicy, KEY_LEN};

    fn codec(primary: &str, keys: &[(&str, u8)]) -> EnvelopeCodec {
        let metrics = Arc::new(PipelineMetrics::new());
        let settings = EncryptionSettings {
            enabled: true,
            keys: keys
                .iter()
                .map(|(kid, byte)| (kid.to_string(), STANDARD.encode([*byte; KEY_LEN])))
                .collect(),
            primary_key_id: Some(primary.to_string()),
            ..Default::default()
        };
        let store =
            KeyMaterialStore::load(Box::new(settings), KeyPolicy::Strict, metrics.clone()).unwrap();
        EnvelopeCodec::new(Arc::new(store), metrics)
    }

    #[test]
    fn test_encrypt_then_open() {
        let codec = codec("k1", &[("k1", 1)]);
        let field = codec.encrypt("bp 120/80");

        assert_eq!(field.kid(), Some("k1"));
        assert_eq!(codec.open(&field), Opened::Text("bp 120/80".to_string()));
    }

    #[test]
    fn test_nonces_differ_per_write() {
        let codec = codec("k1", &[("k1", 1)]);
        assert_ne!(codec.encrypt("same"), codec.encrypt("same"));
    }

    #[test]
    fn test_disabled_stores_plaintext() {
        let metrics = Arc::new(PipelineMetrics::new());
        let codec = EnvelopeCodec::new(Arc::new(KeyMaterialStore::disabled(metrics.clone())), metrics);

        assert_eq!(codec.encrypt("note"), StoredField::PlainText("note".to_string()));
    }

    #[test]
    fn test_unknown_kid_stays_sealed() {
        let writer = codec("k1", &[("k1", 1)]);
        let reader = codec("k2", &[("k2", 2)]);
        let field = writer.encrypt("secret");

        let opened = reader.open(&field);
        assert!(opened.is_sealed());
        assert_eq!(opened.into_display(), field.to_column());
    }

    #[test]
    fn test_tampered_ciphertext_stays_sealed() {
        let codec = codec("k1", &[("k1", 1)]);
        let StoredField::Enveloped { kid, ciphertext } = codec.encrypt("secret") else {
            panic!("expected envelope");
        };
        let mut bytes = STANDARD.decode(&ciphertext).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let tampered = StoredField::enveloped(kid, STANDARD.encode(bytes));
        assert!(codec.open(&tampered).is_sealed());
    }

    #[test]
    fn test_reencrypt_moves_to_primary() {
        let old = codec("k1", &[("k1", 1)]);
        let both = codec("k2", &[("k1", 1), ("k2", 2)]);
        let field = old.encrypt("rotate me");

        let rotated = both.reencrypt(&field).unwrap();
        assert_eq!(rotated.kid(), Some("k2"));
        assert_eq!(both.open(&rotated), Opened::Text("rotate me".to_string()));
        assert!(both.reencrypt(&rotated).is_none());
    }

    #[test]
    fn test_enrichment_strings_are_sealed() {
        let codec = codec("k1", &[("k1", 1)]);
        let mut enrichment = Enrichment::new();
        enrichment.insert("note".into(), Value::String("allergic".into()));
        enrichment.insert("medications".into(), serde_json::json!(["aspirin"]));

        let sealed = codec.encrypt_enrichment(&enrichment);
        assert!(sealed["note"].is_object());
        assert_eq!(sealed["medications"], serde_json::json!(["aspirin"]));

        let (opened, still_sealed) = codec.open_enrichment(&sealed);
        assert_eq!(opened, enrichment);
        assert!(still_sealed.is_empty());
    }
}
