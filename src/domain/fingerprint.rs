//! Content fingerprints used as the sole deduplication identity.
//!
//! A fingerprint is `sha256(filename + "::" + text)`, hex encoded. Two messages
//! with the same filename and text are the same message, whatever their
//! correlation id or publish time. Reprocessing tooling relies on this exact
//! derivation, so it must not change.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `filename::text`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for a filename/text pair
    pub fn derive(filename: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(filename.as_bytes());
        hasher.update(b"::");
        hasher.update(text.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_matches_reference_derivation() {
        // sha256("a.wav::hello")
        let mut hasher = Sha256::new();
        hasher.update("a.wav::hello".as_bytes());
        let expected = hex::encode(hasher.finalize());

        assert_eq!(Fingerprint::derive("a.wav", "hello").as_str(), expected);
    }

    #[test]
    fn test_fingerprint_is_content_only() {
        let a = Fingerprint::derive("a.wav", "hello");
        let b = Fingerprint::derive("a.wav", "hello");
        let c = Fingerprint::derive("a.wav", "hello!");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_separator_prevents_boundary_collisions() {
        assert_ne!(
            Fingerprint::derive("ab", "c"),
            Fingerprint::derive("a", "bc")
        );
    }
}
