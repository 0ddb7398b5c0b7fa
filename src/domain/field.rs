//! Stored representation of a possibly-encrypted text field.
//!
//! A column value is either plaintext (legacy rows, or encryption disabled) or an
//! envelope `{"enc": true, "kid": "<key id>", "v": "<base64(nonce || ciphertext)>"}`.
//! Detection is structural: a value is an envelope only if it parses as exactly
//! that object. Rows written by older deployments prefixed `v` with `ENC:`; that
//! prefix is stripped on read and never written.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const LEGACY_CIPHERTEXT_PREFIX: &str = "ENC:";

/// A text field as it sits in the Record Store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredField {
    /// Unencrypted text
    PlainText(String),

    /// Ciphertext sealed under key `kid`
    Enveloped { kid: String, ciphertext: String },
}

/// Wire form of [`StoredField::Enveloped`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvelopeWire {
    enc: bool,
    kid: String,
    v: String,
}

impl StoredField {
    pub fn enveloped(kid: impl Into<String>, ciphertext: impl Into<String>) -> Self {
        Self::Enveloped {
            kid: kid.into(),
            ciphertext: ciphertext.into(),
        }
    }

    /// Key id this field is sealed under, if any
    pub fn kid(&self) -> Option<&str> {
        match self {
            Self::PlainText(_) => None,
            Self::Enveloped { kid, .. } => Some(kid),
        }
    }

    pub fn is_enveloped(&self) -> bool {
        matches!(self, Self::Enveloped { .. })
    }

    /// Parse a TEXT column value
    pub fn from_column(raw: &str) -> Self {
        if raw.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                if let Some(field) = Self::from_json(&value) {
                    return field;
                }
            }
        }
        Self::PlainText(raw.to_string())
    }

    /// Render for a TEXT column
    pub fn to_column(&self) -> String {
        match self {
            Self::PlainText(text) => text.clone(),
            Self::Enveloped { .. } => self.to_json().to_string(),
        }
    }

    /// Interpret a JSON value (an enrichment entry) as a field.
    ///
    /// Returns `None` when the value is neither a string nor an envelope.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::PlainText(text.clone())),
            Value::Object(map) if is_envelope(map) => {
                let wire: EnvelopeWire = serde_json::from_value(value.clone()).ok()?;
                let ciphertext = wire
                    .v
                    .strip_prefix(LEGACY_CIPHERTEXT_PREFIX)
                    .unwrap_or(&wire.v)
                    .to_string();
                Some(Self::Enveloped {
                    kid: wire.kid,
                    ciphertext,
                })
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::PlainText(text) => Value::String(text.clone()),
            Self::Enveloped { kid, ciphertext } => serde_json::json!({
                "enc": true,
                "kid": kid,
                "v": ciphertext,
            }),
        }
    }
}

fn is_envelope(map: &Map<String, Value>) -> bool {
    map.get("enc").and_then(Value::as_bool) == Some(true)
        && map.get("kid").map(Value::is_string).unwrap_or(false)
        && map.get("v").map(Value::is_string).unwrap_or(false)
}
