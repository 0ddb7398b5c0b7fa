//! Field-level envelope encryption.
//!
//! - `keys`: key material loading, policy, reload
//! - `envelope`: AES-256-GCM seal/open of single fields
//! - `rotation`: batched re-encryption under the primary key

pub mod envelope;
pub mod keys;
pub mod rotation;

pub use envelope::{EnvelopeCodec, EnvelopeError, Opened};
pub use keys::{
    parse_key_list, EncryptionSettings, KeyError, KeyMaterialStore, KeyPolicy, KeyRing, KeySource,
    KEY_LEN,
};
pub use rotation::{KeyRotationJob, RotationReport};
