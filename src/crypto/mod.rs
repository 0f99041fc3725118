//! Envelope encryption: key management seam, cipher, and the cipher cache
//!
//! Object bodies are encrypted with a fresh data key per object; the data key
//! is wrapped by a key-encryption key obtained from a [`KmsClient`] and stored
//! in front of the ciphertext. Ciphertext is opaque and atomic: it can only be
//! decrypted as a whole.

mod cache;
mod envelope;
mod kms;

pub use cache::CipherCache;
pub use envelope::EnvelopeCipher;
pub use kms::{KeyEncryptionKey, KmsClient, LocalKms};

use thiserror::Error;

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("{0}")]
    EncryptionFailed(String),

    #[error("{0}")]
    DecryptionFailed(String),

    #[error("key {key_id}: {reason}")]
    BackendUnavailable { key_id: String, reason: String },

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}
