//! Key management seam and the local key-encryption-key provider

use super::{CryptoError, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// A key-encryption key: wraps and unwraps per-object data keys.
#[async_trait]
pub trait KeyEncryptionKey: Send + Sync {
    /// Identifier this key was obtained for
    fn key_id(&self) -> &str;

    async fn wrap_key(&self, data_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Key management backend.
///
/// `key_handle` is the potentially slow, network-bound step; callers go
/// through [`super::CipherCache`] rather than calling it per request.
#[async_trait]
pub trait KmsClient: Send + Sync {
    async fn key_handle(&self, key_id: &str) -> Result<Arc<dyn KeyEncryptionKey>, CryptoError>;
}

/// Derives key-encryption keys locally: `KEK = HMAC-SHA256(master_key, key_id)`.
///
/// The master key is zeroed when the provider is dropped.
pub struct LocalKms {
    master_key: [u8; KEY_SIZE],
}

impl Drop for LocalKms {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

impl std::fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKms").finish_non_exhaustive()
    }
}

impl LocalKms {
    pub fn new(master_key: &[u8]) -> Result<Self, CryptoError> {
        if master_key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "master key must be exactly {} bytes, got {}",
                KEY_SIZE,
                master_key.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(master_key);
        Ok(Self { master_key: key })
    }

    /// Create a provider from a hex-encoded master key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(hex_key.trim())
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("master key is not hex: {}", e)))?;
        let kms = Self::new(&bytes);
        bytes.zeroize();
        kms
    }

    fn derive(&self, key_id: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.master_key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        mac.update(key_id.as_bytes());
        let mut kek = [0u8; KEY_SIZE];
        kek.copy_from_slice(&mac.finalize().into_bytes());
        Ok(kek)
    }
}

#[async_trait]
impl KmsClient for LocalKms {
    async fn key_handle(&self, key_id: &str) -> Result<Arc<dyn KeyEncryptionKey>, CryptoError> {
        if key_id.is_empty() {
            return Err(CryptoError::BackendUnavailable {
                key_id: String::new(),
                reason: "empty key identifier".to_string(),
            });
        }
        let kek = self.derive(key_id)?;
        Ok(Arc::new(LocalKek {
            key_id: key_id.to_string(),
            kek,
        }))
    }
}

/// Locally derived key-encryption key. Wrapped keys are
/// `nonce || AES-256-GCM(kek, data_key, aad = key_id)`.
struct LocalKek {
    key_id: String,
    kek: [u8; KEY_SIZE],
}

impl Drop for LocalKek {
    fn drop(&mut self) {
        self.kek.zeroize();
    }
}

impl LocalKek {
    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.kek))
    }
}

#[async_trait]
impl KeyEncryptionKey for LocalKek {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn wrap_key(&self, data_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: data_key,
                    aad: self.key_id.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(format!("wrapping data key: {}", e)))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + sealed.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wrapped.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(
                "wrapped data key is truncated".to_string(),
            ));
        }
        let (nonce, sealed) = wrapped.split_at(NONCE_SIZE);
        self.cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: self.key_id.as_bytes(),
                },
            )
            .map_err(|_| {
                CryptoError::DecryptionFailed(format!(
                    "data key cannot be unwrapped with key {}",
                    self.key_id
                ))
            })
    }
}
