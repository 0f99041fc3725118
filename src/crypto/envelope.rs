//! AES-256-GCM envelope cipher
//!
//! Wire format of an encrypted object:
//!
//! ```text
//! u32 big-endian wrapped key length || wrapped data key || nonce (12) || ciphertext || tag (16)
//! ```

use super::{CryptoError, KeyEncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::sync::Arc;
use zeroize::Zeroizing;

const LEN_PREFIX: usize = 4;

/// Bodies at least this large are sealed and opened on the blocking pool.
const BLOCKING_THRESHOLD: usize = 64 * 1024;

/// Ready-to-use cipher handle for one key identifier.
pub struct EnvelopeCipher {
    kek: Arc<dyn KeyEncryptionKey>,
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("key_id", &self.kek.key_id())
            .finish()
    }
}

impl EnvelopeCipher {
    pub fn new(kek: Arc<dyn KeyEncryptionKey>) -> Self {
        Self { kek }
    }

    pub fn key_id(&self) -> &str {
        self.kek.key_id()
    }

    /// Encrypt a whole object body under a fresh data key.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut data_key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut data_key[..]);
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = if plaintext.len() < BLOCKING_THRESHOLD {
            seal(&data_key[..], &nonce, plaintext)?
        } else {
            let key = data_key.clone();
            let plaintext = plaintext.to_vec();
            tokio::task::spawn_blocking(move || seal(&key[..], &nonce, &plaintext))
                .await
                .map_err(|e| CryptoError::EncryptionFailed(format!("cipher task failed: {}", e)))??
        };
        let wrapped = self.kek.wrap_key(&data_key[..]).await?;

        let wrapped_len = u32::try_from(wrapped.len()).map_err(|_| {
            CryptoError::EncryptionFailed("wrapped data key too large".to_string())
        })?;
        let mut out = Vec::with_capacity(LEN_PREFIX + wrapped.len() + NONCE_SIZE + sealed.len());
        out.extend_from_slice(&wrapped_len.to_be_bytes());
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt a whole object body. Truncated, tampered, or foreign-key input
    /// is rejected; no partial plaintext is ever produced.
    pub async fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < LEN_PREFIX {
            return Err(truncated());
        }
        let (prefix, rest) = data.split_at(LEN_PREFIX);
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(prefix);
        let wrapped_len = u32::from_be_bytes(len_bytes) as usize;

        if rest.len() < wrapped_len.saturating_add(NONCE_SIZE + TAG_SIZE) {
            return Err(truncated());
        }
        let (wrapped, rest) = rest.split_at(wrapped_len);
        let (nonce, sealed) = rest.split_at(NONCE_SIZE);

        let data_key = Zeroizing::new(self.kek.unwrap_key(wrapped).await?);
        if data_key.len() != KEY_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "unwrapped data key has {} bytes",
                data_key.len()
            )));
        }

        if sealed.len() < BLOCKING_THRESHOLD {
            return open(&data_key[..], nonce, sealed);
        }
        let nonce = nonce.to_vec();
        let sealed = sealed.to_vec();
        tokio::task::spawn_blocking(move || open(&data_key[..], &nonce, &sealed))
            .await
            .map_err(|e| CryptoError::DecryptionFailed(format!("cipher task failed: {}", e)))?
    }
}

fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

fn open(key: &[u8], nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| {
            CryptoError::DecryptionFailed(
                "ciphertext failed authentication (corrupted or wrong key)".to_string(),
            )
        })
}

fn truncated() -> CryptoError {
    CryptoError::DecryptionFailed("ciphertext is truncated".to_string())
}
