//! Cipher handle cache keyed by key identifier

use super::{CryptoError, EnvelopeCipher, KmsClient};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on distinct key identifiers held at once
const MAX_CACHED_KEYS: u64 = 1024;

/// Amortizes key-handle construction across requests.
///
/// A handle is reused while it has been used within the last `ttl`; each hit
/// refreshes its idle timer. Concurrent misses for one key identifier share a
/// single construction, and failed constructions are not cached.
#[derive(Clone)]
pub struct CipherCache {
    kms: Arc<dyn KmsClient>,
    ciphers: Cache<String, Arc<EnvelopeCipher>>,
}

impl CipherCache {
    pub fn new(kms: Arc<dyn KmsClient>, ttl: Duration) -> Self {
        Self {
            kms,
            ciphers: Cache::builder()
                .max_capacity(MAX_CACHED_KEYS)
                .time_to_idle(ttl)
                .build(),
        }
    }

    /// Get or construct the cipher handle for `key_id`.
    pub async fn get(&self, key_id: &str) -> Result<Arc<EnvelopeCipher>, CryptoError> {
        let kms = Arc::clone(&self.kms);
        let owned_id = key_id.to_string();
        self.ciphers
            .try_get_with(key_id.to_string(), async move {
                debug!("Building cipher handle for key {}", owned_id);
                let kek = kms.key_handle(&owned_id).await?;
                Ok::<_, CryptoError>(Arc::new(EnvelopeCipher::new(kek)))
            })
            .await
            .map_err(|e| {
                warn!("Cipher construction failed for key {}: {}", key_id, e);
                match e.as_ref() {
                    CryptoError::BackendUnavailable { .. } => (*e).clone(),
                    other => CryptoError::BackendUnavailable {
                        key_id: key_id.to_string(),
                        reason: other.to_string(),
                    },
                }
            })
    }

    pub async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.get(key_id).await?.encrypt(plaintext).await
    }

    pub async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.get(key_id).await?.decrypt(ciphertext).await
    }

    /// Number of live handles (approximate until pending maintenance runs)
    pub fn entry_count(&self) -> u64 {
        self.ciphers.entry_count()
    }

    pub async fn run_pending_tasks(&self) {
        self.ciphers.run_pending_tasks().await;
    }
}
