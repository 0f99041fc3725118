//! Transformation engine: the two hooks a proxy calls per exchange

use crate::classifier::RequestClassifier;
use crate::config::{Config, ConfigError, KmsConfig};
use crate::crypto::{CipherCache, CryptoError, KmsClient, LocalKms};
use crate::errors::ProxyError;
use crate::exchange::Exchange;
use crate::handlers::{handler_for, HandlerContext};
use crate::keys::KeyResolver;
use crate::session::{self, SessionError, SessionStore};
use crate::types::OperationKind;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// Errors building the engine at startup
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Key management error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Session store error: {0}")]
    Session(#[from] SessionError),

    #[error("Key {key_id} failed verification: {reason}")]
    KeyVerification { key_id: String, reason: String },
}

/// Round-tripped through every mapped key before the engine serves traffic
const KEY_CHECK_PLAINTEXT: &[u8] = b"gcs-envelope-proxy key check";

/// Classifies each exchange once and dispatches it to its handler pair.
///
/// Safe to share across tasks: each exchange is exclusive to its caller, and
/// the cipher cache and session store synchronize internally.
pub struct TransformEngine {
    classifier: RequestClassifier,
    ctx: HandlerContext,
    encryption_disabled: bool,
    key_ids: Vec<String>,
}

impl TransformEngine {
    /// Build the engine and its collaborators from configuration.
    pub async fn from_config(config: &Config) -> Result<Self, EngineError> {
        config.validate()?;
        let kms: Arc<dyn KmsClient> = match &config.kms {
            KmsConfig::Local {
                master_key: Some(master_key),
            } => Arc::new(LocalKms::from_hex(master_key)?),
            // Only reachable with encryption disabled; no key is ever requested.
            KmsConfig::Local { master_key: None } => Arc::new(LocalKms::new(&[0u8; 32])?),
        };
        let sessions = session::from_config(&config.session_store, config.session_ttl()?).await?;
        let engine = Self::new(config, kms, sessions)?;
        engine.verify_keys().await?;
        Ok(engine)
    }

    /// Build the engine around explicit collaborators.
    pub fn new(
        config: &Config,
        kms: Arc<dyn KmsClient>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self, EngineError> {
        let mapping = config.key_mapping()?;
        if mapping.is_empty() && !config.encryption_disabled {
            info!("No bucket key mapping configured; all traffic passes through");
        }
        let key_ids = mapping.key_ids().into_iter().map(str::to_string).collect();
        let resolver: Arc<dyn KeyResolver> = Arc::new(mapping);

        Ok(Self {
            classifier: RequestClassifier::new(
                Arc::clone(&resolver),
                config.intercept_hosts.clone(),
            ),
            ctx: HandlerContext {
                resolver,
                ciphers: CipherCache::new(kms, config.cipher_cache_ttl()?),
                sessions,
                proxy_version: config.proxy_version.clone(),
            },
            encryption_disabled: config.encryption_disabled,
            key_ids,
        })
    }

    /// Encrypt and decrypt a fixed plaintext under every mapped key, so an
    /// unusable key fails startup instead of the first upload. Leaves each
    /// cipher cached. A no-op with encryption disabled.
    pub async fn verify_keys(&self) -> Result<(), EngineError> {
        if self.encryption_disabled {
            return Ok(());
        }
        for key_id in &self.key_ids {
            let failed = |reason: String| EngineError::KeyVerification {
                key_id: key_id.clone(),
                reason,
            };
            let cipher = self
                .ctx
                .ciphers
                .get(key_id)
                .await
                .map_err(|e| failed(e.to_string()))?;
            let sealed = cipher
                .encrypt(KEY_CHECK_PLAINTEXT)
                .await
                .map_err(|e| failed(e.to_string()))?;
            let opened = cipher
                .decrypt(&sealed)
                .await
                .map_err(|e| failed(e.to_string()))?;
            if opened != KEY_CHECK_PLAINTEXT {
                return Err(failed("decrypted text does not match".to_string()));
            }
            info!("Verified key {}", key_id);
        }
        Ok(())
    }

    /// Request hook: classify, then transform the request before forwarding.
    #[instrument(skip_all, fields(method = %exchange.request.method, path = %exchange.request.path))]
    pub async fn on_request(&self, exchange: &mut Exchange) -> Result<OperationKind, ProxyError> {
        let kind = if self.encryption_disabled {
            OperationKind::PassThrough
        } else {
            self.classifier.classify(&exchange.request)
        };
        exchange.kind = Some(kind);
        debug!("Classified as {}", kind);

        if let Some(handler) = handler_for(kind) {
            handler
                .on_request(&self.ctx, exchange)
                .await
                .inspect_err(|e| error!("{} request transform failed: {}", kind, e))?;
        }
        Ok(kind)
    }

    /// Response hook: transform the upstream response before it reaches the
    /// client. Uses the kind assigned by [`Self::on_request`].
    #[instrument(skip_all, fields(method = %exchange.request.method, path = %exchange.request.path))]
    pub async fn on_response(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let kind = exchange.kind.unwrap_or(OperationKind::PassThrough);
        if exchange.response.is_none() {
            return Ok(());
        }
        if let Some(handler) = handler_for(kind) {
            handler
                .on_response(&self.ctx, exchange)
                .await
                .inspect_err(|e| error!("{} response transform failed: {}", kind, e))?;
        }
        Ok(())
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.ctx.sessions
    }

    pub fn ciphers(&self) -> &CipherCache {
        &self.ctx.ciphers
    }

    pub fn resolver(&self) -> &Arc<dyn KeyResolver> {
        &self.ctx.resolver
    }
}
