//! Per-operation request/response transforms
//!
//! Split into submodules by operation shape:
//! - `upload`: multipart and single-part (media) uploads
//! - `resumable`: resumable session init and completion
//! - `metadata`: object resource fetches
//! - `download`: media downloads, with client range slicing

mod download;
mod metadata;
mod resumable;
mod upload;

pub use download::{parse_range, DownloadHandler};
pub use metadata::MetadataHandler;
pub use resumable::{
    upload_id_from_response, validate_content_range, ResumableInitHandler, ResumablePutHandler,
};
pub use upload::{MultipartUploadHandler, SinglePartUploadHandler};

use crate::crypto::CipherCache;
use crate::errors::ProxyError;
use crate::exchange::{Exchange, ProxyRequest};
use crate::keys::KeyResolver;
use crate::session::SessionStore;
use crate::types::{private_headers, ObjectSidecar, OperationKind};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Shared components every handler may use. Built once per engine.
pub struct HandlerContext {
    pub resolver: Arc<dyn KeyResolver>,
    pub ciphers: CipherCache,
    pub sessions: Arc<dyn SessionStore>,
    /// Written as `x-proxy-version` on every stored object
    pub proxy_version: String,
}

/// Request/response transform pair for one [`OperationKind`].
///
/// `on_response` is only called when the exchange carries a response, and
/// always after `on_request` of the same handler on the same exchange.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn on_request(&self, ctx: &HandlerContext, exchange: &mut Exchange)
        -> Result<(), ProxyError>;

    async fn on_response(
        &self,
        ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError>;
}

/// Dispatch table. `PassThrough` has no handler.
pub fn handler_for(kind: OperationKind) -> Option<&'static dyn OperationHandler> {
    match kind {
        OperationKind::MultipartUpload => Some(&MultipartUploadHandler),
        OperationKind::SinglePartUpload => Some(&SinglePartUploadHandler),
        OperationKind::ResumableInit => Some(&ResumableInitHandler),
        OperationKind::ResumablePut => Some(&ResumablePutHandler),
        OperationKind::SimpleDownload => Some(&DownloadHandler),
        OperationKind::MetadataRequest => Some(&MetadataHandler),
        OperationKind::PassThrough => None,
    }
}

// ---------------------------------------------------------------------------
// Shared utility functions used across handler submodules
// ---------------------------------------------------------------------------

/// Record plaintext facts on the request for the paired response handler.
fn stash_plaintext_facts(req: &mut ProxyRequest, original_len: usize, sidecar: &ObjectSidecar) {
    req.set_header(
        private_headers::ORIGINAL_CONTENT_LENGTH,
        &original_len.to_string(),
    );
    req.set_header(
        private_headers::UNENCRYPTED_FILE_SIZE,
        &sidecar.unencrypted_content_length.to_string(),
    );
    req.set_header(private_headers::ORIGINAL_MD5_HASH, &sidecar.md5_hash);
}

/// Key for an upload bound for `bucket`, else the key of the bucket named in
/// the request URL. An upload the classifier routed here never leaves in the
/// clear: with neither mapped it fails.
fn upload_key(
    ctx: &HandlerContext,
    bucket: &str,
    url_bucket: Option<&str>,
) -> Result<String, ProxyError> {
    let key_id = ctx.resolver.resolve(bucket);
    if !key_id.is_empty() {
        return Ok(key_id);
    }
    if let Some(url_bucket) = url_bucket.filter(|b| *b != bucket) {
        let key_id = ctx.resolver.resolve(url_bucket);
        if !key_id.is_empty() {
            debug!(
                "No key for bucket {}, using the key of {}",
                bucket, url_bucket
            );
            return Ok(key_id);
        }
    }
    Err(ProxyError::EncryptionFailed(format!(
        "no encryption key for bucket {}",
        bucket
    )))
}

/// Parse a body that must hold a JSON object (an object resource).
fn parse_resource(body: &[u8]) -> Result<Map<String, Value>, ProxyError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProxyError::InvalidJson(
            "expected an object resource".to_string(),
        )),
        Err(e) => Err(ProxyError::InvalidJson(e.to_string())),
    }
}

fn serialize_resource(resource: Map<String, Value>) -> Vec<u8> {
    // Serializing a Map<String, Value> cannot fail.
    serde_json::to_vec(&Value::Object(resource)).unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_table_covers_intercepted_kinds() {
        for kind in [
            OperationKind::MultipartUpload,
            OperationKind::SinglePartUpload,
            OperationKind::ResumableInit,
            OperationKind::ResumablePut,
            OperationKind::SimpleDownload,
            OperationKind::MetadataRequest,
        ] {
            assert!(handler_for(kind).is_some(), "{} has no handler", kind);
        }
        assert!(handler_for(OperationKind::PassThrough).is_none());
    }

    #[test]
    fn test_upload_key_falls_back_to_url_bucket() {
        let ctx = tests_support::context();
        assert_eq!(upload_key(&ctx, "photos", None).unwrap(), "K");
        assert_eq!(upload_key(&ctx, "other", Some("photos")).unwrap(), "K");
        assert!(matches!(
            upload_key(&ctx, "other", Some("other")),
            Err(ProxyError::EncryptionFailed(_))
        ));
        assert!(matches!(
            upload_key(&ctx, "other", None),
            Err(ProxyError::EncryptionFailed(_))
        ));
    }

    #[test]
    fn test_parse_resource_rejects_non_objects() {
        assert!(parse_resource(br#"{"a":1}"#).is_ok());
        assert!(matches!(
            parse_resource(b"[1]"),
            Err(ProxyError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_resource(b"<html>"),
            Err(ProxyError::InvalidJson(_))
        ));
    }
}
