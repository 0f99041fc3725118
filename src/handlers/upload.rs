//! Multipart and single-part uploads
//!
//! Both shapes leave the proxy as a multipart/related upload whose payload
//! part is ciphertext and whose object resource carries the plaintext sidecar.

use super::{
    parse_resource, serialize_resource, stash_plaintext_facts, upload_key, HandlerContext,
    OperationHandler,
};
use crate::classifier::bucket_from_path;
use crate::errors::ProxyError;
use crate::exchange::{Exchange, ProxyRequest, ProxyResponse, QueryParams};
use crate::multipart::{generate_boundary, related_content_type, MultipartCodec, PartHeaders};
use crate::types::{private_headers, ObjectSidecar, PlaintextFacts};
use async_trait::async_trait;
use axum::http::Method;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

/// `uploadType=multipart`: encrypt the payload part in place.
pub struct MultipartUploadHandler;

/// `uploadType=media`: rewrite into a multipart upload.
pub struct SinglePartUploadHandler;

#[async_trait]
impl OperationHandler for MultipartUploadHandler {
    #[instrument(skip_all, fields(path = %exchange.request.path))]
    async fn on_request(
        &self,
        ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let req = &mut exchange.request;
        let content_type = req
            .header("content-type")
            .ok_or_else(|| ProxyError::MalformedMultipart("missing Content-Type".to_string()))?;
        let mut body = MultipartCodec::parse(&req.body, content_type)?;

        // The resource may name the bucket as "bucket" or "bucket/..."
        let url_bucket = bucket_from_path(&req.path);
        let bucket = body
            .metadata
            .get("bucket")
            .and_then(Value::as_str)
            .and_then(|b| b.split('/').next())
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .or_else(|| url_bucket.clone())
            .unwrap_or_default();
        let key_id = upload_key(ctx, &bucket, url_bucket.as_deref())?;

        let original_len = req.body.len();
        let sidecar = ObjectSidecar::for_plaintext(&body.payload, &key_id, &ctx.proxy_version);
        body.payload = ctx.ciphers.encrypt(&key_id, &body.payload).await?;
        sidecar.write_into(&mut body.metadata);

        info!(
            "Encrypting multipart upload to {} ({} bytes plaintext)",
            bucket, sidecar.unencrypted_content_length
        );
        stash_plaintext_facts(req, original_len, &sidecar);
        req.set_body(body.to_bytes());
        Ok(())
    }

    async fn on_response(
        &self,
        _ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        restore_upload_response(exchange)
    }
}

#[async_trait]
impl OperationHandler for SinglePartUploadHandler {
    #[instrument(skip_all, fields(path = %exchange.request.path))]
    async fn on_request(
        &self,
        ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let bucket = bucket_from_path(&exchange.request.path).unwrap_or_default();
        let key_id = upload_key(ctx, &bucket, None)?;
        convert_to_multipart(ctx, &mut exchange.request, &bucket, &key_id).await
    }

    async fn on_response(
        &self,
        _ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        restore_upload_response(exchange)
    }
}

/// Rewrite a single-part upload of the request body into a two-part
/// multipart upload of object `name` (query parameter) in `bucket`, the
/// payload encrypted under `key_id`.
pub(super) async fn convert_to_multipart(
    ctx: &HandlerContext,
    req: &mut ProxyRequest,
    bucket: &str,
    key_id: &str,
) -> Result<(), ProxyError> {
    let object_name = req
        .query
        .get("name")
        .filter(|n| !n.is_empty())
        .ok_or(ProxyError::MissingObjectName)?
        .to_string();

    let content_type = req
        .header("content-type")
        .filter(|ct| !ct.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let plaintext = req.body.clone();
    let sidecar = ObjectSidecar::for_plaintext(&plaintext, key_id, &ctx.proxy_version);
    let ciphertext = ctx.ciphers.encrypt(key_id, &plaintext).await?;

    let mut metadata = Map::new();
    metadata.insert("bucket".to_string(), Value::String(bucket.to_string()));
    metadata.insert("contentType".to_string(), Value::String(content_type.clone()));
    metadata.insert("name".to_string(), Value::String(object_name.clone()));
    sidecar.write_into(&mut metadata);

    // Preconditions and ACL parameters survive; name moves into the resource.
    let mut query: QueryParams = req
        .query
        .iter()
        .filter(|(k, _)| !matches!(*k, "name" | "uploadType" | "alt" | "upload_id"))
        .collect();
    query.set("uploadType", "multipart");
    query.set("alt", "json");
    req.query = query;
    req.method = Method::POST;

    let boundary = generate_boundary();
    let metadata_headers =
        PartHeaders::from_iter([("Content-Type", "application/json"), ("MIME-Version", "1.0")]);
    let payload_headers = PartHeaders::from_iter([
        ("Content-Type", content_type.as_str()),
        ("MIME-Version", "1.0"),
        ("Content-Transfer-Encoding", "binary"),
    ]);
    let body = MultipartCodec::build(
        &boundary,
        &metadata,
        &metadata_headers,
        &ciphertext,
        &payload_headers,
    );

    for name in [
        "expect",
        "content-range",
        "content-md5",
        "x-goog-hash",
        "x-upload-content-length",
        "x-upload-content-type",
    ] {
        req.remove_header(name);
    }
    req.set_header("content-type", &related_content_type(&boundary));
    req.set_header("accept", "application/json");
    stash_plaintext_facts(req, plaintext.len(), &sidecar);
    req.set_body(body);

    info!(
        "Converted upload of {}/{} to encrypted multipart ({} bytes plaintext)",
        bucket, object_name, sidecar.unencrypted_content_length
    );
    Ok(())
}

/// Replace the ciphertext `size`/`md5Hash` in an upload response with the
/// plaintext values stashed by the request handler.
pub(super) fn restore_upload_response(exchange: &mut Exchange) -> Result<(), ProxyError> {
    let Exchange {
        request, response, ..
    } = exchange;
    let response = match response.as_mut() {
        Some(response) => response,
        None => return Ok(()),
    };
    if !response.is_success() {
        warn!(
            "Upload to {} failed upstream with {}, response left untouched",
            request.path, response.status
        );
        return Ok(());
    }
    restore_facts(request, response)
}

fn restore_facts(request: &ProxyRequest, response: &mut ProxyResponse) -> Result<(), ProxyError> {
    let size_raw = request
        .header(private_headers::UNENCRYPTED_FILE_SIZE)
        .ok_or(ProxyError::MissingSidecarHeaders(
            private_headers::UNENCRYPTED_FILE_SIZE,
        ))?;
    let md5_hash = request
        .header(private_headers::ORIGINAL_MD5_HASH)
        .ok_or(ProxyError::MissingSidecarHeaders(
            private_headers::ORIGINAL_MD5_HASH,
        ))?;
    let size = size_raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ProxyError::InvalidSidecarHeader {
            name: private_headers::UNENCRYPTED_FILE_SIZE,
            value: size_raw.to_string(),
        })?;

    let mut resource = parse_resource(&response.body)?;
    PlaintextFacts {
        size,
        md5_hash: md5_hash.to_string(),
    }
    .apply_to(&mut resource);
    response.set_body(serialize_resource(resource));
    Ok(())
}
