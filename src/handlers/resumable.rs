//! Resumable uploads
//!
//! Only the single-request form is supported: the init call opens a session,
//! and one PUT carries the entire object. That PUT is rewritten into an
//! encrypted multipart upload of the object recorded at init.

use super::upload::{convert_to_multipart, restore_upload_response};
use super::{parse_resource, upload_key, HandlerContext, OperationHandler};
use crate::classifier::bucket_from_path;
use crate::errors::ProxyError;
use crate::exchange::{Exchange, ProxyResponse, QueryParams};
use crate::session::ResumableSession;
use crate::types::storage_headers;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

/// Resumable session initiation (`POST`).
pub struct ResumableInitHandler;

/// Resumable session data leg (`PUT ?upload_id=`).
pub struct ResumablePutHandler;

#[async_trait]
impl OperationHandler for ResumableInitHandler {
    async fn on_request(
        &self,
        _ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        // The declared length describes plaintext; the ciphertext length is
        // not known until completion.
        exchange
            .request
            .remove_header(storage_headers::UPLOAD_CONTENT_LENGTH);
        Ok(())
    }

    #[instrument(skip_all, fields(path = %exchange.request.path))]
    async fn on_response(
        &self,
        ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let request = &exchange.request;
        let response = match exchange.response.as_ref() {
            Some(response) => response,
            None => return Ok(()),
        };
        if !response.is_success() {
            warn!(
                "Resumable init failed upstream with {}, no session recorded",
                response.status
            );
            return Ok(());
        }

        let upload_id = upload_id_from_response(response).ok_or(ProxyError::MissingUploadId)?;

        let resource = if request.body.iter().all(u8::is_ascii_whitespace) {
            serde_json::Map::new()
        } else {
            parse_resource(&request.body)?
        };
        let field = |name: &str| {
            resource
                .get(name)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let object_name = field("name")
            .or_else(|| request.query.get("name").map(str::to_string))
            .filter(|n| !n.is_empty())
            .ok_or(ProxyError::MissingObjectName)?;
        let bucket = field("bucket")
            .or_else(|| bucket_from_path(&request.path))
            .unwrap_or_default();
        let content_type = field("contentType").or_else(|| {
            request
                .header(storage_headers::UPLOAD_CONTENT_TYPE)
                .map(str::to_string)
        });

        info!(
            "Opened resumable session {} for {}/{}",
            upload_id, bucket, object_name
        );
        ctx.sessions
            .put(
                &upload_id,
                ResumableSession::new(bucket, object_name, content_type),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for ResumablePutHandler {
    #[instrument(skip_all, fields(path = %exchange.request.path))]
    async fn on_request(
        &self,
        ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let req = &mut exchange.request;
        validate_content_range(req.header("content-range"), req.body.len())?;

        let upload_id = req
            .query
            .get("upload_id")
            .filter(|id| !id.is_empty())
            .ok_or(ProxyError::MissingUploadId)?
            .to_string();
        let session = ctx.sessions.take(&upload_id).await?;
        debug!(
            "Completing resumable session {} as {}/{}",
            upload_id, session.bucket, session.object_name
        );
        let url_bucket = bucket_from_path(&req.path);
        let key_id = upload_key(ctx, &session.bucket, url_bucket.as_deref())?;

        req.path = format!(
            "/upload/storage/v1/b/{}/o",
            urlencoding::encode(&session.bucket)
        );
        let mut query: QueryParams = req
            .query
            .iter()
            .filter(|(k, _)| !matches!(*k, "upload_id" | "uploadType" | "name"))
            .collect();
        query.set("name", session.object_name.as_str());
        req.query = query;

        if req.header("content-type").map_or(true, str::is_empty) {
            if let Some(content_type) = &session.content_type {
                req.set_header("content-type", content_type);
            }
        }

        convert_to_multipart(ctx, req, &session.bucket, &key_id).await
    }

    async fn on_response(
        &self,
        _ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        restore_upload_response(exchange)
    }
}

/// Upload id assigned by the service: the `upload_id` parameter of the
/// `Location` header, else the `X-GUploader-UploadID` header.
pub fn upload_id_from_response(response: &ProxyResponse) -> Option<String> {
    response
        .header("location")
        .and_then(|location| location.split_once('?'))
        .and_then(|(_, query)| {
            QueryParams::parse(query)
                .get("upload_id")
                .map(str::to_string)
        })
        .or_else(|| {
            response
                .header(storage_headers::UPLOAD_ID)
                .map(str::to_string)
        })
        .filter(|id| !id.is_empty())
}

/// Accept only a PUT that carries the whole object: no `Content-Range`,
/// `bytes 0-{n-1}/{n}` matching the body, or `bytes */0` with an empty body.
pub fn validate_content_range(header: Option<&str>, body_len: usize) -> Result<(), ProxyError> {
    let raw = match header {
        None => return Ok(()),
        Some(raw) => raw.trim(),
    };
    let unsupported = || ProxyError::UnsupportedByteRange(raw.to_string());

    let value = raw.strip_prefix("bytes ").ok_or_else(unsupported)?.trim();
    let (range, total) = value.split_once('/').ok_or_else(unsupported)?;
    let total: usize = total.trim().parse().map_err(|_| unsupported())?;

    if range.trim() == "*" {
        return if total == 0 && body_len == 0 {
            Ok(())
        } else {
            Err(unsupported())
        };
    }

    let (start, end) = range.split_once('-').ok_or_else(unsupported)?;
    let start: usize = start.trim().parse().map_err(|_| unsupported())?;
    let end: usize = end.trim().parse().map_err(|_| unsupported())?;
    if start != 0 || end.checked_add(1) != Some(total) || total != body_len {
        return Err(unsupported());
    }
    Ok(())
}
