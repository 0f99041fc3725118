//! Media downloads
//!
//! The whole ciphertext is always fetched: a client `Range` is held back on
//! the request and applied to the decrypted plaintext.

use super::{HandlerContext, OperationHandler};
use crate::classifier::bucket_from_path;
use crate::errors::ProxyError;
use crate::exchange::Exchange;
use crate::types::{base64_md5, private_headers, sidecar_keys, storage_headers};
use async_trait::async_trait;
use axum::http::StatusCode;
use std::ops::Range;
use tracing::{debug, instrument, warn};

pub struct DownloadHandler;

#[async_trait]
impl OperationHandler for DownloadHandler {
    async fn on_request(
        &self,
        _ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let req = &mut exchange.request;
        if let Some(range) = req.header("range").map(str::to_string) {
            debug!("Deferring client range {} until after decryption", range);
            req.remove_header("range");
            req.remove_header("if-range");
            req.set_header(private_headers::ORIGINAL_BYTE_RANGE, &range);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(path = %exchange.request.path))]
    async fn on_response(
        &self,
        ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let Exchange {
            request, response, ..
        } = exchange;
        let response = match response.as_mut() {
            Some(response) => response,
            None => return Ok(()),
        };
        if !response.is_success() {
            warn!(
                "Download of {} returned {}, left untouched",
                request.path, response.status
            );
            return Ok(());
        }

        let key_id = response
            .header(sidecar_keys::H_ENCRYPTION_KEY)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                bucket_from_path(&request.path)
                    .map(|bucket| ctx.resolver.resolve(&bucket))
                    .unwrap_or_default()
            });
        if key_id.is_empty() {
            debug!("No key for {}, body forwarded as stored", request.path);
            return Ok(());
        }

        let mut plaintext = ctx.ciphers.decrypt(&key_id, &response.body).await?;
        let total = plaintext.len();

        match request.header(private_headers::ORIGINAL_BYTE_RANGE) {
            Some(raw) => {
                let range = parse_range(raw, total)?;
                response.headers.insert(
                    "content-range",
                    content_range(&range, total)
                        .parse()
                        .map_err(|_| ProxyError::InvalidRange(raw.to_string()))?,
                );
                response.status = StatusCode::PARTIAL_CONTENT;
                plaintext.truncate(range.end);
                plaintext.drain(..range.start);
            }
            None => {
                response.headers.remove("content-range");
            }
        }

        debug!(
            "Decrypted {} ({} bytes returned of {})",
            request.path,
            plaintext.len(),
            total
        );
        response.set_header(
            storage_headers::STORED_CONTENT_LENGTH,
            &plaintext.len().to_string(),
        );
        response.set_header(
            storage_headers::HASH,
            &format!("md5={}", base64_md5(&plaintext)),
        );
        response.set_body(plaintext);
        Ok(())
    }
}

/// Resolve a single `Range` header against a body of `len` bytes into a
/// half-open slice.
///
/// * `bytes=a-b` is inclusive of `b`; `b` is clamped to the end.
/// * `bytes=a-` reads to the end.
/// * `bytes=-n` is the last `n` bytes.
///
/// `a > len`, `b < a`, multiple ranges, and malformed values are rejected.
pub fn parse_range(header: &str, len: usize) -> Result<Range<usize>, ProxyError> {
    let invalid = || ProxyError::InvalidRange(header.to_string());

    let (unit, byte_range) = header.trim().split_once('=').ok_or_else(invalid)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") || byte_range.contains(',') {
        return Err(invalid());
    }
    let (start, end) = byte_range.trim().split_once('-').ok_or_else(invalid)?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let suffix: usize = end.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(invalid());
        }
        return Ok(len.saturating_sub(suffix)..len);
    }

    let start: usize = start.parse().map_err(|_| invalid())?;
    if start > len {
        return Err(invalid());
    }
    if end.is_empty() {
        return Ok(start..len);
    }
    let end: usize = end.parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok(start..end.saturating_add(1).min(len))
}

fn content_range(range: &Range<usize>, total: usize) -> String {
    if range.is_empty() {
        format!("bytes */{}", total)
    } else {
        format!("bytes {}-{}/{}", range.start, range.end - 1, total)
    }
}
