//! Maps an intercepted request to its storage API operation shape

use crate::exchange::ProxyRequest;
use crate::keys::KeyResolver;
use crate::types::OperationKind;
use axum::http::Method;
use std::sync::Arc;

/// Media and multipart uploads
pub const UPLOAD_PREFIX: &str = "/upload/storage/v1/";
/// Dedicated resumable upload endpoint
pub const RESUMABLE_PREFIX: &str = "/resumable/upload/storage/v1/";
/// Object and bucket resources
pub const JSON_API_PREFIX: &str = "/storage/v1/b/";
/// Dedicated media download endpoint
pub const DOWNLOAD_PREFIX: &str = "/download/storage/v1/";

/// Prefixes that are never the short `/{bucket}/{object}` form
const API_PREFIXES: [&str; 4] = [
    "/upload/",
    "/resumable/",
    "/storage/",
    "/download/",
];

pub struct RequestClassifier {
    resolver: Arc<dyn KeyResolver>,
    intercept_hosts: Vec<String>,
}

impl RequestClassifier {
    pub fn new(resolver: Arc<dyn KeyResolver>, intercept_hosts: Vec<String>) -> Self {
        Self {
            resolver,
            intercept_hosts: intercept_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    fn intercepts_host(&self, host: &str) -> bool {
        let host = strip_port(host).to_ascii_lowercase();
        self.intercept_hosts.iter().any(|h| *h == host)
    }

    /// Classify one request. First matching rule wins.
    pub fn classify(&self, req: &ProxyRequest) -> OperationKind {
        if !self.intercepts_host(&req.host) {
            return OperationKind::PassThrough;
        }
        let bucket = match bucket_from_path(&req.path) {
            Some(bucket) => bucket,
            None => return OperationKind::PassThrough,
        };
        if self.resolver.resolve(&bucket).is_empty() {
            return OperationKind::PassThrough;
        }

        let path = req.path.as_str();
        let upload_type = req.query.get("uploadType");

        if path.starts_with(UPLOAD_PREFIX) && req.method == Method::POST {
            match upload_type {
                Some("multipart") => return OperationKind::MultipartUpload,
                Some("media") => return OperationKind::SinglePartUpload,
                _ => {}
            }
        }

        if path.starts_with(RESUMABLE_PREFIX)
            || (path.starts_with(UPLOAD_PREFIX) && upload_type == Some("resumable"))
        {
            if req.method == Method::POST {
                return OperationKind::ResumableInit;
            }
            if req.method == Method::PUT {
                return OperationKind::ResumablePut;
            }
        }

        if path.starts_with(JSON_API_PREFIX) && req.method == Method::GET {
            // Bucket resources and object listings are never rewritten.
            if object_from_path(path).is_none() {
                return OperationKind::PassThrough;
            }
            return match req.query.get("alt") {
                Some("json") => OperationKind::MetadataRequest,
                Some("media") => OperationKind::SimpleDownload,
                None => OperationKind::MetadataRequest,
                Some(_) => OperationKind::PassThrough,
            };
        }

        if path.starts_with(DOWNLOAD_PREFIX) && req.method == Method::GET {
            return OperationKind::SimpleDownload;
        }

        if req.method == Method::GET
            && !API_PREFIXES.iter().any(|p| path.starts_with(p))
            && !req.query.contains("alt")
            && !req.query.contains("fields")
            && object_from_path(path).is_some()
        {
            return OperationKind::SimpleDownload;
        }

        OperationKind::PassThrough
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Prefixes of the `.../b/{bucket}/o/{object}` path shape
const BUCKET_PATH_PREFIXES: [&str; 4] = [
    "/storage/v1/b/",
    "/upload/storage/v1/b/",
    "/resumable/upload/storage/v1/b/",
    "/download/storage/v1/b/",
];

/// Raw bucket segment and raw object remainder of a path.
///
/// API paths name the object only when `o` directly follows the bucket
/// segment. Any other path is the short `/{bucket}/{object}` form.
fn split_path(path: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = BUCKET_PATH_PREFIXES
        .iter()
        .find_map(|prefix| path.strip_prefix(prefix))
    {
        return Some(match rest.split_once('/') {
            Some((bucket, tail)) => (bucket, tail.strip_prefix("o/")),
            None => (rest, None),
        });
    }
    if API_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return None;
    }
    let rest = path.strip_prefix('/').unwrap_or(path);
    Some(match rest.split_once('/') {
        Some((bucket, object)) => (bucket, Some(object)),
        None => (rest, None),
    })
}

/// Decoded bucket named by the path.
pub fn bucket_from_path(path: &str) -> Option<String> {
    let (bucket, _) = split_path(path)?;
    if bucket.is_empty() {
        None
    } else {
        Some(decode(bucket))
    }
}

/// Decoded object name. `None` for bucket resources and listings.
pub fn object_from_path(path: &str) -> Option<String> {
    let (bucket, object) = split_path(path)?;
    match object {
        Some(raw) if !bucket.is_empty() && !raw.is_empty() => Some(decode(raw)),
        _ => None,
    }
}
