//! Core types shared by the classifier, handlers, and engine

use base64::Engine;
use md5::{Digest, Md5};
use serde_json::{Map, Value};
use std::fmt;

/// Storage API operation shape of one intercepted exchange.
///
/// Exactly one kind is assigned per exchange; the kind selects the
/// request/response handler pair in [`crate::handlers::handler_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `POST /upload/storage/v1/b/{bucket}/o?uploadType=multipart`
    MultipartUpload,
    /// `POST /upload/storage/v1/b/{bucket}/o?uploadType=media`
    SinglePartUpload,
    /// Resumable session initiation (`POST`, `uploadType=resumable`)
    ResumableInit,
    /// Resumable session data leg (`PUT ...?upload_id=`)
    ResumablePut,
    /// Object media download (`alt=media`, `/download/...`, `/{bucket}/{object}`)
    SimpleDownload,
    /// Object resource fetch (`alt=json` or field-filtered)
    MetadataRequest,
    /// Everything else, forwarded unmodified
    PassThrough,
}

impl OperationKind {
    /// Consistent human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::MultipartUpload => "multipart-upload",
            OperationKind::SinglePartUpload => "single-part-upload",
            OperationKind::ResumableInit => "resumable-init",
            OperationKind::ResumablePut => "resumable-put",
            OperationKind::SimpleDownload => "simple-download",
            OperationKind::MetadataRequest => "metadata-request",
            OperationKind::PassThrough => "pass-through",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Custom-metadata keys written into every object this proxy stores.
pub mod sidecar_keys {
    /// Object resource field holding the custom metadata map
    pub const METADATA: &str = "metadata";
    pub const UNENCRYPTED_CONTENT_LENGTH: &str = "x-unencrypted-content-length";
    pub const MD5_HASH: &str = "x-md5Hash";
    pub const ENCRYPTION_KEY: &str = "x-encryption-key";
    pub const PROXY_VERSION: &str = "x-proxy-version";

    /// Response header carrying the `x-encryption-key` custom metadata on media downloads
    pub const H_ENCRYPTION_KEY: &str = "x-goog-meta-x-encryption-key";
}

/// Proxy-private request headers.
///
/// A request handler stashes plaintext-derived facts here so the paired
/// response handler can restore them. They are stripped before forwarding.
pub mod private_headers {
    pub const ORIGINAL_CONTENT_LENGTH: &str = "x-gcsproxy-original-content-length";
    pub const UNENCRYPTED_FILE_SIZE: &str = "x-gcsproxy-unencrypted-file-size";
    pub const ORIGINAL_MD5_HASH: &str = "x-gcsproxy-original-md5-hash";
    pub const ORIGINAL_BYTE_RANGE: &str = "x-gcsproxy-original-byte-range";

    pub const ALL: [&str; 4] = [
        ORIGINAL_CONTENT_LENGTH,
        UNENCRYPTED_FILE_SIZE,
        ORIGINAL_MD5_HASH,
        ORIGINAL_BYTE_RANGE,
    ];

    /// True for any header name owned by the proxy.
    pub fn is_private(name: &str) -> bool {
        ALL.iter().any(|h| h.eq_ignore_ascii_case(name))
    }
}

/// Storage API response headers recomputed after decryption.
pub mod storage_headers {
    pub const STORED_CONTENT_LENGTH: &str = "x-goog-stored-content-length";
    pub const HASH: &str = "x-goog-hash";
    pub const UPLOAD_ID: &str = "x-guploader-uploadid";
    pub const UPLOAD_CONTENT_LENGTH: &str = "x-upload-content-length";
    pub const UPLOAD_CONTENT_TYPE: &str = "x-upload-content-type";
}

/// Base64-encoded MD5 digest, the format of the object resource `md5Hash` field.
pub fn base64_md5(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Plaintext facts recorded as custom metadata on every object the proxy writes.
///
/// The storage service computes `size` and `md5Hash` over the ciphertext; these
/// values are substituted back wherever the client would otherwise see them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSidecar {
    pub unencrypted_content_length: u64,
    pub md5_hash: String,
    pub encryption_key: String,
    pub proxy_version: String,
}

impl ObjectSidecar {
    /// Describe a plaintext about to be encrypted under `key_id`.
    pub fn for_plaintext(plaintext: &[u8], key_id: &str, proxy_version: &str) -> Self {
        Self {
            unencrypted_content_length: plaintext.len() as u64,
            md5_hash: base64_md5(plaintext),
            encryption_key: key_id.to_string(),
            proxy_version: proxy_version.to_string(),
        }
    }

    /// Merge the sidecar fields into an object resource's `metadata` map,
    /// creating the map when the client sent none.
    pub fn write_into(&self, resource: &mut Map<String, Value>) {
        let entry = resource
            .entry(sidecar_keys::METADATA)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(custom) = entry {
            custom.insert(
                sidecar_keys::UNENCRYPTED_CONTENT_LENGTH.to_string(),
                Value::String(self.unencrypted_content_length.to_string()),
            );
            custom.insert(
                sidecar_keys::MD5_HASH.to_string(),
                Value::String(self.md5_hash.clone()),
            );
            custom.insert(
                sidecar_keys::ENCRYPTION_KEY.to_string(),
                Value::String(self.encryption_key.clone()),
            );
            custom.insert(
                sidecar_keys::PROXY_VERSION.to_string(),
                Value::String(self.proxy_version.clone()),
            );
        }
    }
}

/// Plaintext size and digest read back from an object resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaintextFacts {
    pub size: u64,
    pub md5_hash: String,
}

impl PlaintextFacts {
    /// Read the sidecar facts from an object resource. Returns `None` for
    /// objects this proxy did not write (no custom metadata, or no sidecar keys).
    pub fn from_resource(resource: &Map<String, Value>) -> Option<Self> {
        let custom = resource.get(sidecar_keys::METADATA)?.as_object()?;
        let size = match custom.get(sidecar_keys::UNENCRYPTED_CONTENT_LENGTH)? {
            Value::String(s) => s.trim().parse().ok()?,
            Value::Number(n) => n.as_u64()?,
            _ => return None,
        };
        let md5_hash = custom.get(sidecar_keys::MD5_HASH)?.as_str()?.to_string();
        Some(Self { size, md5_hash })
    }

    /// Overwrite the ciphertext-derived `size` and `md5Hash` fields. The
    /// service's `crc32c` also describes ciphertext and is dropped, so
    /// clients fall back to validating `md5Hash`.
    pub fn apply_to(&self, resource: &mut Map<String, Value>) {
        resource.insert("size".to_string(), Value::String(self.size.to_string()));
        resource.insert("md5Hash".to_string(), Value::String(self.md5_hash.clone()));
        resource.remove("crc32c");
    }
}
