//! Proxy error types and JSON API error responses

use crate::crypto::CryptoError;
use crate::multipart::MultipartError;
use crate::session::SessionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors that abort the transformation of a single exchange.
///
/// None of these affect shared state: the cipher cache and session store stay
/// usable for every other in-flight exchange.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported byte range for resumable upload: {0}")]
    UnsupportedByteRange(String),

    #[error("malformed multipart body: {0}")]
    MalformedMultipart(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("encryption backend unavailable for key {key_id}: {reason}")]
    EncryptionBackendUnavailable { key_id: String, reason: String },

    #[error("missing upload id")]
    MissingUploadId,

    #[error("no resumable session data for upload id {0}")]
    MissingSessionData(String),

    #[error("missing proxy header {0}; request was not transformed by this proxy")]
    MissingSidecarHeaders(&'static str),

    #[error("invalid proxy header {name}: {value}")]
    InvalidSidecarHeader { name: &'static str, value: String },

    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error("invalid byte range: {0}")]
    InvalidRange(String),

    #[error("missing object name")]
    MissingObjectName,

    #[error("session store error: {0}")]
    SessionStore(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl ProxyError {
    /// JSON API style reason code
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::UnsupportedByteRange(_) => "unsupportedByteRange",
            ProxyError::MalformedMultipart(_) => "malformedMultipart",
            ProxyError::EncryptionFailed(_) => "encryptionFailed",
            ProxyError::DecryptionFailed(_) => "decryptionFailed",
            ProxyError::EncryptionBackendUnavailable { .. } => "encryptionBackendUnavailable",
            ProxyError::MissingUploadId => "missingUploadId",
            ProxyError::MissingSessionData(_) => "missingSessionData",
            ProxyError::MissingSidecarHeaders(_) => "missingSidecarHeaders",
            ProxyError::InvalidSidecarHeader { .. } => "invalidSidecarHeader",
            ProxyError::InvalidJson(_) => "invalidJson",
            ProxyError::InvalidRange(_) => "invalidRange",
            ProxyError::MissingObjectName => "required",
            ProxyError::SessionStore(_) => "sessionStore",
            ProxyError::Upstream(_) => "badGateway",
        }
    }

    /// HTTP status returned to the client when the exchange is aborted
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UnsupportedByteRange(_) => StatusCode::NOT_IMPLEMENTED,
            ProxyError::MalformedMultipart(_) => StatusCode::BAD_REQUEST,
            ProxyError::EncryptionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::DecryptionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::EncryptionBackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::MissingUploadId => StatusCode::BAD_REQUEST,
            ProxyError::MissingSessionData(_) => StatusCode::NOT_FOUND,
            ProxyError::MissingSidecarHeaders(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidSidecarHeader { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidJson(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::MissingObjectName => StatusCode::BAD_REQUEST,
            ProxyError::SessionStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Error body in the storage JSON API shape, so client libraries surface
    /// the message instead of failing to parse the response.
    pub fn to_json(&self) -> String {
        let status = self.status_code().as_u16();
        let message = self.to_string();
        serde_json::json!({
            "error": {
                "code": status,
                "message": message,
                "errors": [{
                    "domain": "gcsproxy",
                    "reason": self.reason(),
                    "message": message,
                }],
            }
        })
        .to_string()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_json();

        (
            status,
            [("Content-Type", "application/json; charset=UTF-8")],
            body,
        )
            .into_response()
    }
}

impl From<CryptoError> for ProxyError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::EncryptionFailed(msg) => ProxyError::EncryptionFailed(msg),
            CryptoError::DecryptionFailed(msg) => ProxyError::DecryptionFailed(msg),
            CryptoError::BackendUnavailable { key_id, reason } => {
                ProxyError::EncryptionBackendUnavailable { key_id, reason }
            }
            CryptoError::InvalidKeyMaterial(msg) => ProxyError::EncryptionBackendUnavailable {
                key_id: String::new(),
                reason: msg,
            },
        }
    }
}

impl From<MultipartError> for ProxyError {
    fn from(err: MultipartError) -> Self {
        ProxyError::MalformedMultipart(err.to_string())
    }
}

impl From<SessionError> for ProxyError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(upload_id) => ProxyError::MissingSessionData(upload_id),
            other => ProxyError::SessionStore(other.to_string()),
        }
    }
}
