//! Shared test infrastructure for integration tests
//!
//! Provides engine builders, an in-process fake of the storage JSON API
//! (objects kept in memory, stored exactly as received), and a helper that
//! runs the proxy in front of it.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use gcs_envelope_proxy::classifier::{bucket_from_path, object_from_path};
use gcs_envelope_proxy::config::Config;
use gcs_envelope_proxy::exchange::{ProxyResponse, QueryParams};
use gcs_envelope_proxy::multipart::MultipartCodec;
use gcs_envelope_proxy::server::{router, ProxyState};
use gcs_envelope_proxy::types::base64_md5;
use gcs_envelope_proxy::TransformEngine;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Hex master key used by every test engine
pub const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Host name requests are classified against in engine-level tests
pub const GCS_HOST: &str = "storage.googleapis.com";

/// Configuration with `photos` encrypted under `K` and the local test host
/// intercepted.
pub fn test_config(mapping: &str) -> Config {
    let mut config = Config {
        kms_bucket_key_mapping: mapping.to_string(),
        ..Config::default()
    };
    config.kms = gcs_envelope_proxy::config::KmsConfig::Local {
        master_key: Some(MASTER_KEY.to_string()),
    };
    config.intercept_hosts = vec![GCS_HOST.to_string(), "127.0.0.1".to_string()];
    config.proxy_version = "test-version".to_string();
    config
}

pub async fn engine(mapping: &str) -> TransformEngine {
    TransformEngine::from_config(&test_config(mapping))
        .await
        .expect("engine builds")
}

// ── Fake storage service ──

/// An object as the storage service holds it: resource plus stored bytes.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub resource: Map<String, Value>,
    pub data: Vec<u8>,
}

/// Accept a multipart upload the way the storage service does: size and
/// hashes are computed over the bytes received.
pub fn accept_multipart(headers: &HeaderMap, body: &[u8]) -> Result<StoredObject, String> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing content type")?;
    let parsed = MultipartCodec::parse(body, content_type).map_err(|e| e.to_string())?;

    let mut resource = parsed.metadata.clone();
    let data = parsed.payload;
    resource.insert("kind".into(), json!("storage#object"));
    resource.insert("size".into(), json!(data.len().to_string()));
    resource.insert("md5Hash".into(), json!(base64_md5(&data)));
    resource.insert("crc32c".into(), json!("AAAAAA=="));
    if let Some(ct) = parsed.payload_headers.get("content-type") {
        resource
            .entry("contentType")
            .or_insert_with(|| json!(ct));
    }
    Ok(StoredObject { resource, data })
}

/// Resource response (`alt=json`), optionally filtered to `fields`.
pub fn resource_response(object: &StoredObject, fields: Option<&str>) -> ProxyResponse {
    let resource = match fields {
        Some(fields) => {
            let wanted: Vec<&str> = fields.split(',').map(str::trim).collect();
            object
                .resource
                .iter()
                .filter(|(k, _)| wanted.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
        None => object.resource.clone(),
    };
    ProxyResponse::new(StatusCode::OK)
        .with_header("content-type", "application/json; charset=UTF-8")
        .with_body(serde_json::to_vec(&Value::Object(resource)).unwrap())
}

/// Media response (`alt=media`): stored bytes plus custom metadata headers.
pub fn media_response(object: &StoredObject) -> ProxyResponse {
    let mut response = ProxyResponse::new(StatusCode::OK)
        .with_header(
            "x-goog-stored-content-length",
            &object.data.len().to_string(),
        )
        .with_header(
            "x-goog-hash",
            &format!("crc32c=AAAAAA==,md5={}", base64_md5(&object.data)),
        )
        .with_header(
            "content-type",
            object
                .resource
                .get("contentType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream"),
        )
        .with_body(object.data.clone());
    if let Some(Value::Object(custom)) = object.resource.get("metadata") {
        for (k, v) in custom {
            if let Some(v) = v.as_str() {
                response.set_header(&format!("x-goog-meta-{}", k), v);
            }
        }
    }
    response
}

/// In-memory state of the fake storage service.
#[derive(Default)]
pub struct FakeGcsState {
    pub base: Mutex<String>,
    pub objects: Mutex<HashMap<(String, String), StoredObject>>,
    /// Headers of every request received, in order
    pub seen_headers: Mutex<Vec<HeaderMap>>,
    next_upload: Mutex<u64>,
}

impl FakeGcsState {
    pub fn object(&self, bucket: &str, name: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
    }
}

pub struct FakeGcs {
    pub base: String,
    pub state: Arc<FakeGcsState>,
}

pub async fn spawn_fake_gcs() -> FakeGcs {
    let state = Arc::new(FakeGcsState::default());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake storage");
    let base = format!("http://{}", listener.local_addr().unwrap());
    *state.base.lock() = base.clone();

    let app = Router::new()
        .fallback(fake_gcs_handler)
        .with_state(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    FakeGcs { base, state }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [("content-type", "application/json")],
        r#"{"error":{"code":404,"message":"No such object"}}"#,
    )
        .into_response()
}

fn into_response(response: ProxyResponse) -> Response {
    let mut out = (response.status, response.body).into_response();
    for (name, value) in response.headers.iter() {
        out.headers_mut().insert(name.clone(), value.clone());
    }
    out
}

async fn fake_gcs_handler(
    State(state): State<Arc<FakeGcsState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.seen_headers.lock().push(headers.clone());
    let path = uri.path().to_string();
    let query = QueryParams::parse(uri.query().unwrap_or(""));
    let bucket = bucket_from_path(&path).unwrap_or_default();

    if method == Method::POST && path.starts_with("/upload/storage/v1/b/") {
        match query.get("uploadType") {
            Some("multipart") => {
                let object = match accept_multipart(&headers, &body) {
                    Ok(object) => object,
                    Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
                };
                let name = object
                    .resource
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let response = resource_response(&object, None);
                state.objects.lock().insert((bucket, name), object);
                return into_response(response);
            }
            Some("resumable") => {
                let id = {
                    let mut next = state.next_upload.lock();
                    *next += 1;
                    format!("upload-{}", *next)
                };
                let location = format!(
                    "{}/upload/storage/v1/b/{}/o?uploadType=resumable&upload_id={}",
                    state.base.lock(),
                    bucket,
                    id
                );
                return (
                    StatusCode::OK,
                    [
                        ("location", location.as_str()),
                        ("x-guploader-uploadid", id.as_str()),
                    ],
                    "",
                )
                    .into_response();
            }
            _ => return (StatusCode::BAD_REQUEST, "unsupported uploadType").into_response(),
        }
    }

    if method == Method::GET {
        if path.starts_with("/storage/v1/b/") && path.ends_with("/o") {
            let items: Vec<Value> = state
                .objects
                .lock()
                .iter()
                .filter(|((b, _), _)| *b == bucket)
                .map(|(_, o)| Value::Object(o.resource.clone()))
                .collect();
            return axum::Json(json!({"kind": "storage#objects", "items": items})).into_response();
        }

        let name = match object_from_path(&path) {
            Some(name) => name,
            None => return not_found(),
        };
        let object = match state.object(&bucket, &name) {
            Some(object) => object,
            None => return not_found(),
        };
        let wants_media =
            path.starts_with("/download/") || query.get("alt") == Some("media");
        return if wants_media {
            into_response(media_response(&object))
        } else {
            into_response(resource_response(&object, query.get("fields")))
        };
    }

    not_found()
}

// ── Proxy in front of the fake ──

pub struct TestProxy {
    pub base: String,
    pub fake: FakeGcs,
}

/// Run the full proxy (engine + axum front end) against a fresh fake upstream.
pub async fn spawn_proxy(mapping: &str) -> TestProxy {
    let fake = spawn_fake_gcs().await;
    let mut config = test_config(mapping);
    config.upstream_endpoint = fake.base.clone();

    let engine = Arc::new(engine_from(&config).await);
    let state = Arc::new(ProxyState::new(engine, &config).expect("proxy state"));
    let app = router(state, config.max_object_size as usize);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    TestProxy { base, fake }
}

async fn engine_from(config: &Config) -> TransformEngine {
    TransformEngine::from_config(config)
        .await
        .expect("engine builds")
}

/// Deterministic pseudo-random payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
