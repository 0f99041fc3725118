//! Resumable upload sessions: init, single-request completion, rejection of
//! partial chunks

mod common;

use axum::http::{Method, StatusCode};
use common::{accept_multipart, engine, resource_response, GCS_HOST};
use gcs_envelope_proxy::session::SessionStore;
use gcs_envelope_proxy::{Exchange, OperationKind, ProxyError, ProxyRequest, ProxyResponse};
use serde_json::Value;
use tokio_test::{assert_err, assert_ok};

const LOCATION: &str =
    "https://storage.googleapis.com/upload/storage/v1/b/photos/o?uploadType=resumable&upload_id=U1";

async fn init_session(engine: &gcs_envelope_proxy::TransformEngine, resource: &'static str) {
    let mut exchange = Exchange::new(
        ProxyRequest::new(
            Method::POST,
            GCS_HOST,
            "/upload/storage/v1/b/photos/o?uploadType=resumable",
        )
        .with_header("content-type", "application/json; charset=UTF-8")
        .with_header("x-upload-content-length", "11")
        .with_header("x-upload-content-type", "text/plain")
        .with_body(resource),
    );
    assert_eq!(
        engine.on_request(&mut exchange).await.unwrap(),
        OperationKind::ResumableInit
    );
    assert!(exchange.request.header("x-upload-content-length").is_none());

    exchange.response = Some(ProxyResponse::new(StatusCode::OK).with_header("location", LOCATION));
    assert_ok!(engine.on_response(&mut exchange).await);
}

fn session_put(upload_id: &str, body: &'static [u8], content_range: Option<&str>) -> Exchange {
    let mut request = ProxyRequest::new(
        Method::PUT,
        GCS_HOST,
        &format!(
            "/upload/storage/v1/b/photos/o?uploadType=resumable&upload_id={}",
            upload_id
        ),
    )
    .with_body(body);
    if let Some(range) = content_range {
        request.set_header("content-range", range);
    }
    Exchange::new(request)
}

#[tokio::test]
async fn test_init_then_put_completes_encrypted() {
    let engine = engine("photos:K").await;
    init_session(&engine, r#"{"name":"notes/a.txt"}"#).await;

    let mut exchange = session_put("U1", b"hello world", Some("bytes 0-10/11"));
    assert_eq!(
        engine.on_request(&mut exchange).await.unwrap(),
        OperationKind::ResumablePut
    );

    let req = &exchange.request;
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.path, "/upload/storage/v1/b/photos/o");
    assert_eq!(req.query.get("uploadType"), Some("multipart"));
    assert!(!req.query.contains("upload_id"));
    assert!(req.header("content-range").is_none());

    let stored = accept_multipart(&req.forwardable_headers(), &req.body).unwrap();
    assert_eq!(stored.resource["name"], "notes/a.txt");
    assert_eq!(stored.resource["bucket"], "photos");
    // Content type recorded at init from X-Upload-Content-Type
    assert_eq!(stored.resource["contentType"], "text/plain");
    assert_eq!(
        engine.ciphers().decrypt("K", &stored.data).await.unwrap(),
        b"hello world"
    );

    exchange.response = Some(resource_response(&stored, None));
    assert_ok!(engine.on_response(&mut exchange).await);
    let body: Value = serde_json::from_slice(&exchange.response.unwrap().body).unwrap();
    assert_eq!(body["size"], "11");
    assert_eq!(body["md5Hash"], "XrY7u+Ae7tCTyyK7j1rNww==");
}

#[tokio::test]
async fn test_session_is_single_use() {
    let engine = engine("photos:K").await;
    init_session(&engine, r#"{"name":"a.txt"}"#).await;

    let mut first = session_put("U1", b"hello world", None);
    assert_ok!(engine.on_request(&mut first).await);

    let mut second = session_put("U1", b"hello world", None);
    let err = assert_err!(engine.on_request(&mut second).await);
    assert!(matches!(err, ProxyError::MissingSessionData(ref id) if id == "U1"));
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_upload_id() {
    let engine = engine("photos:K").await;
    let mut exchange = session_put("never-opened", b"x", None);
    assert!(matches!(
        engine.on_request(&mut exchange).await,
        Err(ProxyError::MissingSessionData(_))
    ));
}

#[tokio::test]
async fn test_partial_chunk_rejected_and_session_kept() {
    let engine = engine("photos:K").await;
    init_session(&engine, r#"{"name":"a.txt"}"#).await;

    let mut chunk = session_put("U1", b"hello", Some("bytes 0-4/11"));
    let err = assert_err!(engine.on_request(&mut chunk).await);
    assert!(matches!(err, ProxyError::UnsupportedByteRange(_)));
    assert_eq!(err.status_code(), StatusCode::NOT_IMPLEMENTED);

    // The rejected chunk did not consume the session
    let mut whole = session_put("U1", b"hello world", Some("bytes 0-10/11"));
    assert_ok!(engine.on_request(&mut whole).await);
}

#[tokio::test]
async fn test_put_without_upload_id() {
    let engine = engine("photos:K").await;
    let mut exchange = Exchange::new(
        ProxyRequest::new(
            Method::PUT,
            GCS_HOST,
            "/upload/storage/v1/b/photos/o?uploadType=resumable",
        )
        .with_body(&b"data"[..]),
    );
    assert!(matches!(
        engine.on_request(&mut exchange).await,
        Err(ProxyError::MissingUploadId)
    ));
}

#[tokio::test]
async fn test_init_response_without_upload_id() {
    let engine = engine("photos:K").await;
    let mut exchange = Exchange::new(
        ProxyRequest::new(
            Method::POST,
            GCS_HOST,
            "/upload/storage/v1/b/photos/o?uploadType=resumable&name=a.txt",
        ),
    );
    assert_ok!(engine.on_request(&mut exchange).await);
    exchange.response = Some(ProxyResponse::new(StatusCode::OK));
    assert!(matches!(
        engine.on_response(&mut exchange).await,
        Err(ProxyError::MissingUploadId)
    ));
}

#[tokio::test]
async fn test_init_with_name_in_query_and_upload_id_header() {
    let engine = engine("photos:K").await;
    let mut exchange = Exchange::new(ProxyRequest::new(
        Method::POST,
        GCS_HOST,
        "/upload/storage/v1/b/photos/o?uploadType=resumable&name=q.bin",
    ));
    assert_ok!(engine.on_request(&mut exchange).await);
    exchange.response =
        Some(ProxyResponse::new(StatusCode::OK).with_header("x-guploader-uploadid", "H1"));
    assert_ok!(engine.on_response(&mut exchange).await);

    let session = engine.sessions().take("H1").await.unwrap();
    assert_eq!(session.bucket, "photos");
    assert_eq!(session.object_name, "q.bin");
    assert_eq!(session.content_type, None);
}

#[tokio::test]
async fn test_failed_init_records_nothing() {
    let engine = engine("photos:K").await;
    let mut exchange = Exchange::new(
        ProxyRequest::new(
            Method::POST,
            GCS_HOST,
            "/upload/storage/v1/b/photos/o?uploadType=resumable",
        )
        .with_body(r#"{"name":"a.txt"}"#),
    );
    assert_ok!(engine.on_request(&mut exchange).await);
    exchange.response = Some(
        ProxyResponse::new(StatusCode::FORBIDDEN)
            .with_header("x-guploader-uploadid", "F1")
            .with_body("denied"),
    );
    assert_ok!(engine.on_response(&mut exchange).await);
    assert!(engine.sessions().take("F1").await.is_err());
}

#[tokio::test]
async fn test_empty_object_completion() {
    let engine = engine("photos:K").await;
    init_session(&engine, r#"{"name":"empty.txt"}"#).await;

    let mut exchange = session_put("U1", b"", Some("bytes */0"));
    assert_ok!(engine.on_request(&mut exchange).await);
    let req = &exchange.request;
    let stored = accept_multipart(&req.forwardable_headers(), &req.body).unwrap();
    assert_eq!(stored.resource["metadata"]["x-unencrypted-content-length"], "0");
    assert!(engine
        .ciphers()
        .decrypt("K", &stored.data)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_session_for_unmapped_bucket_still_encrypted() {
    let engine = engine("photos:K").await;
    init_session(&engine, r#"{"bucket":"other","name":"a.txt"}"#).await;

    let mut exchange = session_put("U1", b"TOP SECRET", Some("bytes 0-9/10"));
    assert_ok!(engine.on_request(&mut exchange).await);

    let req = &exchange.request;
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.path, "/upload/storage/v1/b/other/o");
    assert_eq!(req.query.get("uploadType"), Some("multipart"));
    assert!(!req.body.windows(10).any(|w| w == b"TOP SECRET"));

    let stored = accept_multipart(&req.forwardable_headers(), &req.body).unwrap();
    assert_eq!(stored.resource["bucket"], "other");
    assert_eq!(stored.resource["metadata"]["x-encryption-key"], "K");
    assert_eq!(
        engine.ciphers().decrypt("K", &stored.data).await.unwrap(),
        b"TOP SECRET"
    );

    exchange.response = Some(resource_response(&stored, None));
    assert_ok!(engine.on_response(&mut exchange).await);
}
