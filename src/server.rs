//! Reverse-proxy front end driving the engine hooks against an upstream
//!
//! Clients point their storage endpoint at this server. Every request becomes
//! one [`Exchange`]: request hook, forward upstream, response hook, reply.

use crate::config::Config;
use crate::engine::TransformEngine;
use crate::errors::ProxyError;
use crate::exchange::{Exchange, ProxyRequest, ProxyResponse};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{HeaderValue, CONTENT_LENGTH, HOST, LOCATION};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

/// Headers that describe a single connection and are never relayed.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Path of the proxy's own health endpoint
pub const HEALTH_PATH: &str = "/_gcsproxy/health";

/// Application state shared across requests
pub struct ProxyState {
    pub engine: Arc<TransformEngine>,
    client: reqwest::Client,
    /// Upstream scheme and authority, no trailing slash
    upstream_base: String,
    /// Upstream host name, as seen by the classifier
    upstream_host: String,
}

impl ProxyState {
    pub fn new(engine: Arc<TransformEngine>, config: &Config) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        let upstream_base = config.upstream_endpoint.trim_end_matches('/').to_string();
        let upstream_host = host_of(&upstream_base);
        Ok(Self {
            engine,
            client,
            upstream_base,
            upstream_host,
        })
    }

    /// Send the (transformed) request upstream and buffer the response.
    async fn forward(&self, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let url = format!("{}{}", self.upstream_base, request.path_and_query());
        let mut headers = request.forwardable_headers();
        strip_hop_by_hop(&mut headers);
        // Payloads must reach the engine identity-encoded.
        headers.remove("accept-encoding");

        debug!("Forwarding {} {}", request.method, url);
        let upstream = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Build the proxy router.
pub fn router(state: Arc<ProxyState>, max_body: usize) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_check))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[instrument(skip(state, headers, body))]
async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let proxy_origin = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| format!("http://{}", h));

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = ProxyRequest::new(method, state.upstream_host.clone(), path_and_query);
    request.headers = headers;
    request.body = body;

    let mut exchange = Exchange::new(request);
    let kind = state.engine.on_request(&mut exchange).await?;
    let response = state.forward(&exchange.request).await?;
    exchange.response = Some(response);
    state.engine.on_response(&mut exchange).await?;

    let mut response = match exchange.response {
        Some(response) => response,
        None => return Err(ProxyError::Upstream("no response".to_string())),
    };
    if let Some(origin) = proxy_origin {
        rewrite_location(&mut response.headers, &state.upstream_base, &origin);
    }
    info!(
        "{} {} -> {} ({}, {} bytes)",
        exchange.request.method,
        exchange.request.path,
        response.status,
        kind,
        response.body.len()
    );
    Ok(into_axum_response(response))
}

fn into_axum_response(response: ProxyResponse) -> Response {
    let ProxyResponse {
        status,
        mut headers,
        body,
    } = response;
    strip_hop_by_hop(&mut headers);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    let mut out = (status, Body::from(body)).into_response();
    *out.headers_mut() = headers;
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        out.headers_mut().remove(CONTENT_LENGTH);
    }
    out
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Point upstream `Location` URLs (resumable session URIs) back at the proxy.
fn rewrite_location(headers: &mut HeaderMap, upstream_base: &str, proxy_origin: &str) {
    let rewritten = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|location| location.strip_prefix(upstream_base))
        .map(|rest| format!("{}{}", proxy_origin, rest));
    if let Some(location) = rewritten {
        if let Ok(value) = HeaderValue::from_str(&location) {
            debug!("Rewrote Location to {}", location);
            headers.insert(LOCATION, value);
        }
    }
}

/// Host name of an endpoint URL, without scheme, port, or path.
fn host_of(endpoint: &str) -> String {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    host.to_ascii_lowercase()
}
