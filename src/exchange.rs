//! One intercepted request/response pair

use crate::types::{private_headers, OperationKind};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use tracing::warn;

/// Ordered query parameters. Order is kept so untouched requests are
/// forwarded with their query string intact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// Parse a raw (percent-encoded) query string. Unparseable input yields
    /// an empty set.
    pub fn parse(raw: &str) -> Self {
        Self(serde_urlencoded::from_str(raw).unwrap_or_default())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k == name)
    }

    /// Replace every occurrence of `name` with a single value, keeping the
    /// position of the first occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(k, _)| k == name) {
            Some(idx) => {
                self.0[idx].1 = value;
                let mut seen = false;
                self.0.retain(|(k, _)| {
                    if k != name {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| k != name);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Percent-encoded query string, without the leading `?`.
    pub fn to_query_string(&self) -> String {
        serde_urlencoded::to_string(&self.0).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Request half of an exchange.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Target host, without port
    pub host: String,
    /// Raw (percent-encoded) path
    pub path: String,
    pub query: QueryParams,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Query string as received, with the parameters it parsed to
    received_query: Option<(String, QueryParams)>,
}

impl ProxyRequest {
    pub fn new(method: Method, host: impl Into<String>, path_and_query: &str) -> Self {
        let (path, query, received_query) = match path_and_query.split_once('?') {
            Some((path, raw)) => {
                let query = QueryParams::parse(raw);
                (path, query.clone(), Some((raw.to_string(), query)))
            }
            None => (path_and_query, QueryParams::default(), None),
        };
        Self {
            method,
            host: host.into(),
            path: path.to_string(),
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            received_query,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// Replace the body and keep Content-Length consistent with it.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.headers
            .insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }

    /// Path plus query string, as sent upstream. A query no handler touched
    /// goes out byte for byte as received.
    pub fn path_and_query(&self) -> String {
        match &self.received_query {
            Some((raw, parsed)) if *parsed == self.query => format!("{}?{}", self.path, raw),
            _ if self.query.is_empty() => self.path.clone(),
            _ => format!("{}?{}", self.path, self.query.to_query_string()),
        }
    }

    /// Headers safe to send upstream: everything except proxy-private names.
    pub fn forwardable_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        for name in private_headers::ALL {
            headers.remove(name);
        }
        headers
    }
}

/// Response half of an exchange.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.headers
            .insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// One intercepted call. Owned by the caller of the engine hooks for the
/// duration of a single request/response round trip.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: ProxyRequest,
    pub response: Option<ProxyResponse>,
    /// Assigned once by the request hook and reused by the response hook
    pub kind: Option<OperationKind>,
}

impl Exchange {
    pub fn new(request: ProxyRequest) -> Self {
        Self {
            request,
            response: None,
            kind: None,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!("Dropping invalid header {}: {:?}", name, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parse_and_order() {
        let query = QueryParams::parse("uploadType=media&name=a%2Fb.txt&alt=json");
        assert_eq!(query.get("name"), Some("a/b.txt"));
        assert_eq!(
            query.to_query_string(),
            "uploadType=media&name=a%2Fb.txt&alt=json"
        );
    }

    #[test]
    fn test_query_set_replaces_duplicates() {
        let mut query = QueryParams::parse("alt=media&x=1&alt=json");
        query.set("alt", "json");
        assert_eq!(query.to_query_string(), "alt=json&x=1");
        query.set("fields", "name");
        query.remove("x");
        assert_eq!(query.to_query_string(), "alt=json&fields=name");
    }

    #[test]
    fn test_request_split_path_and_query() {
        let req = ProxyRequest::new(Method::GET, "storage.googleapis.com", "/b/o?alt=media");
        assert_eq!(req.path, "/b/o");
        assert_eq!(req.query.get("alt"), Some("media"));
        assert_eq!(req.path_and_query(), "/b/o?alt=media");

        let req = ProxyRequest::new(Method::GET, "h", "/plain");
        assert_eq!(req.path_and_query(), "/plain");
    }

    #[test]
    fn test_untouched_query_forwarded_verbatim() {
        let raw = "/storage/v1/b/photos/o?prefix=a%2Fb&delimiter=/&flag&x=%7e";
        let req = ProxyRequest::new(Method::GET, "h", raw);
        assert_eq!(req.path_and_query(), raw);

        let raw = "/photos/a.txt?bad=%FF%FE";
        assert_eq!(ProxyRequest::new(Method::GET, "h", raw).path_and_query(), raw);
    }

    #[test]
    fn test_modified_query_reencoded() {
        let mut req = ProxyRequest::new(Method::GET, "h", "/o?fields=size&flag");
        req.query.remove("fields");
        req.query.set("alt", "json");
        assert_eq!(req.path_and_query(), "/o?flag=&alt=json");

        let mut req = ProxyRequest::new(Method::GET, "h", "/o?fields=size");
        req.query.remove("fields");
        assert_eq!(req.path_and_query(), "/o");
    }

    #[test]
    fn test_private_headers_not_forwarded() {
        let req = ProxyRequest::new(Method::POST, "h", "/")
            .with_header(private_headers::ORIGINAL_MD5_HASH, "abc")
            .with_header("content-type", "text/plain");
        let forwarded = req.forwardable_headers();
        assert!(forwarded.get(private_headers::ORIGINAL_MD5_HASH).is_none());
        assert_eq!(forwarded.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn test_set_body_updates_length() {
        let mut resp = ProxyResponse::new(StatusCode::OK).with_header("content-length", "99");
        resp.set_body(Bytes::from_static(b"abc"));
        assert_eq!(resp.header("content-length"), Some("3"));
    }
}
