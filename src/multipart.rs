//! multipart/related codec for JSON API uploads
//!
//! An upload body carries exactly two parts: the object resource as JSON,
//! then the object payload.
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: application/json; charset=UTF-8\r\n
//! \r\n
//! {"name":"a.txt","bucket":"b"}\r\n
//! --<boundary>\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! <payload bytes>\r\n
//! --<boundary>--\r\n
//! ```
//!
//! Parsing tolerates bare `\n` line endings. Building always emits `\r\n`.

use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("upload requires a multipart Content-Type, got: {0}")]
    NotMultipart(String),

    #[error("Missing boundary in Content-Type")]
    MissingBoundary,

    #[error("Empty boundary in Content-Type")]
    EmptyBoundary,

    #[error("body does not contain the boundary delimiter")]
    MissingDelimiter,

    #[error("body ends before the closing delimiter")]
    UnexpectedEnd,

    #[error("expected exactly 2 parts, found {0}")]
    PartCount(usize),

    #[error("first part is not a JSON object: {0}")]
    InvalidMetadata(String),
}

/// Headers of one MIME part, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders(Vec<(String, String)>);

impl PartHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first header with this name, or append.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PartHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A decoded two-part upload body.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartRelated {
    pub boundary: String,
    pub metadata: Map<String, Value>,
    pub metadata_headers: PartHeaders,
    pub payload: Vec<u8>,
    pub payload_headers: PartHeaders,
}

impl MultipartRelated {
    /// Re-encode with the same boundary and part headers.
    pub fn to_bytes(&self) -> Vec<u8> {
        MultipartCodec::build(
            &self.boundary,
            &self.metadata,
            &self.metadata_headers,
            &self.payload,
            &self.payload_headers,
        )
    }
}

/// Parser and builder for two-part multipart/related upload bodies.
pub struct MultipartCodec;

impl MultipartCodec {
    /// Decode an upload body. `content_type` is the request's Content-Type.
    ///
    /// # Errors
    ///
    /// Returns an error if the boundary cannot be read, the body is not
    /// exactly two delimited parts, or the first part is not a JSON object.
    pub fn parse(body: &[u8], content_type: &str) -> Result<MultipartRelated, MultipartError> {
        let boundary = boundary_from_content_type(content_type)?;
        let parts = split_parts(body, &boundary)?;
        if parts.len() != 2 {
            return Err(MultipartError::PartCount(parts.len()));
        }

        let (metadata_headers, metadata_raw) = parse_part(parts[0]);
        let (payload_headers, payload) = parse_part(parts[1]);

        let metadata = match serde_json::from_slice::<Value>(metadata_raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(MultipartError::InvalidMetadata(format!(
                    "found {}",
                    json_type_name(&other)
                )))
            }
            Err(e) => return Err(MultipartError::InvalidMetadata(e.to_string())),
        };

        debug!(
            "Parsed multipart body: boundary={}, payload={} bytes",
            boundary,
            payload.len()
        );

        Ok(MultipartRelated {
            boundary,
            metadata,
            metadata_headers,
            payload: payload.to_vec(),
            payload_headers,
        })
    }

    /// Encode a two-part body. Any `Content-Length` part header is rewritten
    /// to the length of the content it describes; all other headers are
    /// emitted as given, in order.
    pub fn build(
        boundary: &str,
        metadata: &Map<String, Value>,
        metadata_headers: &PartHeaders,
        payload: &[u8],
        payload_headers: &PartHeaders,
    ) -> Vec<u8> {
        // Serializing a Map<String, Value> cannot fail.
        let metadata_json = serde_json::to_vec(metadata).unwrap_or_default();

        let mut out = Vec::with_capacity(metadata_json.len() + payload.len() + 256);
        for (headers, content) in [
            (metadata_headers, metadata_json.as_slice()),
            (payload_headers, payload),
        ] {
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"\r\n");
            for (name, value) in headers.iter() {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                if name.eq_ignore_ascii_case("content-length") {
                    out.extend_from_slice(content.len().to_string().as_bytes());
                } else {
                    out.extend_from_slice(value.as_bytes());
                }
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(content);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
        out
    }
}

/// Fresh random boundary in the `===============<19 digits>==` shape
/// produced by common client libraries.
pub fn generate_boundary() -> String {
    let n: u64 = rand::thread_rng().gen_range(1_000_000_000_000_000_000..10_000_000_000_000_000_000);
    format!("==============={}==", n)
}

/// Content-Type header value for a multipart/related body.
pub fn related_content_type(boundary: &str) -> String {
    format!("multipart/related; boundary=\"{}\"", boundary)
}

/// Extract the boundary parameter. Some clients single-quote the value;
/// those quotes are normalized before the parameter is read.
///
/// # Errors
///
/// Returns an error if the Content-Type is not multipart, or the boundary
/// parameter is absent or empty.
pub fn boundary_from_content_type(content_type: &str) -> Result<String, MultipartError> {
    let normalized = content_type.replace('\'', "\"");
    let mut params = normalized.split(';');
    let mime = params.next().unwrap_or_default().trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return Err(MultipartError::NotMultipart(content_type.to_string()));
    }

    for param in params {
        if let Some((name, value)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("boundary") {
                let value = value.trim().trim_matches('"');
                if value.is_empty() {
                    return Err(MultipartError::EmptyBoundary);
                }
                return Ok(value.to_string());
            }
        }
    }
    Err(MultipartError::MissingBoundary)
}

/// Split the body into raw parts (headers + content, without the trailing
/// line break that precedes the next delimiter).
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, MultipartError> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();

    let mut pos = find_delimiter(body, delimiter, 0).ok_or(MultipartError::MissingDelimiter)?;
    let mut parts = Vec::new();
    loop {
        let after = pos + delimiter.len();
        if body[after..].starts_with(b"--") {
            return Ok(parts);
        }
        let part_start = match body[after..].iter().position(|&b| b == b'\n') {
            Some(nl) => after + nl + 1,
            None => return Err(MultipartError::UnexpectedEnd),
        };
        let next =
            find_delimiter(body, delimiter, part_start).ok_or(MultipartError::UnexpectedEnd)?;

        let mut end = next;
        if end > part_start && body[end - 1] == b'\n' {
            end -= 1;
            if end > part_start && body[end - 1] == b'\r' {
                end -= 1;
            }
        }
        parts.push(&body[part_start..end]);
        pos = next;
    }
}

/// Find a delimiter line at or after `from`: the delimiter must start a line
/// and be followed by `--`, whitespace, or the end of the body.
fn find_delimiter(body: &[u8], delimiter: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + delimiter.len() <= body.len() {
        if (i == 0 || body[i - 1] == b'\n') && body[i..].starts_with(delimiter) {
            let rest = &body[i + delimiter.len()..];
            if rest.is_empty()
                || rest.starts_with(b"--")
                || matches!(rest[0], b'\r' | b'\n' | b' ' | b'\t')
            {
                return Some(i);
            }
        }
        i += match body[i..].iter().position(|&b| b == b'\n') {
            Some(nl) => nl + 1,
            None => return None,
        };
    }
    None
}

/// Split one raw part into its headers and content.
fn parse_part(raw: &[u8]) -> (PartHeaders, &[u8]) {
    let (header_block, content) = match find_header_end(raw) {
        Some((header_end, content_start)) => (&raw[..header_end], &raw[content_start..]),
        None => (&raw[..0], raw),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in String::from_utf8_lossy(header_block).split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if line.starts_with([' ', '\t']) {
            if let Some(last) = headers.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    (PartHeaders(headers), content)
}

/// Locate the blank line ending the header block. Returns
/// (end of headers, start of content). A part that begins with a blank line
/// has no headers.
fn find_header_end(raw: &[u8]) -> Option<(usize, usize)> {
    if raw.starts_with(b"\r\n") {
        return Some((0, 2));
    }
    if raw.starts_with(b"\n") {
        return Some((0, 1));
    }
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            let rest = &raw[i + 1..];
            if rest.starts_with(b"\r\n") {
                return Some((i + 1, i + 3));
            }
            if rest.starts_with(b"\n") {
                return Some((i + 1, i + 2));
            }
        }
        i += 1;
    }
    None
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BODY: &str = "--===============7330845974216740156==\r\n\
        Content-Type: application/json; charset=UTF-8\r\n\
        MIME-Version: 1.0\r\n\
        \r\n\
        {\"name\":\"a.txt\",\"bucket\":\"photos\"}\r\n\
        --===============7330845974216740156==\r\n\
        Content-Type: text/plain\r\n\
        MIME-Version: 1.0\r\n\
        Content-Transfer-Encoding: binary\r\n\
        \r\n\
        hello world\r\n\
        --===============7330845974216740156==--\r\n";

    const CONTENT_TYPE: &str =
        "multipart/related; boundary=\"===============7330845974216740156==\"";

    #[test]
    fn test_parse_two_parts() {
        let parsed = MultipartCodec::parse(BODY.as_bytes(), CONTENT_TYPE).unwrap();
        assert_eq!(parsed.boundary, "===============7330845974216740156==");
        assert_eq!(parsed.metadata["name"], "a.txt");
        assert_eq!(parsed.metadata["bucket"], "photos");
        assert_eq!(parsed.payload, b"hello world");
        assert_eq!(parsed.payload_headers.get("content-type"), Some("text/plain"));
        assert_eq!(
            parsed.payload_headers.get("Content-Transfer-Encoding"),
            Some("binary")
        );
    }

    #[test]
    fn test_build_reproduces_body() {
        let parsed = MultipartCodec::parse(BODY.as_bytes(), CONTENT_TYPE).unwrap();
        assert_eq!(parsed.to_bytes(), BODY.as_bytes());
    }

    #[test]
    fn test_single_quoted_boundary() {
        let content_type = "multipart/related; boundary='===============7330845974216740156=='";
        let parsed = MultipartCodec::parse(BODY.as_bytes(), content_type).unwrap();
        assert_eq!(parsed.payload, b"hello world");
    }

    #[test]
    fn test_lf_line_endings() {
        let body = BODY.replace("\r\n", "\n");
        let parsed = MultipartCodec::parse(body.as_bytes(), CONTENT_TYPE).unwrap();
        assert_eq!(parsed.payload, b"hello world");
        assert_eq!(parsed.metadata_headers.len(), 2);
    }

    #[test]
    fn test_binary_payload_with_crlf_inside() {
        let payload = b"line one\r\n\r\n--not-the-boundary\r\n\x00\xff";
        let body = MultipartCodec::build(
            "xyz",
            json!({"name": "bin"}).as_object().unwrap(),
            &PartHeaders::from_iter([("Content-Type", "application/json")]),
            payload,
            &PartHeaders::from_iter([("Content-Type", "application/octet-stream")]),
        );
        let parsed = MultipartCodec::parse(&body, "multipart/related; boundary=xyz").unwrap();
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_content_length_recomputed() {
        let body = MultipartCodec::build(
            "b1",
            &Map::new(),
            &PartHeaders::new(),
            b"12345",
            &PartHeaders::from_iter([("Content-Length", "999")]),
        );
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn test_rejects_wrong_part_count() {
        let body = "--b\r\n\r\n{}\r\n--b--\r\n";
        assert_eq!(
            MultipartCodec::parse(body.as_bytes(), "multipart/related; boundary=b"),
            Err(MultipartError::PartCount(1))
        );

        let body = "--b\r\n\r\n{}\r\n--b\r\n\r\nx\r\n--b\r\n\r\ny\r\n--b--\r\n";
        assert_eq!(
            MultipartCodec::parse(body.as_bytes(), "multipart/related; boundary=b"),
            Err(MultipartError::PartCount(3))
        );
    }

    #[test]
    fn test_rejects_non_object_metadata() {
        let body = "--b\r\n\r\n[1,2]\r\n--b\r\n\r\nx\r\n--b--\r\n";
        assert!(matches!(
            MultipartCodec::parse(body.as_bytes(), "multipart/related; boundary=b"),
            Err(MultipartError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_rejects_missing_boundary_and_truncation() {
        assert_eq!(
            boundary_from_content_type("multipart/related"),
            Err(MultipartError::MissingBoundary)
        );
        assert_eq!(
            boundary_from_content_type("multipart/related; boundary=\"\""),
            Err(MultipartError::EmptyBoundary)
        );
        assert!(matches!(
            boundary_from_content_type("application/json"),
            Err(MultipartError::NotMultipart(_))
        ));
        assert_eq!(
            MultipartCodec::parse(b"no delimiter here", "multipart/related; boundary=b"),
            Err(MultipartError::MissingDelimiter)
        );
        assert_eq!(
            MultipartCodec::parse(b"--b\r\n\r\n{}\r\n", "multipart/related; boundary=b"),
            Err(MultipartError::UnexpectedEnd)
        );
    }

    #[test]
    fn test_generated_boundary_shape() {
        let boundary = generate_boundary();
        assert!(boundary.starts_with("==============="));
        assert!(boundary.ends_with("=="));
        assert_eq!(boundary.len(), 15 + 19 + 2);
        assert_eq!(
            boundary_from_content_type(&related_content_type(&boundary)).unwrap(),
            boundary
        );
    }

    use serde_json::json;

    proptest! {
        #[test]
        fn prop_build_parse_roundtrip(
            boundary in "[A-Za-z0-9]{12,40}",
            name in "[a-z0-9/._-]{1,30}",
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            content_type in "(text/plain|image/png|application/octet-stream)",
        ) {
            let mut metadata = Map::new();
            metadata.insert("name".to_string(), Value::String(name));
            let metadata_headers = PartHeaders::from_iter([("Content-Type", "application/json; charset=UTF-8")]);
            let payload_headers = PartHeaders::from_iter([("Content-Type", content_type.as_str())]);

            let body = MultipartCodec::build(&boundary, &metadata, &metadata_headers, &payload, &payload_headers);
            let parsed = MultipartCodec::parse(&body, &related_content_type(&boundary)).unwrap();

            prop_assert_eq!(&parsed.boundary, &boundary);
            prop_assert_eq!(&parsed.metadata, &metadata);
            prop_assert_eq!(&parsed.metadata_headers, &metadata_headers);
            prop_assert_eq!(&parsed.payload_headers, &payload_headers);
            prop_assert_eq!(&parsed.payload, &payload);
            prop_assert_eq!(parsed.to_bytes(), body);
        }
    }
}
