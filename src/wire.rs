//! Raw HTTP/1.1 messages carried inside changeset parts.
//!
//! Batch sub-requests are serialized as plain request text
//! (`METHOD URL HTTP/1.1`, headers, blank line, body) and sub-responses
//! come back the same way.  Header order is deterministic: names are
//! sorted byte-wise, so the same request always renders identically.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, Response, StatusCode};

use crate::errors::{Result, TableError};

/// An HTTP request in the form it takes inside a changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub method: Method,
    /// Absolute request URL.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

impl RawRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Render as request text with headers in sorted order.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.as_ref().map_or(0, |b| b.len()));
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.url.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

/// Headers a single changeset part may carry.
const MAX_HEADERS: usize = 64;

/// Skip the blank lines that precede a part's start line.
fn trim_leading(raw: &[u8]) -> &[u8] {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    &raw[start..]
}

/// Honor `Content-Length` when it is shorter than the remaining bytes.
fn limit_body<'a>(body: &'a [u8], content_length: Option<&str>) -> &'a [u8] {
    match content_length.and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(len) if len <= body.len() => &body[..len],
        _ => body,
    }
}

/// Parse raw request text (the inverse of [`RawRequest::render`]).
pub fn parse_request(raw: &[u8]) -> Result<RawRequest> {
    let malformed = |message: String| TableError::MalformedRequest { message };
    let raw = trim_leading(raw);

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(raw) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(malformed("request ends before its header block".to_string()))
        }
        Err(e) => return Err(malformed(format!("invalid request: {e}"))),
    };

    let method = req
        .method
        .ok_or_else(|| malformed("missing request method".to_string()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| malformed(format!("invalid request method: {method}")))?;
    let url = req
        .path
        .ok_or_else(|| malformed("missing request target".to_string()))?;

    let mut request = RawRequest::new(method, url);
    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| malformed(format!("header {} is not valid UTF-8", header.name)))?;
        // Stored with the sender's spelling.
        request.set_header(header.name, value.trim());
    }

    let body = limit_body(&raw[header_len..], request.header("content-length"));
    if !body.is_empty() {
        request.body = Some(Bytes::copy_from_slice(body));
    }
    Ok(request)
}

/// Parse raw response text into an [`http::Response`].
pub fn parse_response(raw: &[u8]) -> Result<Response<Bytes>> {
    let malformed = |message: String| TableError::MalformedResponse { message };
    let raw = trim_leading(raw);

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let header_len = match resp.parse(raw) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(malformed("response ends before its header block".to_string()))
        }
        Err(e) => return Err(malformed(format!("invalid response: {e}"))),
    };

    let status = resp
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| malformed("invalid status code".to_string()))?;

    let mut builder = Response::builder().status(status);
    let mut content_length = None;
    for header in resp.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| malformed(format!("invalid header name {}: {e}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| malformed(format!("invalid value for header {}: {e}", header.name)))?;
        if name == http::header::CONTENT_LENGTH {
            content_length = value.to_str().ok().map(str::to_string);
        }
        builder = builder.header(name, value);
    }

    let body = limit_body(&raw[header_len..], content_length.as_deref());
    builder
        .body(Bytes::copy_from_slice(body))
        .map_err(|e| malformed(e.to_string()))
}

/// Render response text for a changeset response part.
pub fn render_response(status: StatusCode, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    let mut sorted = headers.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in sorted {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sorts_headers() {
        let mut req = RawRequest::new(Method::DELETE, "https://h/t(PartitionKey='p',RowKey='r')");
        req.set_header("x-ms-version", "2019-02-02");
        req.set_header("If-Match", "*");
        req.set_header("Accept", "application/json;odata=minimalmetadata");
        let text = String::from_utf8(req.render()).unwrap();
        assert_eq!(
            text,
            "DELETE https://h/t(PartitionKey='p',RowKey='r') HTTP/1.1\r\n\
             Accept: application/json;odata=minimalmetadata\r\n\
             If-Match: *\r\n\
             x-ms-version: 2019-02-02\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_parse_request_inverts_render() {
        let mut req = RawRequest::new(Method::POST, "https://h/t");
        req.set_header("Content-Type", "application/json");
        req.set_header("Content-Length", "13");
        req.body = Some(Bytes::from_static(b"{\"RowKey\":1}\n"));
        let parsed = parse_request(&req.render()).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.header("content-type"), Some("application/json"));
    }

    #[test]
    fn test_parse_request_trims_to_content_length() {
        let raw = b"PUT https://h/t HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}\r\n";
        let parsed = parse_request(raw).unwrap();
        assert_eq!(parsed.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn test_parse_request_rejects_non_utf8_header() {
        let raw = b"DELETE https://h/t HTTP/1.1\r\nIf-Match: \xff\xfe\r\n\r\n";
        match parse_request(raw) {
            Err(TableError::MalformedRequest { message }) => assert!(message.contains("If-Match")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_request_truncated_headers() {
        let err = parse_request(b"POST https://h/t HTTP/1.1\r\nContent-Type: application/json\r\n")
            .unwrap_err();
        assert!(matches!(err, TableError::MalformedRequest { .. }));
        assert!(matches!(
            parse_request(b"NOT A REQUEST\r\n\r\n"),
            Err(TableError::MalformedRequest { .. })
        ));
    }

    #[test]
    fn test_parse_response_no_body() {
        let raw = b"HTTP/1.1 204 No Content\r\nX-Content-Type-Options: nosniff\r\nCache-Control: no-cache\r\nDataServiceVersion: 1.0;\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()["cache-control"], "no-cache");
        assert!(resp.body().is_empty());
    }

    #[test]
    fn test_parse_response_with_body() {
        let raw = b"\r\nHTTP/1.1 409 Conflict\r\nContent-Type: application/json\r\n\r\n{\"odata.error\":{}}";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(&resp.body()[..], b"{\"odata.error\":{}}");
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(parse_response(b"").is_err());
        assert!(parse_response(b"GET / HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_response(b"HTTP/1.1 abc Nope\r\n\r\n").is_err());
    }

    #[test]
    fn test_render_response_round_trips() {
        let raw = render_response(
            StatusCode::CREATED,
            &[("ETag", "W/\"1\""), ("Content-Type", "application/json")],
            b"{}",
        );
        assert!(raw.starts_with(b"HTTP/1.1 201 Created\r\nContent-Type"));
        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["etag"], "W/\"1\"");
        assert_eq!(&resp.body()[..], b"{}");
    }
}
