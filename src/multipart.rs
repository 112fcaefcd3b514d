//! `multipart/mixed` framing.
//!
//! [`MultipartWriter`] produces bodies in the layout
//!
//! ```text
//! --{boundary}\r\n
//! Header: value\r\n
//! \r\n
//! {body}\r\n
//! --{boundary}\r\n
//! ...
//! {body}\r\n
//! --{boundary}--\r\n
//! ```
//!
//! [`MultipartReader`] walks such a body part by part.  It accepts bare LF
//! line endings, and a body that ends before its closing delimiter simply
//! ends the iteration: some services (Cosmos) terminate their batch
//! responses that way.

use http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use tracing::debug;

use crate::errors::{Result, TableError};

/// Build a `multipart/mixed` content type for `boundary`.
pub fn content_type(boundary: &str) -> String {
    format!("multipart/mixed; boundary={boundary}")
}

/// Extract the `boundary` parameter from a `Content-Type` value.
pub fn content_type_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Read a boundary from the first non-blank line of a body (`--{boundary}`).
pub fn sniff_boundary(body: &[u8]) -> Option<String> {
    let start = body.iter().position(|b| !b.is_ascii_whitespace())?;
    let rest = &body[start..];
    let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    let line = std::str::from_utf8(&rest[..end]).ok()?.trim();
    let boundary = line.strip_prefix("--")?.trim();
    (!boundary.is_empty()).then(|| boundary.to_string())
}

// -- Writer -------------------------------------------------------------------

/// Incremental `multipart/mixed` body builder.
pub struct MultipartWriter {
    boundary: String,
    buf: Vec<u8>,
    parts: usize,
}

impl MultipartWriter {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            buf: Vec::new(),
            parts: 0,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` value describing the body being written.
    pub fn content_type(&self) -> String {
        content_type(&self.boundary)
    }

    /// Append one part.  Headers are written sorted by name.
    pub fn write_part(&mut self, headers: &[(&str, &str)], body: &[u8]) {
        if self.parts > 0 {
            self.buf.extend_from_slice(b"\r\n");
        }
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"\r\n");

        let mut sorted = headers.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in sorted {
            self.buf.extend_from_slice(name.as_bytes());
            self.buf.extend_from_slice(b": ");
            self.buf.extend_from_slice(value.as_bytes());
            self.buf.extend_from_slice(b"\r\n");
        }
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(body);
        self.parts += 1;
    }

    /// Write the closing delimiter and return the body.
    pub fn finish(mut self) -> Vec<u8> {
        if self.parts > 0 {
            self.buf.extend_from_slice(b"\r\n");
        }
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"--\r\n");
        self.buf
    }
}

// -- Reader -------------------------------------------------------------------

/// One decoded body part.
#[derive(Debug, Clone)]
pub struct Part {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Part {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Boundary of a nested multipart body, from this part's `Content-Type`.
    pub fn boundary(&self) -> Option<String> {
        self.content_type().and_then(content_type_boundary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Before the first delimiter (preamble).
    Start,
    /// Positioned at a delimiter.
    AtDelimiter(usize),
    Done,
}

/// Lazy iterator over the parts of a `multipart/mixed` body.
///
/// Parts are yielded in order; the iterator cannot be restarted.
pub struct MultipartReader {
    data: Bytes,
    delimiter: Vec<u8>,
    state: ReadState,
}

impl MultipartReader {
    pub fn new(data: impl Into<Bytes>, boundary: &str) -> Self {
        Self {
            data: data.into(),
            delimiter: format!("--{boundary}").into_bytes(),
            state: ReadState::Start,
        }
    }

    /// Find the next delimiter at or after `from` that starts a line and is
    /// not merely a prefix of a longer token.
    fn find_delimiter(&self, from: usize) -> Option<usize> {
        let data = &self.data[..];
        let mut from = from;
        while let Some(rel) = find_subslice(&data[from.min(data.len())..], &self.delimiter) {
            let idx = from + rel;
            let after = idx + self.delimiter.len();
            let at_line_start = idx == 0 || data[idx - 1] == b'\n';
            let well_terminated = match data.get(after) {
                None => true,
                Some(b'-' | b'\r' | b'\n' | b' ' | b'\t') => true,
                Some(_) => false,
            };
            if at_line_start && well_terminated {
                return Some(idx);
            }
            from = idx + 1;
        }
        None
    }

    /// Consume the delimiter at `idx`; returns the start of the part headers,
    /// or `None` at the closing delimiter or end of input.
    fn enter_part(&self, idx: usize) -> Option<usize> {
        let data = &self.data[..];
        let mut pos = idx + self.delimiter.len();
        if data[pos..].starts_with(b"--") {
            return None;
        }
        while matches!(data.get(pos), Some(b' ' | b'\t')) {
            pos += 1;
        }
        if data[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if data[pos..].starts_with(b"\n") {
            pos += 1;
        }
        (pos < data.len()).then_some(pos)
    }

    /// Parse part headers starting at `pos`; returns the headers and the
    /// offset where the body begins, or `None` on unexpected EOF.
    fn read_headers(&self, mut pos: usize) -> Result<Option<(HeaderMap, usize)>> {
        let data = &self.data[..];
        let mut headers = HeaderMap::new();
        loop {
            let Some(rel) = data[pos..].iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = &data[pos..pos + rel];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            pos += rel + 1;
            if line.is_empty() {
                return Ok(Some((headers, pos)));
            }
            let (name, value) = parse_header_line(line)?;
            headers.append(name, value);
        }
    }
}

impl Iterator for MultipartReader {
    type Item = Result<Part>;

    fn next(&mut self) -> Option<Self::Item> {
        let delimiter_at = match self.state {
            ReadState::Done => return None,
            ReadState::Start => match self.find_delimiter(0) {
                Some(idx) => idx,
                None => {
                    self.state = ReadState::Done;
                    return Some(Err(TableError::MalformedResponse {
                        message: format!(
                            "multipart boundary {} not found",
                            String::from_utf8_lossy(&self.delimiter[2..])
                        ),
                    }));
                }
            },
            ReadState::AtDelimiter(idx) => idx,
        };

        let Some(header_start) = self.enter_part(delimiter_at) else {
            self.state = ReadState::Done;
            return None;
        };

        let (headers, body_start) = match self.read_headers(header_start) {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("multipart body ended inside part headers; treating as end of parts");
                self.state = ReadState::Done;
                return None;
            }
            Err(e) => {
                self.state = ReadState::Done;
                return Some(Err(e));
            }
        };

        let Some(next_delimiter) = self.find_delimiter(body_start) else {
            debug!("multipart body ended before closing delimiter; treating as end of parts");
            self.state = ReadState::Done;
            return None;
        };

        // The line break before the delimiter belongs to the delimiter.
        let mut body_end = next_delimiter.saturating_sub(1);
        if body_end > 0 && self.data[body_end - 1] == b'\r' {
            body_end -= 1;
        }
        let body_end = body_end.max(body_start);

        self.state = ReadState::AtDelimiter(next_delimiter);
        Some(Ok(Part {
            headers,
            body: self.data.slice(body_start..body_end),
        }))
    }
}

/// Split a `Name: value` line into typed header parts.
pub(crate) fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
    let malformed = || TableError::MalformedResponse {
        message: format!("invalid header line: {}", String::from_utf8_lossy(line)),
    };
    let colon = line.iter().position(|&b| b == b':').ok_or_else(malformed)?;
    let name = HeaderName::from_bytes(line[..colon].trim_ascii()).map_err(|_| malformed())?;
    let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii()).map_err(|_| malformed())?;
    Ok((name, value))
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
