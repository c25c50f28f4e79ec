//! Minimal HTTP/1.1 request parsing and response serialization.
//!
//! Only what a viewer connection needs: a request head terminated by
//! `CRLF CRLF`, an optional `Content-Length` body, and responses with an
//! exact `Content-Length`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt::Write as _;
use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default limit for a request head plus body (16 KiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 16 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

// ============================================================================
// Headers
// ============================================================================

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header list.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a header.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Returns the first value for `name`, ignoring case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any comma-separated token of `name` equals `token`,
    /// ignoring case.
    #[must_use]
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the number of headers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no headers.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// HttpRequest
// ============================================================================

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target as sent, e.g. `/` or `/index?x=1`.
    pub target: String,
    /// Protocol version, e.g. `HTTP/1.1`.
    pub version: String,
    /// Request headers.
    pub headers: Headers,
    /// Body of `Content-Length` bytes.
    pub body: Bytes,
}

impl HttpRequest {
    /// Returns the target without its query string.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Parses one request from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything while the request is
    /// incomplete. On success the request bytes are removed from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] for a malformed request or one larger
    /// than `max_size`.
    pub fn parse(buf: &mut BytesMut, max_size: usize) -> Result<Option<Self>> {
        let Some(head_len) = buf
            .windows(HEAD_TERMINATOR.len())
            .position(|w| w == HEAD_TERMINATOR)
        else {
            if buf.len() > max_size {
                return Err(Error::handshake(format!(
                    "request head exceeds {max_size} bytes"
                )));
            }
            return Ok(None);
        };

        if head_len > max_size {
            return Err(Error::handshake(format!(
                "request head exceeds {max_size} bytes"
            )));
        }

        let head = std::str::from_utf8(&buf[..head_len])
            .map_err(|_| Error::handshake("request head is not valid UTF-8"))?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::handshake(format!(
                "malformed request line: {request_line:?}"
            )));
        };

        if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
            return Err(Error::handshake(format!(
                "malformed request line: {request_line:?}"
            )));
        }

        let mut headers = Headers::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::handshake(format!("malformed header line: {line:?}")))?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(Error::handshake(format!("malformed header name: {name:?}")));
            }
            headers.append(name, value.trim());
        }

        let content_length = match headers.get("Content-Length") {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| Error::handshake(format!("invalid Content-Length: {value:?}")))?,
            None => 0,
        };

        let body_start = head_len + HEAD_TERMINATOR.len();
        if content_length > max_size.saturating_sub(body_start) {
            return Err(Error::handshake(format!(
                "request exceeds {max_size} bytes"
            )));
        }
        if buf.len() < body_start + content_length {
            return Ok(None);
        }

        let request = Self {
            method: method.to_owned(),
            target: target.to_owned(),
            version: version.to_owned(),
            headers,
            body: Bytes::new(),
        };

        buf.advance(body_start);
        let body = buf.split_to(content_length).freeze();

        Ok(Some(Self { body, ..request }))
    }
}

// ============================================================================
// HttpResponse
// ============================================================================

/// An HTTP response.
///
/// Non-`101` responses are always serialized with an exact `Content-Length`
/// and `Connection: close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Headers other than `Content-Length` and `Connection`.
    pub headers: Headers,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates an empty response.
    #[must_use]
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the body and its content type.
    #[must_use]
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.append("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// `200 OK` with an HTML body.
    #[must_use]
    pub fn html(html: impl Into<String>) -> Self {
        Self::new(200, "OK").with_body("text/html; charset=utf-8", Bytes::from(html.into()))
    }

    /// `404 Not Found` with a plain-text body.
    #[must_use]
    pub fn not_found() -> Self {
        Self::new(404, "Not Found").with_body("text/plain", Bytes::from_static(b"404 Not Found"))
    }

    /// `400 Bad Request` with a plain-text body.
    #[must_use]
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
            .with_body("text/plain", Bytes::from_static(b"400 Bad Request"))
    }

    /// Returns `true` for a `101 Switching Protocols` response.
    #[inline]
    #[must_use]
    pub const fn is_upgrade(&self) -> bool {
        self.status == 101
    }

    /// Serializes the response.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in self.headers.iter() {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        if !self.is_upgrade() {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        let mut out = BytesMut::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out.freeze()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Formats `time` as an RFC 1123 date in GMT, as used by the `Date` header.
#[must_use]
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================
