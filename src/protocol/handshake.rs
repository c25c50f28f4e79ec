//! WebSocket opening handshake.
//!
//! Classifies a parsed HTTP request as a WebSocket upgrade or a plain
//! request, and builds the `101 Switching Protocols` response.

// ============================================================================
// Imports
// ============================================================================

use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

use super::http::{HttpRequest, HttpResponse, http_date};

// ============================================================================
// Constants
// ============================================================================

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

// ============================================================================
// Types
// ============================================================================

/// The parts of an upgrade request needed to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Client `Sec-WebSocket-Key`.
    pub key: String,
    /// Subprotocol selected from `Sec-WebSocket-Protocol`, if any.
    pub protocol: Option<String>,
}

/// How a parsed request must be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// WebSocket upgrade.
    Upgrade(UpgradeRequest),
    /// Plain HTTP request for the application.
    Plain,
}

// ============================================================================
// Public Functions
// ============================================================================

/// Computes `Sec-WebSocket-Accept` for a client key.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Classifies `request`.
///
/// A request is an upgrade when its `Upgrade` header names `websocket`.
///
/// # Errors
///
/// Returns [`Error::Handshake`] when an upgrade request is not a `GET`, has
/// no `Sec-WebSocket-Key`, or its key is not 16 bytes of base64.
pub fn classify(request: &HttpRequest) -> Result<RequestKind> {
    if !request.headers.has_token("Upgrade", "websocket") {
        return Ok(RequestKind::Plain);
    }

    if request.method != "GET" {
        return Err(Error::handshake(format!(
            "upgrade request must use GET, got {}",
            request.method
        )));
    }

    let key = request
        .headers
        .get("Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or_else(|| Error::handshake("upgrade request without Sec-WebSocket-Key"))?;

    match BASE64.decode(key) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => {
            return Err(Error::handshake(format!(
                "invalid Sec-WebSocket-Key: {key:?}"
            )));
        }
    }

    let protocol = request
        .headers
        .get("Sec-WebSocket-Protocol")
        .and_then(|list| list.split(',').map(str::trim).find(|p| !p.is_empty()))
        .map(str::to_owned);

    Ok(RequestKind::Upgrade(UpgradeRequest {
        key: key.to_owned(),
        protocol,
    }))
}

/// Builds the `101 Switching Protocols` response for `upgrade`.
#[must_use]
pub fn upgrade_response(upgrade: &UpgradeRequest, now: SystemTime) -> HttpResponse {
    let response = HttpResponse::new(101, "Switching Protocols")
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", accept_key(&upgrade.key))
        .with_header("Sec-WebSocket-Version", WEBSOCKET_VERSION)
        .with_header("Date", http_date(now));

    match &upgrade.protocol {
        Some(protocol) => response.with_header("Sec-WebSocket-Protocol", protocol.as_str()),
        None => response,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;

    use crate::protocol::http::DEFAULT_MAX_REQUEST_SIZE;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(raw: &str) -> HttpRequest {
        let mut buf = BytesMut::from(raw.as_bytes());
        HttpRequest::parse(&mut buf, DEFAULT_MAX_REQUEST_SIZE)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(accept_key(RFC_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_classify_upgrade() {
        let req = request(&format!(
            "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {RFC_KEY}\r\nSec-WebSocket-Protocol: chat, superchat\r\n\r\n"
        ));
        let kind = classify(&req).unwrap();
        assert_eq!(
            kind,
            RequestKind::Upgrade(UpgradeRequest {
                key: RFC_KEY.into(),
                protocol: Some("chat".into()),
            })
        );
    }

    #[test]
    fn test_classify_plain() {
        let req = request("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(classify(&req).unwrap(), RequestKind::Plain);
    }

    #[test]
    fn test_upgrade_without_key_is_error() {
        let req = request("GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert!(matches!(classify(&req), Err(Error::Handshake { .. })));
    }

    #[test]
    fn test_upgrade_with_bad_key_is_error() {
        let req = request("GET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: short\r\n\r\n");
        assert!(classify(&req).is_err());
    }

    #[test]
    fn test_upgrade_with_post_is_error() {
        let req = request(&format!(
            "POST / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {RFC_KEY}\r\n\r\n"
        ));
        assert!(classify(&req).is_err());
    }

    #[test]
    fn test_upgrade_response_headers() {
        let upgrade = UpgradeRequest {
            key: RFC_KEY.into(),
            protocol: Some("chat".into()),
        };
        let response = upgrade_response(&upgrade, SystemTime::UNIX_EPOCH);
        let text = String::from_utf8(response.to_bytes().to_vec()).unwrap();

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains("Date: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_upgrade_response_without_protocol() {
        let upgrade = UpgradeRequest {
            key: RFC_KEY.into(),
            protocol: None,
        };
        let response = upgrade_response(&upgrade, SystemTime::now());
        assert!(response.headers.get("Sec-WebSocket-Protocol").is_none());
    }
}
