//! RFC 6455 opening handshake, server side.
//!
//! The client opens with an HTTP/1.1 GET carrying the upgrade headers; the
//! server validates them, computes the accept token
//! `base64(SHA1(key ++ GUID))`, and answers `101 Switching Protocols`:
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Any validation failure maps to an HTTP error response and a closed
//! connection; there is no renegotiation.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

use crate::http::HeaderParser;

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` token for a client key.
///
/// # Example
///
/// ```
/// use riptide::ws::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Why a handshake was refused. Every variant maps to HTTP 400.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeError {
    /// Method was not GET.
    NotGet(String),
    /// HTTP version below 1.1.
    HttpVersionTooOld,
    /// A required header is absent.
    MissingHeader(&'static str),
    /// `Upgrade` header is not `websocket`.
    NotWebSocketUpgrade(String),
    /// `Connection` header does not contain `Upgrade`.
    ConnectionNotUpgrade(String),
    /// `Sec-WebSocket-Version` is not 13.
    UnsupportedVersion(String),
    /// `Sec-WebSocket-Key` is not base64 of 16 bytes.
    InvalidKey,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotGet(method) => write!(f, "method must be GET, got '{method}'"),
            Self::HttpVersionTooOld => write!(f, "HTTP version must be at least 1.1"),
            Self::MissingHeader(name) => write!(f, "missing required header: {name}"),
            Self::NotWebSocketUpgrade(value) => {
                write!(f, "Upgrade header must be 'websocket', got '{value}'")
            }
            Self::ConnectionNotUpgrade(value) => {
                write!(f, "Connection header must contain 'Upgrade', got '{value}'")
            }
            Self::UnsupportedVersion(value) => {
                write!(f, "unsupported WebSocket version: {value}")
            }
            Self::InvalidKey => write!(f, "invalid Sec-WebSocket-Key"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Server-side handshake policy: which subprotocols we speak.
#[derive(Debug, Clone, Default)]
pub struct ServerHandshake {
    supported_protocols: Vec<String>,
}

impl ServerHandshake {
    /// A handshake accepting any request without subprotocols.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a supported subprotocol, in preference order.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.supported_protocols.push(protocol.into());
        self
    }

    /// Validates a parsed request and produces the 101 response.
    ///
    /// # Errors
    ///
    /// Any RFC 6455 §4.2.1 requirement not met.
    pub fn accept(&self, request: &HeaderParser) -> Result<AcceptResponse, HandshakeError> {
        if request.method() != "GET" {
            return Err(HandshakeError::NotGet(request.method().to_owned()));
        }
        if request.version() < (1, 1) {
            return Err(HandshakeError::HttpVersionTooOld);
        }

        let upgrade = request
            .header("upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::NotWebSocketUpgrade(upgrade));
        }

        let connection = request
            .header("connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        let mentions_upgrade = connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        if !mentions_upgrade {
            return Err(HandshakeError::ConnectionNotUpgrade(connection));
        }

        let version = request
            .header("sec-websocket-version")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
        if version.trim() != "13" {
            return Err(HandshakeError::UnsupportedVersion(version));
        }

        let client_key = request
            .header("sec-websocket-key")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        let client_key = client_key.trim();
        match base64::engine::general_purpose::STANDARD.decode(client_key) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(HandshakeError::InvalidKey),
        }

        let protocol = request.header("sec-websocket-protocol").and_then(|offered| {
            let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
            self.supported_protocols
                .iter()
                .find(|supported| offered.contains(&supported.as_str()))
                .cloned()
        });

        Ok(AcceptResponse {
            accept_key: compute_accept_key(client_key),
            protocol,
        })
    }

    /// An HTTP error response for a refused upgrade.
    #[must_use]
    pub fn reject(status: u16, reason: &str) -> Vec<u8> {
        format!("HTTP/1.1 {status} {reason}\r\nConnection: close\r\n\r\n").into_bytes()
    }
}

/// A validated upgrade, ready to be written back.
#[derive(Debug, Clone)]
pub struct AcceptResponse {
    /// Computed `Sec-WebSocket-Accept` token.
    pub accept_key: String,
    /// Negotiated subprotocol, if any.
    pub protocol: Option<String>,
}

impl AcceptResponse {
    /// The `101 Switching Protocols` response bytes.
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut response = String::from(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n",
        );
        response.push_str("Sec-WebSocket-Accept: ");
        response.push_str(&self.accept_key);
        response.push_str("\r\n");
        if let Some(protocol) = &self.protocol {
            response.push_str("Sec-WebSocket-Protocol: ");
            response.push_str(protocol);
            response.push_str("\r\n");
        }
        response.push_str("\r\n");
        response.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Progress;

    fn parse(request: &str) -> HeaderParser {
        let mut parser = HeaderParser::new();
        match parser.feed(request.as_bytes()).expect("parse") {
            Progress::Complete { .. } => parser,
            Progress::Partial => panic!("incomplete request"),
        }
    }

    const GOOD: &str = "GET /chat HTTP/1.1\r\n\
                        Host: server.example.com\r\n\
                        Upgrade: websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                        Sec-WebSocket-Version: 13\r\n\
                        \r\n";

    #[test]
    fn rfc_accept_vector() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn accepts_canonical_request() {
        let response = ServerHandshake::new().accept(&parse(GOOD)).unwrap();
        assert_eq!(response.accept_key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.protocol, None);

        let bytes = response.response_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let request = GOOD
            .replace("Upgrade: websocket", "upgrade: WebSocket")
            .replace("Connection: Upgrade", "CONNECTION: keep-alive, upgrade");
        ServerHandshake::new().accept(&parse(&request)).unwrap();
    }

    #[test]
    fn rejects_non_get() {
        let request = GOOD.replace("GET /chat", "POST /chat");
        let err = ServerHandshake::new().accept(&parse(&request)).unwrap_err();
        assert_eq!(err, HandshakeError::NotGet("POST".into()));
    }

    #[test]
    fn rejects_http_10() {
        let request = GOOD.replace("HTTP/1.1", "HTTP/1.0");
        let err = ServerHandshake::new().accept(&parse(&request)).unwrap_err();
        assert_eq!(err, HandshakeError::HttpVersionTooOld);
    }

    #[test]
    fn rejects_wrong_version() {
        let request = GOOD.replace("Version: 13", "Version: 8");
        let err = ServerHandshake::new().accept(&parse(&request)).unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedVersion("8".into()));
    }

    #[test]
    fn rejects_missing_headers() {
        for (line, header) in [
            ("Upgrade: websocket\r\n", "Upgrade"),
            ("Connection: Upgrade\r\n", "Connection"),
            (
                "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
                "Sec-WebSocket-Key",
            ),
            ("Sec-WebSocket-Version: 13\r\n", "Sec-WebSocket-Version"),
        ] {
            let request = GOOD.replace(line, "");
            let err = ServerHandshake::new().accept(&parse(&request)).unwrap_err();
            assert_eq!(err, HandshakeError::MissingHeader(header));
        }
    }

    #[test]
    fn rejects_bad_keys() {
        for bad in ["short", "bm90IHNpeHRlZW4gYnl0ZXMhIQ==", "!!!not-base64!!!"] {
            let request = GOOD.replace("dGhlIHNhbXBsZSBub25jZQ==", bad);
            let err = ServerHandshake::new().accept(&parse(&request)).unwrap_err();
            assert_eq!(err, HandshakeError::InvalidKey);
        }
    }

    #[test]
    fn negotiates_first_supported_protocol() {
        let request = GOOD.replace(
            "Sec-WebSocket-Version: 13\r\n",
            "Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: superchat, chat\r\n",
        );
        let response = ServerHandshake::new()
            .protocol("chat")
            .protocol("log")
            .accept(&parse(&request))
            .unwrap();
        assert_eq!(response.protocol.as_deref(), Some("chat"));
        let bytes = response.response_bytes();
        assert!(std::str::from_utf8(&bytes)
            .unwrap()
            .contains("Sec-WebSocket-Protocol: chat\r\n"));
    }

    #[test]
    fn reject_response_shape() {
        let bytes = ServerHandshake::reject(400, "Bad Request");
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n"
        );
    }
}
