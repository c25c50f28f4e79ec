//! Events raised by connections.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::identifiers::ConnectionId;
use crate::protocol::{Headers, HttpRequest, HttpResponse};

// ============================================================================
// Types
// ============================================================================

/// Event handler callback type.
///
/// Registered once when the server starts and called for every event from
/// every connection, possibly from several tasks at once. For
/// [`ServerEvent::Http`] the returned response is written back (a `404` is
/// sent when the handler returns `None`); for every other event the return
/// value is ignored.
pub type EventHandler = Arc<dyn Fn(ServerEvent) -> Option<HttpResponse> + Send + Sync>;

// ============================================================================
// ServerEvent
// ============================================================================

/// Something that happened on one connection.
#[derive(Debug)]
pub enum ServerEvent {
    /// Upgrade handshake completed.
    Connected {
        /// Connection id.
        id: ConnectionId,
        /// Headers of the upgrade request.
        headers: Headers,
    },

    /// Connection ended. Terminal.
    Disconnected {
        /// Connection id.
        id: ConnectionId,
        /// Close reason.
        reason: String,
        /// Close status code.
        code: u16,
    },

    /// Text message received.
    Text {
        /// Connection id.
        id: ConnectionId,
        /// Message text.
        text: String,
    },

    /// Binary message received.
    Binary {
        /// Connection id.
        id: ConnectionId,
        /// Message data.
        data: Bytes,
    },

    /// Ping received (already answered with a pong).
    Ping {
        /// Connection id.
        id: ConnectionId,
        /// Ping payload.
        data: Bytes,
    },

    /// Pong received.
    Pong {
        /// Connection id.
        id: ConnectionId,
        /// Pong payload.
        data: Bytes,
    },

    /// Plain HTTP request received before any upgrade.
    Http {
        /// Connection id.
        id: ConnectionId,
        /// The request.
        request: HttpRequest,
    },

    /// Connection failed. Terminal.
    Error {
        /// Connection id.
        id: ConnectionId,
        /// Cause of the failure.
        error: Error,
    },
}

impl ServerEvent {
    /// Returns the connection the event belongs to.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        match self {
            Self::Connected { id, .. }
            | Self::Disconnected { id, .. }
            | Self::Text { id, .. }
            | Self::Binary { id, .. }
            | Self::Ping { id, .. }
            | Self::Pong { id, .. }
            | Self::Http { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }

    /// Returns `true` for the last event a connection emits.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Error { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        let id = ConnectionId::generate();
        let disconnected = ServerEvent::Disconnected {
            id,
            reason: String::new(),
            code: 1000,
        };
        let error = ServerEvent::Error {
            id,
            error: Error::ConnectionClosed,
        };
        let text = ServerEvent::Text {
            id,
            text: "hi".into(),
        };

        assert!(disconnected.is_terminal());
        assert!(error.is_terminal());
        assert!(!text.is_terminal());
        assert_eq!(text.id(), id);
    }
}
