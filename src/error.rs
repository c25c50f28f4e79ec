//! Error types for the WebSocket log streamer.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use websocket_logger::{LogServer, Result};
//!
//! async fn example() -> Result<()> {
//!     let server = LogServer::builder().port(0).build()?.start().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Listener | [`Error::Bind`] |
//! | Handshake | [`Error::Handshake`] |
//! | Framing | [`Error::Protocol`], [`Error::MessageTooBig`], [`Error::InvalidUtf8`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::ConnectionNotFound`], [`Error::QueueFull`], [`Error::Timeout`] |
//! | Records | [`Error::InvalidRecord`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::net::SocketAddr;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::ConnectionId;
use crate::protocol::close_code;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when server configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Listener Errors
    // ========================================================================
    /// Failed to bind the listening socket.
    ///
    /// Address in use, permission denied or an unusable address.
    #[error("Unable to start the listener at {addr}: {source}")]
    Bind {
        /// Address the listener tried to bind.
        addr: SocketAddr,
        /// Underlying I/O failure.
        #[source]
        source: IoError,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Malformed HTTP request or unusable upgrade request.
    #[error("Handshake error: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Framing Errors
    // ========================================================================
    /// WebSocket framing rule violated by the peer.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Frame or reassembled message exceeds the configured limit.
    #[error("Message too big: {size} bytes exceeds limit of {max} bytes")]
    MessageTooBig {
        /// Announced or accumulated size.
        size: u64,
        /// Configured maximum.
        max: usize,
    },

    /// Text message payload is not valid UTF-8.
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection closed while an operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No live connection registered under the id.
    #[error("Connection not found: {id}")]
    ConnectionNotFound {
        /// The unknown connection id.
        id: ConnectionId,
    },

    /// Outbound queue of a connection is full (consumer too slow).
    #[error("Outbound queue full for connection {id}")]
    QueueFull {
        /// The slow connection.
        id: ConnectionId,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Record Errors
    // ========================================================================
    /// Log record field that cannot be represented on the wire.
    #[error("Invalid log record: {message}")]
    InvalidRecord {
        /// Description of the offending field.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a bind error.
    #[inline]
    pub fn bind(addr: SocketAddr, source: IoError) -> Self {
        Self::Bind { addr, source }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a message too big error.
    #[inline]
    pub fn message_too_big(size: u64, max: usize) -> Self {
        Self::MessageTooBig { size, max }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(id: ConnectionId) -> Self {
        Self::ConnectionNotFound { id }
    }

    /// Creates a queue full error.
    #[inline]
    pub fn queue_full(id: ConnectionId) -> Self {
        Self::QueueFull { id }
    }

    /// Creates an invalid record error.
    #[inline]
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the peer violated the HTTP or WebSocket protocol.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Handshake { .. }
                | Self::Protocol { .. }
                | Self::MessageTooBig { .. }
                | Self::InvalidUtf8
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::ConnectionNotFound { .. }
                | Self::QueueFull { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    /// Returns the close code sent to the peer when this error ends a
    /// WebSocket connection.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol { .. } | Self::Handshake { .. } => close_code::PROTOCOL_ERROR,
            Self::MessageTooBig { .. } => close_code::MESSAGE_TOO_BIG,
            Self::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            Self::QueueFull { .. } => close_code::POLICY_VIOLATION,
            _ => close_code::INTERNAL_ERROR,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
