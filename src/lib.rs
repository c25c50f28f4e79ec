//! WebSocket Logger - stream application logs to browser viewers.
//!
//! This library serves a small HTML log viewer over HTTP and pushes every
//! log record to all connected viewers over WebSocket, in order, without
//! ever blocking the code that produces the logs.
//!
//! # Architecture
//!
//! ```text
//! producer ──► Broadcaster ──► Registry ──► Connection ──► FrameCodec ──► TCP
//!                (task)       (RwLock)      (task, queue)
//!
//! TCP ──► Connection ──► HttpRequest / handshake   (before upgrade)
//!                   └──► FrameCodec ──► Reassembler (after upgrade)
//! ```
//!
//! Key design principles:
//!
//! - The protocol engine performs no I/O; connections drive it with bytes
//! - Each connection owns a bounded outbound queue; a full queue closes
//!   only that connection
//! - A single broadcast task fixes the order every viewer observes
//!
//! # Quick Start
//!
//! ```no_run
//! use tracing_subscriber::prelude::*;
//! use websocket_logger::{LogServer, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = LogServer::builder().port(8080).start().await?;
//!     println!("Log viewer: {}", server.url());
//!
//!     // Forward `tracing` events to the viewers.
//!     tracing_subscriber::registry().with(server.layer()).init();
//!
//!     tracing::info!(tag = "app", "started");
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Connection identifiers |
//! | [`logger`] | Log server, records and broadcast pipeline |
//! | [`protocol`] | HTTP handshake and WebSocket framing |
//! | [`transport`] | Connections, registry and accept loop |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Log server, records and broadcast pipeline.
///
/// Use [`LogServer::builder()`] to configure and start a server.
pub mod logger;

/// WebSocket protocol engine.
///
/// HTTP request parsing, the upgrade handshake and RFC 6455 framing.
pub mod protocol;

/// Connection handling.
///
/// Listener, per-connection event loops and the connection registry.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::ConnectionId;

// Logger types
pub use logger::{
    BroadcastLayer, Broadcaster, LogLevel, LogRecord, LogServer, LogServerBuilder,
    LogServerConfig,
};

// Protocol types
pub use protocol::{CloseFrame, Frame, FrameCodec, Message, OpCode};

// Transport types
pub use transport::{EventHandler, ServerEvent, ServerOptions, WebSocketServer};
