//! Log streaming on top of the WebSocket server.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`LogServer`] | Serves the viewer page and owns the pipeline |
//! | [`LogServerBuilder`] | Fluent configuration builder |
//! | [`Broadcaster`] | Non-blocking producer handle |
//! | [`LogRecord`] | One log event and its JSON wire form |
//! | [`BroadcastLayer`] | `tracing` layer feeding the broadcaster |
//!
//! # Example
//!
//! ```no_run
//! use websocket_logger::{LogLevel, LogServer, Result};
//!
//! # async fn example() -> Result<()> {
//! let server = LogServer::builder().port(8080).start().await?;
//! println!("open {} in a browser", server.url());
//!
//! server.log(LogLevel::Info, "hello viewers");
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Viewer page and HTTP routing.
pub mod assets;

/// Ordered fan-out of log records.
pub mod broadcaster;

/// Fluent builder for log server configuration.
pub mod builder;

/// `tracing` layer.
pub mod layer;

/// Log records and their JSON wire format.
pub mod record;

/// Log server façade.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use broadcaster::Broadcaster;
pub use builder::{LogServerBuilder, LogServerConfig};
pub use layer::BroadcastLayer;
pub use record::{LogLevel, LogRecord};
pub use server::LogServer;
