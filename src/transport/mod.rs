//! Connection handling on top of the protocol engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  accept   ┌────────────┐  events   ┌─────────────┐
//! │ WebSocketServer  │──────────►│ Connection │──────────►│ EventHandler│
//! │  (accept loop)   │           │  (task)    │           └─────────────┘
//! └────────┬─────────┘           └─────▲──────┘
//!          │ insert / remove           │ bounded queue
//!          ▼                           │
//!     ┌──────────┐      broadcast      │
//!     │ Registry │─────────────────────┘
//!     └──────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Connection handle and event loop |
//! | `event` | Events delivered to the application |
//! | `options` | Per-connection limits |
//! | `registry` | Live connection set and fan-out |
//! | `server` | Listener and accept loop |
//! | `state` | Sans-I/O connection state machine |

// ============================================================================
// Submodules
// ============================================================================

/// Connection handle and event loop.
pub mod connection;

/// Events delivered to the application.
pub mod event;

/// Per-connection limits and timeouts.
pub mod options;

/// Live connection set and broadcast fan-out.
pub mod registry;

/// Listener and accept loop.
pub mod server;

/// Sans-I/O connection state machine.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use event::{EventHandler, ServerEvent};
pub use options::ServerOptions;
pub use registry::Registry;
pub use server::{PendingServer, WebSocketServer};
pub use state::{Action, ConnectionMachine, ConnectionState};
