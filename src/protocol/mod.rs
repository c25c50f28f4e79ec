//! WebSocket protocol engine.
//!
//! This module implements the wire side of a viewer connection: the HTTP
//! upgrade handshake and RFC 6455 framing. Nothing here performs I/O; the
//! transport layer feeds bytes in and writes the produced bytes out.
//!
//! # Protocol Overview
//!
//! | Stage | Direction | Module |
//! |-------|-----------|--------|
//! | HTTP request | Client → Server | `http` |
//! | `101 Switching Protocols` | Server → Client | `handshake` |
//! | Frames | Both | `frame` |
//! | Messages | Client → Server | `reassembler` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame codec, opcodes, close codes |
//! | `handshake` | Upgrade detection and accept token |
//! | `http` | HTTP request parser and response builder |
//! | `reassembler` | Fragment reassembly into messages |

// ============================================================================
// Submodules
// ============================================================================

/// Frame codec, opcodes and close codes.
pub mod frame;

/// Upgrade detection and accept token.
pub mod handshake;

/// HTTP request parser and response builder.
pub mod http;

/// Fragment reassembly.
pub mod reassembler;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{CloseFrame, Frame, FrameCodec, OpCode, Role, close_code};
pub use handshake::{RequestKind, UpgradeRequest, accept_key};
pub use http::{Headers, HttpRequest, HttpResponse};
pub use reassembler::{Message, Reassembler};
