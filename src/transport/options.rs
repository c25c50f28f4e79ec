//! Per-connection limits and timeouts.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use websocket_logger::transport::ServerOptions;
//!
//! let options = ServerOptions::new()
//!     .with_outbound_capacity(256)
//!     .with_write_timeout(Duration::from_secs(2));
//!
//! assert!(options.validate().is_ok());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::frame::{DEFAULT_MAX_FRAME_SIZE, MAX_CONTROL_PAYLOAD};
use crate::protocol::http::DEFAULT_MAX_REQUEST_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Default number of queued outbound frames per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Default time allowed for a single transport write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time live connections get to flush and close on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// ServerOptions
// ============================================================================

/// Limits applied to every accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Largest single frame payload accepted from a client.
    pub max_frame_size: usize,

    /// Largest reassembled message accepted from a client.
    pub max_message_size: usize,

    /// Largest HTTP request (head plus body) accepted before upgrade.
    pub max_request_size: usize,

    /// Outbound frames that may queue before the consumer counts as too slow.
    pub outbound_capacity: usize,

    /// Time allowed for one transport write before the connection fails.
    pub write_timeout: Duration,

    /// Time connections get to write queued frames and close on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerOptions {
    /// Creates options with default limits.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ServerOptions {
    /// Sets the frame payload limit.
    #[inline]
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the reassembled message limit.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the HTTP request limit.
    #[inline]
    #[must_use]
    pub fn with_max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    /// Sets the outbound queue capacity.
    #[inline]
    #[must_use]
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Sets the write timeout.
    #[inline]
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[inline]
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ServerOptions {
    /// Validates the limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a limit is zero or too small to be usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < MAX_CONTROL_PAYLOAD {
            return Err(Error::config(format!(
                "max_frame_size must be at least {MAX_CONTROL_PAYLOAD} bytes"
            )));
        }
        if self.max_message_size < self.max_frame_size {
            return Err(Error::config(
                "max_message_size must not be smaller than max_frame_size",
            ));
        }
        if self.max_request_size == 0 {
            return Err(Error::config("max_request_size must be greater than 0"));
        }
        if self.outbound_capacity == 0 {
            return Err(Error::config("outbound_capacity must be greater than 0"));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::config("write_timeout must be greater than 0"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(Error::config("shutdown_timeout must be greater than 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
