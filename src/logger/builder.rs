//! Builder pattern for log server configuration.
//!
//! # Example
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use websocket_logger::LogServer;
//!
//! # async fn example() -> websocket_logger::Result<()> {
//! let server = LogServer::builder()
//!     .bind_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
//!     .port(9000)
//!     .public_host("192.168.1.20")
//!     .start()
//!     .await?;
//!
//! println!("open {}", server.url());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::transport::ServerOptions;

use super::assets::{VIEWER_HTML_TEMPLATE, WS_URL_PLACEHOLDER};
use super::server::LogServer;

// ============================================================================
// Constants
// ============================================================================

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind address.
pub const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default time allowed for queued records to drain on stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// LogServerConfig
// ============================================================================

/// Validated log server configuration.
#[derive(Debug, Clone)]
pub struct LogServerConfig {
    /// Address to bind.
    pub bind_ip: IpAddr,
    /// Port to bind; `0` lets the OS choose.
    pub port: u16,
    /// Host shown in the viewer's WebSocket URL.
    pub public_host: Option<String>,
    /// Viewer page containing `{{WS_URL}}`.
    pub viewer_template: String,
    /// Per-connection limits.
    pub server: ServerOptions,
    /// Time allowed for queued records to drain on stop.
    pub shutdown_timeout: Duration,
}

impl Default for LogServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: DEFAULT_BIND_IP,
            port: DEFAULT_PORT,
            public_host: None,
            viewer_template: VIEWER_HTML_TEMPLATE.to_owned(),
            server: ServerOptions::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

// ============================================================================
// LogServerBuilder
// ============================================================================

/// Builder for a [`LogServer`].
///
/// Use [`LogServer::builder()`] to create one.
#[derive(Debug, Default, Clone)]
pub struct LogServerBuilder {
    config: LogServerConfig,
}

impl LogServerBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the address to bind.
    #[inline]
    #[must_use]
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.bind_ip = ip;
        self
    }

    /// Sets the port; `0` lets the OS choose.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the host shown in the viewer's WebSocket URL.
    ///
    /// Useful when binding `0.0.0.0` so viewers on other machines get a
    /// reachable address.
    #[inline]
    #[must_use]
    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.config.public_host = Some(host.into());
        self
    }

    /// Replaces the viewer page. `{{WS_URL}}` is substituted on start.
    #[inline]
    #[must_use]
    pub fn viewer_template(mut self, html: impl Into<String>) -> Self {
        self.config.viewer_template = html.into();
        self
    }

    /// Sets how many frames may queue per viewer before it is dropped.
    #[inline]
    #[must_use]
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.config.server.outbound_capacity = capacity;
        self
    }

    /// Sets the largest frame accepted from a viewer.
    #[inline]
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.server.max_frame_size = size;
        self
    }

    /// Sets the largest reassembled message accepted from a viewer.
    #[inline]
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.server.max_message_size = size;
        self
    }

    /// Sets the largest HTTP request accepted.
    #[inline]
    #[must_use]
    pub fn max_request_size(mut self, size: usize) -> Self {
        self.config.server.max_request_size = size;
        self
    }

    /// Sets the time allowed for one write to a viewer.
    #[inline]
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.server.write_timeout = timeout;
        self
    }

    /// Sets the time allowed for queued records to reach viewers on stop.
    #[inline]
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self.config.server.shutdown_timeout = timeout;
        self
    }

    /// Replaces all per-connection limits at once.
    #[inline]
    #[must_use]
    pub fn server_options(mut self, options: ServerOptions) -> Self {
        self.config.server = options;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a limit or timeout is unusable or the
    /// public host is empty.
    pub fn build(self) -> Result<LogServerConfig> {
        let config = self.config;
        config.server.validate()?;

        if config.shutdown_timeout.is_zero() {
            return Err(Error::config("shutdown_timeout must be greater than 0"));
        }

        if let Some(host) = &config.public_host
            && host.trim().is_empty()
        {
            return Err(Error::config(
                "public_host must not be empty. Omit it to use the bound address.",
            ));
        }

        if !config.viewer_template.contains(WS_URL_PLACEHOLDER) {
            warn!("Viewer template has no {WS_URL_PLACEHOLDER} placeholder");
        }

        Ok(config)
    }

    /// Validates the configuration and starts the server.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if validation fails
    /// - [`Error::Bind`] if the address cannot be bound
    pub async fn start(self) -> Result<LogServer> {
        LogServer::start(self.build()?).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogServerBuilder::new().build().unwrap();
        assert_eq!(config.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.port, 8080);
        assert!(config.public_host.is_none());
        assert_eq!(config.viewer_template, VIEWER_HTML_TEMPLATE);
        assert_eq!(config.server, ServerOptions::default());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_setters() {
        let config = LogServerBuilder::new()
            .bind_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .port(0)
            .public_host("logs.local")
            .viewer_template("<p>{{WS_URL}}</p>")
            .outbound_capacity(64)
            .write_timeout(Duration::from_secs(1))
            .shutdown_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.bind_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.port, 0);
        assert_eq!(config.public_host.as_deref(), Some("logs.local"));
        assert_eq!(config.viewer_template, "<p>{{WS_URL}}</p>");
        assert_eq!(config.server.outbound_capacity, 64);
        assert_eq!(config.server.write_timeout, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(config.server.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_server_options() {
        let result = LogServerBuilder::new().outbound_capacity(0).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_zero_shutdown_timeout() {
        let result = LogServerBuilder::new()
            .shutdown_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_public_host() {
        let result = LogServerBuilder::new().public_host("  ").build();
        assert!(result.is_err());
    }
}
