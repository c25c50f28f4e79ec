//! Log server: viewer page, WebSocket endpoint and broadcast pipeline.
//!
//! # Example
//!
//! ```no_run
//! use websocket_logger::{LogLevel, LogRecord, LogServer};
//!
//! # async fn example() -> websocket_logger::Result<()> {
//! let server = LogServer::builder().port(0).start().await?;
//! println!("viewer at {}", server.url());
//!
//! server.log(LogLevel::Info, "service started");
//! server.broadcaster().broadcast(
//!     LogRecord::new(LogLevel::Warn, "cache miss").with_tag("cache"),
//! );
//!
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::{EventHandler, PendingServer, ServerEvent, WebSocketServer};

use super::assets;
use super::broadcaster::Broadcaster;
use super::builder::{LogServerBuilder, LogServerConfig};
use super::layer::BroadcastLayer;
use super::record::{LogLevel, LogRecord};

// ============================================================================
// Types
// ============================================================================

struct LogServerInner {
    server: WebSocketServer,
    broadcaster: Broadcaster,
    broadcast_task: Mutex<Option<JoinHandle<()>>>,
    ws_url: String,
    url: String,
    config: LogServerConfig,
}

// ============================================================================
// LogServer
// ============================================================================

/// Serves the log viewer and streams log records to every connected viewer.
///
/// Cheap to clone; all clones control the same server.
#[derive(Clone)]
pub struct LogServer {
    inner: Arc<LogServerInner>,
}

impl fmt::Debug for LogServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogServer")
            .field("url", &self.inner.url)
            .field("viewers", &self.viewer_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// LogServer - Lifecycle
// ============================================================================

impl LogServer {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> LogServerBuilder {
        LogServerBuilder::new()
    }

    /// Binds, starts accepting viewers and spawns the broadcast pipeline.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`](crate::Error::Config) if the limits are invalid
    /// - [`Error::Bind`](crate::Error::Bind) if the address cannot be bound
    pub async fn start(config: LogServerConfig) -> Result<Self> {
        let pending =
            PendingServer::bind(config.bind_ip, config.port, config.server.clone()).await?;
        let local_addr = pending.local_addr();

        let host = display_host(config.public_host.as_deref(), local_addr.ip());
        let ws_url = format!("ws://{host}:{}", local_addr.port());
        let url = format!("http://{host}:{}", local_addr.port());

        let page: Arc<str> = assets::render_viewer(&config.viewer_template, &ws_url).into();
        let server = pending.start(viewer_handler(page));
        let (broadcaster, task) = Broadcaster::spawn(server.clone());

        info!(%local_addr, %url, "Log server started");

        Ok(Self {
            inner: Arc::new(LogServerInner {
                server,
                broadcaster,
                broadcast_task: Mutex::new(Some(task)),
                ws_url,
                url,
                config,
            }),
        })
    }

    /// Stops the server.
    ///
    /// New viewers are refused at once. Records queued before the call are
    /// fanned out and written to every viewer still connected, then each
    /// viewer is closed with `1001 Going Away`. The whole sequence is bounded
    /// by the configured shutdown timeout; viewers still open after it are
    /// dropped.
    pub async fn stop(&self) {
        let deadline = Instant::now() + self.inner.config.shutdown_timeout;

        self.inner.server.stop().await;
        self.inner.broadcaster.stop();

        let task = self.inner.broadcast_task.lock().take();
        if let Some(mut task) = task {
            match timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!("Broadcast queue drained"),
                Ok(Err(e)) => warn!(error = %e, "Broadcast task failed"),
                Err(_) => {
                    warn!(timeout = ?self.inner.config.shutdown_timeout, "Broadcast drain timed out");
                    task.abort();
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.inner.server.shutdown_within(remaining).await;
        info!("Log server stopped");
    }
}

// ============================================================================
// LogServer - Public API
// ============================================================================

impl LogServer {
    /// Returns the viewer page URL, e.g. `http://127.0.0.1:8080`.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Returns the WebSocket URL substituted into the viewer page.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.inner.ws_url
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.server.local_addr()
    }

    /// Returns the number of open connections, including viewers still in
    /// the handshake.
    #[inline]
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.inner.server.connection_count()
    }

    /// Returns the underlying WebSocket server.
    #[inline]
    #[must_use]
    pub fn websocket(&self) -> &WebSocketServer {
        &self.inner.server
    }

    /// Returns a producer handle for the broadcast pipeline.
    #[inline]
    #[must_use]
    pub fn broadcaster(&self) -> Broadcaster {
        self.inner.broadcaster.clone()
    }

    /// Queues a record. Never blocks.
    pub fn broadcast(&self, record: LogRecord) -> bool {
        self.inner.broadcaster.broadcast(record)
    }

    /// Queues a record with only a level and message. Never blocks.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        self.inner.broadcaster.log(level, message)
    }

    /// Returns a `tracing` layer that forwards events to the viewers.
    #[must_use]
    pub fn layer(&self) -> BroadcastLayer {
        BroadcastLayer::new(self.broadcaster())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Host shown to viewers: the configured public host, else the bound IP,
/// else `localhost` when bound to an unspecified address.
fn display_host(public_host: Option<&str>, ip: IpAddr) -> String {
    match public_host {
        Some(host) => host.to_owned(),
        None if ip.is_unspecified() => "localhost".to_owned(),
        None => match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        },
    }
}

/// Handler serving the viewer page and logging connection lifecycle.
fn viewer_handler(page: Arc<str>) -> EventHandler {
    Arc::new(move |event| match event {
        ServerEvent::Http { id, request } => {
            debug!(%id, method = %request.method, target = %request.target, "HTTP request");
            Some(assets::route(&request, &page))
        }
        ServerEvent::Connected { id, headers } => {
            info!(%id, user_agent = headers.get("User-Agent").unwrap_or("-"), "Viewer connected");
            None
        }
        ServerEvent::Disconnected { id, code, reason } => {
            info!(%id, code, %reason, "Viewer disconnected");
            None
        }
        ServerEvent::Error { id, error } => {
            warn!(%id, error = %error, "Viewer connection failed");
            None
        }
        ServerEvent::Text { id, .. } | ServerEvent::Binary { id, .. } => {
            debug!(%id, "Ignoring message from viewer");
            None
        }
        ServerEvent::Ping { .. } | ServerEvent::Pong { .. } => None,
    })
}

// ============================================================================
// Tests
// ============================================================================
