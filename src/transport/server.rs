//! WebSocket server: listener, accept loop and connection registry.
//!
//! # Connection Flow
//!
//! 1. [`PendingServer::bind`] binds the listener (port `0` picks a free port)
//! 2. [`PendingServer::start`] spawns the accept loop with an event handler
//! 3. Each accepted stream becomes a [`Connection`] in the registry
//! 4. Clients either upgrade to WebSocket or get one HTTP response
//! 5. [`WebSocketServer::stop`] stops accepting, [`WebSocketServer::shutdown`]
//!    also closes every live connection once its queued frames are written

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{Message, close_code};

use super::connection::{Connection, SHUTDOWN_REASON};
use super::event::EventHandler;
use super::options::ServerOptions;
use super::registry::Registry;

// ============================================================================
// Constants
// ============================================================================

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// PendingServer
// ============================================================================

/// A server that is bound but not yet accepting.
///
/// Splitting bind from start lets the caller learn the actual port (for
/// example to render a URL) before any connection is handled.
///
/// # Example
///
/// ```no_run
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::sync::Arc;
/// use websocket_logger::transport::{PendingServer, ServerOptions};
///
/// # async fn example() -> websocket_logger::Result<()> {
/// let pending =
///     PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, ServerOptions::default()).await?;
/// println!("listening on {}", pending.local_addr());
///
/// let server = pending.start(Arc::new(|_event| None));
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PendingServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    options: ServerOptions,
}

impl PendingServer {
    /// Binds a listener to `ip:port`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid
    /// - [`Error::Bind`] if the address is in use, not permitted or invalid
    pub async fn bind(ip: IpAddr, port: u16, options: ServerOptions) -> Result<Self> {
        options.validate()?;

        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| Error::bind(addr, e))?;

        debug!(%local_addr, "WebSocket server bound");

        Ok(Self {
            listener,
            local_addr,
            options,
        })
    }

    /// Returns the bound address, with the actual port.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the accept loop. Every connection event goes to `handler`.
    #[must_use]
    pub fn start(self, handler: EventHandler) -> WebSocketServer {
        let inner = Arc::new(ServerInner {
            local_addr: self.local_addr,
            options: self.options,
            registry: Arc::new(Registry::new()),
            handler,
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&inner).accept_loop(self.listener));
        *inner.accept_task.lock() = Some(task);

        info!(local_addr = %inner.local_addr, "WebSocket server started");

        WebSocketServer { inner }
    }
}

// ============================================================================
// WebSocketServer
// ============================================================================

/// A running WebSocket server.
///
/// Cheap to clone; all clones control the same server.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    local_addr: SocketAddr,
    options: ServerOptions,
    registry: Arc<Registry>,
    handler: EventHandler,
    /// Stops the accept loop.
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.inner.registry.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// WebSocketServer - Constructor
// ============================================================================

impl WebSocketServer {
    /// Binds `ip:port` and starts accepting.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid
    /// - [`Error::Bind`] if binding fails
    pub async fn start(
        ip: IpAddr,
        port: u16,
        options: ServerOptions,
        handler: EventHandler,
    ) -> Result<Self> {
        Ok(PendingServer::bind(ip, port, options).await?.start(handler))
    }
}

// ============================================================================
// WebSocketServer - Public API
// ============================================================================

impl WebSocketServer {
    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Returns the WebSocket URL for the bound address.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.inner.local_addr)
    }

    /// Returns the number of registered connections, upgraded or not.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Returns the ids of registered connections.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids()
    }

    /// Returns `true` while the accept loop runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Queues a message on one connection.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionNotFound`] if `id` is not registered
    /// - [`Error::QueueFull`] if its outbound queue is full
    /// - [`Error::ConnectionClosed`] if it is closing
    pub fn send(&self, id: ConnectionId, message: Message) -> Result<()> {
        self.connection(id)?.send(message)
    }

    /// Closes one connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if `id` is not registered.
    pub fn close(&self, id: ConnectionId, code: u16, reason: &str) -> Result<()> {
        self.connection(id)?.close(code, reason);
        Ok(())
    }

    /// Queues a message on every upgraded connection.
    ///
    /// Returns the number of connections it was queued on.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.inner.registry.broadcast(message)
    }

    /// Serves an already connected stream, as if it had been accepted.
    ///
    /// Returns the new connection's id.
    pub fn attach<S>(&self, stream: S, peer_addr: Option<SocketAddr>) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.spawn_connection(stream, peer_addr)
    }

    /// Stops accepting new connections and releases the listener.
    ///
    /// Live connections stay open.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Accept loop panicked");
        }
    }

    /// Stops accepting and closes every live connection with `1001`.
    ///
    /// Waits up to the configured shutdown timeout; see
    /// [`WebSocketServer::shutdown_within`].
    pub async fn shutdown(&self) -> bool {
        self.shutdown_within(self.inner.options.shutdown_timeout).await
    }

    /// Stops accepting and closes every live connection with `1001`.
    ///
    /// Each connection writes the frames already queued on it, then the
    /// close frame. Connections still running after `grace` are aborted and
    /// dropped from the registry.
    ///
    /// Returns `true` if every connection finished within `grace`.
    pub async fn shutdown_within(&self, grace: Duration) -> bool {
        self.stop().await;

        let registry = &self.inner.registry;
        let tasks = registry.tasks();

        // Entries stay registered until their own task removes them, so no
        // event is delivered for an id that is already gone.
        let connections = registry.snapshot();
        let count = connections.len();
        for connection in connections {
            tasks.spawn(async move {
                connection
                    .close_when_flushed(close_code::GOING_AWAY, SHUTDOWN_REASON)
                    .await;
            });
        }
        tasks.close();

        let drained = timeout(grace, tasks.wait()).await.is_ok();
        if !drained {
            let stragglers = registry.drain();
            warn!(
                count = stragglers.len(),
                ?grace,
                "Aborting connections still open after shutdown grace period"
            );
            for connection in stragglers {
                connection.terminate();
            }
        }

        info!(count, drained, "WebSocket server shut down");
        drained
    }

    fn connection(&self, id: ConnectionId) -> Result<Connection> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| Error::connection_not_found(id))
    }
}

// ============================================================================
// ServerInner - Accept Loop
// ============================================================================

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, %addr, "Failed to set TCP_NODELAY");
                        }
                        self.spawn_connection(stream, Some(addr));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        debug!("Accept loop terminated");
    }

    fn spawn_connection<S>(&self, stream: S, peer_addr: Option<SocketAddr>) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Connection::spawn(
            stream,
            peer_addr,
            &self.options,
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
        )
        .id()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::Decoder;

    use crate::protocol::frame::DEFAULT_MAX_FRAME_SIZE;
    use crate::protocol::{CloseFrame, FrameCodec, OpCode};
    use crate::transport::event::ServerEvent;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const UPGRADE: &[u8] = b"GET / HTTP/1.1\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    /// Connects a raw client and reads the `101` head.
    async fn upgraded_client(server: &WebSocketServer) -> TcpStream {
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(UPGRADE).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0_u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 101"));
        stream
    }

    async fn start() -> WebSocketServer {
        WebSocketServer::start(LOCALHOST, 0, ServerOptions::default(), Arc::new(|_| None))
            .await
            .expect("bind should succeed")
    }

    #[tokio::test]
    async fn test_bind_random_port() {
        let server = start().await;
        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert_eq!(server.connection_count(), 0);
        assert!(server.is_running());
        server.shutdown().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_bind_in_use_is_bind_error() {
        let server = start().await;
        let result = PendingServer::bind(LOCALHOST, server.port(), ServerOptions::default()).await;
        assert!(matches!(result, Err(Error::Bind { .. })));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let options = ServerOptions::default().with_outbound_capacity(0);
        let result = PendingServer::bind(LOCALHOST, 0, options).await;
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let server = start().await;
        let id = ConnectionId::generate();
        assert!(matches!(
            server.send(id, Message::from("x")),
            Err(Error::ConnectionNotFound { .. })
        ));
        assert!(server.close(id, close_code::NORMAL, "").is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_releases_listener() {
        let server = start().await;
        let addr = server.local_addr();
        server.stop().await;

        // The port can be bound again once the listener is gone.
        let rebound = PendingServer::bind(addr.ip(), addr.port(), ServerOptions::default()).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_writes_queued_frames_before_close() {
        let disconnects = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&disconnects);
        let server = WebSocketServer::start(
            LOCALHOST,
            0,
            ServerOptions::default(),
            Arc::new(move |event| {
                if let ServerEvent::Disconnected { code, .. } = event {
                    sink.lock().push(code);
                }
                None
            }),
        )
        .await
        .unwrap();

        let mut client = upgraded_client(&server).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..100 {
            assert_eq!(server.broadcast(&Message::from(format!("m{i}").as_str())), 1);
        }

        assert!(server.shutdown().await);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(*disconnects.lock(), vec![close_code::GOING_AWAY]);

        let mut wire = Vec::new();
        client.read_to_end(&mut wire).await.unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let mut codec = FrameCodec::client(DEFAULT_MAX_FRAME_SIZE);
        for i in 0..100 {
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(&frame.payload[..], format!("m{i}").as_bytes());
        }
        let close = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(close.opcode, OpCode::Close);
        let close = CloseFrame::parse(&close.payload).unwrap().unwrap();
        assert_eq!(close.code, close_code::GOING_AWAY);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stalled_connection_after_grace() {
        let options = ServerOptions::default().with_shutdown_timeout(Duration::from_millis(200));
        let server = WebSocketServer::start(LOCALHOST, 0, options, Arc::new(|_| None))
            .await
            .unwrap();

        // Never reads, so large frames back up in the socket.
        let _client = upgraded_client(&server).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let payload = "x".repeat(256 * 1024);
        for _ in 0..64 {
            server.broadcast(&Message::from(payload.as_str()));
        }

        let started = tokio::time::Instant::now();
        assert!(!server.shutdown().await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_plain_http_over_tcp() {
        let server = start().await;
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with(b"404 Not Found"));
        server.shutdown().await;
    }
}
