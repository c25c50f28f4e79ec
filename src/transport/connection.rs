//! Viewer connection handle and event loop.
//!
//! Each accepted stream is driven by its own tokio task. The task owns the
//! stream and the [`ConnectionMachine`]; everything else talks to it through
//! a cloneable [`Connection`] handle.
//!
//! # Event Loop
//!
//! The task selects over three sources, in priority order:
//!
//! - Cancellation of the connection token (forced close)
//! - Inbound bytes from the stream
//! - Outbound commands queued on the bounded command channel
//!
//! Inbound bytes come first so a peer's ping or close is answered even while
//! a broadcast burst keeps the outbound queue full.
//!
//! Every source is turned into [`Action`]s by the machine, which the loop
//! then performs in order. Writes are bounded by the configured write
//! timeout so a stalled peer only ever stalls its own task.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{CloseFrame, HttpResponse, Message, close_code};

use super::event::{EventHandler, ServerEvent};
use super::options::ServerOptions;
use super::registry::Registry;
use super::state::{Action, ConnectionMachine};

// ============================================================================
// Constants
// ============================================================================

/// Initial capacity of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Reason sent when a connection is torn down without an explicit close.
pub(crate) const SHUTDOWN_REASON: &str = "Server shutting down";

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
#[derive(Debug)]
enum ConnectionCommand {
    /// Write an already encoded frame.
    Frame(Bytes),
    /// Close the connection.
    Close { code: u16, reason: String },
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to a live connection.
///
/// Cheap to clone. All operations are non-blocking: outbound frames are
/// placed on a bounded queue drained by the connection's own task.
#[derive(Clone)]
pub struct Connection {
    /// Connection id.
    id: ConnectionId,
    /// Remote address, when the stream has one.
    peer_addr: Option<SocketAddr>,
    /// Channel to the event loop.
    command_tx: mpsc::Sender<ConnectionCommand>,
    /// Mirrors the machine's upgraded state for broadcast filtering.
    upgraded: Arc<AtomicBool>,
    /// Forces the event loop to close.
    cancel: CancellationToken,
    /// Close frame to send when `cancel` fires.
    pending_close: Arc<Mutex<Option<CloseFrame>>>,
    /// Aborts the event loop task outright.
    task: Arc<OnceLock<AbortHandle>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("upgraded", &self.is_upgraded())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection - Spawning
// ============================================================================

impl Connection {
    /// Registers a new connection for `stream` and spawns its event loop.
    ///
    /// The connection is inserted into `registry` before the task starts, so
    /// it is reachable by id immediately. It only receives broadcasts once
    /// the upgrade handshake completes.
    pub(crate) fn spawn<S>(
        stream: S,
        peer_addr: Option<SocketAddr>,
        options: &ServerOptions,
        registry: Arc<Registry>,
        handler: EventHandler,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::generate();
        let (command_tx, command_rx) = mpsc::channel(options.outbound_capacity);

        let connection = Self {
            id,
            peer_addr,
            command_tx,
            upgraded: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            pending_close: Arc::new(Mutex::new(None)),
            task: Arc::new(OnceLock::new()),
        };

        registry.insert(connection.clone());
        debug!(%id, ?peer_addr, "Connection accepted");

        let tasks = registry.tasks().clone();
        let event_loop = EventLoop {
            machine: ConnectionMachine::new(id, options),
            connection: connection.clone(),
            registry,
            handler,
            write_timeout: options.write_timeout,
        };
        let task = tasks.spawn(event_loop.run(stream, command_rx));
        let _ = connection.task.set(task.abort_handle());

        connection
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote address, if known.
    #[inline]
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Returns `true` once the upgrade handshake has completed and the
    /// connection has not closed yet.
    #[inline]
    #[must_use]
    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }

    /// Queues a message for delivery.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if the outbound queue is full
    /// - [`Error::ConnectionClosed`] if the event loop has stopped
    pub fn send(&self, message: Message) -> Result<()> {
        self.send_frame(message.into_frame().to_bytes())
    }

    /// Queues an already encoded frame for delivery.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if the outbound queue is full
    /// - [`Error::ConnectionClosed`] if the event loop has stopped
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.command_tx
            .try_send(ConnectionCommand::Frame(frame))
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::queue_full(self.id),
                TrySendError::Closed(_) => Error::ConnectionClosed,
            })
    }

    /// Closes the connection with `code` and `reason`.
    ///
    /// Frames queued before the call are written first. When the queue is
    /// full the connection is closed immediately and queued frames are
    /// discarded.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        match self.command_tx.try_send(ConnectionCommand::Close {
            code,
            reason: reason.clone(),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.abort(code, reason),
            Err(TrySendError::Closed(_)) => {
                trace!(id = %self.id, "Close requested on finished connection");
            }
        }
    }

    /// Closes the connection immediately, discarding queued frames.
    pub fn abort(&self, code: u16, reason: impl Into<String>) {
        {
            let mut pending = self.pending_close.lock();
            if pending.is_none() {
                *pending = Some(CloseFrame::new(code, reason));
            }
        }
        self.cancel.cancel();
    }

    /// Queues a close behind every frame already queued, waiting for room
    /// in the queue if it is full.
    pub(crate) async fn close_when_flushed(&self, code: u16, reason: impl Into<String>) {
        let command = ConnectionCommand::Close {
            code,
            reason: reason.into(),
        };
        if self.command_tx.send(command).await.is_err() {
            trace!(id = %self.id, "Close requested on finished connection");
        }
    }

    /// Stops the event loop task without writing anything further.
    pub(crate) fn terminate(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.get() {
            task.abort();
        }
    }
}

// ============================================================================
// EventLoop
// ============================================================================

/// State owned by a connection task.
struct EventLoop {
    machine: ConnectionMachine,
    connection: Connection,
    registry: Arc<Registry>,
    handler: EventHandler,
    write_timeout: Duration,
}

impl EventLoop {
    async fn run<S>(mut self, mut stream: S, mut command_rx: mpsc::Receiver<ConnectionCommand>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.machine.id();
        let cancel = self.connection.cancel.clone();
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            let actions = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let close = self
                        .connection
                        .pending_close
                        .lock()
                        .take()
                        .unwrap_or_else(|| CloseFrame::new(close_code::GOING_AWAY, SHUTDOWN_REASON));
                    self.machine.close(close.code, &close.reason)
                }

                result = stream.read_buf(&mut read_buf) => match result {
                    Ok(0) => self.machine.peer_closed(),
                    Ok(n) => {
                        trace!(%id, bytes = n, "Read from transport");
                        let actions = self.machine.receive(&read_buf);
                        read_buf.clear();
                        actions
                    }
                    Err(e) => self.machine.fail(Error::Io(e)),
                },

                command = command_rx.recv() => match command {
                    Some(ConnectionCommand::Frame(frame)) => self.machine.send(frame),
                    Some(ConnectionCommand::Close { code, reason }) => {
                        self.machine.close(code, &reason)
                    }
                    None => self.machine.close(close_code::GOING_AWAY, SHUTDOWN_REASON),
                },
            };

            if self.perform(&mut stream, actions).await {
                break;
            }
        }

        // The terminal event normally removes the entry already.
        self.connection.upgraded.store(false, Ordering::Release);
        self.registry.remove(id);
        debug!(%id, "Event loop terminated");
    }

    /// Performs `actions` in order. Returns `true` once the stream is closed.
    async fn perform<S>(&mut self, stream: &mut S, actions: Vec<Action>) -> bool
    where
        S: AsyncWrite + Unpin,
    {
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Write(bytes) => {
                    if let Err(e) = self.write(stream, &bytes).await {
                        if self.machine.is_closed() {
                            debug!(id = %self.machine.id(), error = %e, "Write failed while closing");
                            continue;
                        }
                        queue = self.machine.fail(e).into();
                    }
                }

                Action::Emit(event) => {
                    self.connection
                        .upgraded
                        .store(self.machine.is_upgraded(), Ordering::Release);

                    if let Some(follow_up) = self.deliver(event) {
                        queue.extend(follow_up);
                    }
                }

                Action::Close => {
                    self.connection.upgraded.store(false, Ordering::Release);
                    if let Err(e) = timeout(self.write_timeout, stream.shutdown()).await {
                        trace!(id = %self.machine.id(), error = %e, "Transport shutdown timed out");
                    }
                    return true;
                }
            }
        }

        false
    }

    /// Hands an event to the application.
    ///
    /// Returns follow-up actions for an HTTP request.
    fn deliver(&mut self, event: ServerEvent) -> Option<Vec<Action>> {
        match event {
            ServerEvent::Http { .. } => {
                let response = (self.handler)(event).unwrap_or_else(HttpResponse::not_found);
                Some(self.machine.respond(response))
            }
            event if event.is_terminal() => {
                // Remove first so no broadcast reaches the id after the
                // terminal event; the handler runs outside the registry lock.
                self.registry.remove(event.id());
                let _ = (self.handler)(event);
                None
            }
            event => {
                let _ = (self.handler)(event);
                None
            }
        }
    }

    async fn write<S>(&self, stream: &mut S, bytes: &[u8]) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };

        match timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => {
                warn!(id = %self.machine.id(), "Write timed out");
                Err(Error::timeout(
                    "write",
                    u64::try_from(self.write_timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex as SyncMutex;
    use tokio::io::duplex;
    use tokio_util::codec::Decoder;

    use crate::protocol::frame::DEFAULT_MAX_FRAME_SIZE;
    use crate::protocol::{Frame, FrameCodec, OpCode};

    const UPGRADE: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn recording_handler() -> (EventHandler, Arc<SyncMutex<Vec<String>>>) {
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |event| {
            let name = match &event {
                ServerEvent::Connected { .. } => "connected".to_owned(),
                ServerEvent::Disconnected { code, .. } => format!("disconnected:{code}"),
                ServerEvent::Text { text, .. } => format!("text:{text}"),
                ServerEvent::Http { request, .. } => format!("http:{}", request.path()),
                ServerEvent::Error { .. } => "error".to_owned(),
                _ => "other".to_owned(),
            };
            sink.lock().push(name);
            None
        });
        (handler, seen)
    }

    async fn read_until(client: &mut tokio::io::DuplexStream, needle: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0_u8; 1024];
        while !out.windows(needle.len()).any(|w| w == needle) {
            let n = client.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_plain_request_gets_404_and_closes() {
        let registry = Arc::new(Registry::new());
        let (handler, seen) = recording_handler();
        let (mut client, server) = duplex(4096);

        let connection = Connection::spawn(
            server,
            None,
            &ServerOptions::default(),
            Arc::clone(&registry),
            handler,
        );
        assert!(registry.get(connection.id()).is_some());

        client
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("\r\n\r\n404 Not Found"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_empty());
        assert_eq!(seen.lock()[0], "http:/nope");
    }

    #[tokio::test]
    async fn test_scripted_request_split_across_reads() {
        let registry = Arc::new(Registry::new());
        let (handler, seen) = recording_handler();
        let stream = tokio_test::io::Builder::new()
            .read(b"GET /a HTTP/1.1\r\n")
            .read(b"Host: x\r\n\r\n")
            .write(&HttpResponse::not_found().to_bytes())
            .build();

        Connection::spawn(
            stream,
            None,
            &ServerOptions::default(),
            Arc::clone(&registry),
            handler,
        );

        for _ in 0..50 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
        assert_eq!(seen.lock()[0], "http:/a");
    }

    #[tokio::test]
    async fn test_upgrade_then_send_and_close() {
        let registry = Arc::new(Registry::new());
        let (handler, seen) = recording_handler();
        let (mut client, server) = duplex(4096);

        let connection = Connection::spawn(
            server,
            None,
            &ServerOptions::default(),
            Arc::clone(&registry),
            handler,
        );

        client.write_all(UPGRADE).await.unwrap();
        let head = read_until(&mut client, b"\r\n\r\n").await;
        assert!(head.starts_with(b"HTTP/1.1 101 Switching Protocols"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(connection.is_upgraded());

        connection.send(Message::from("hello")).unwrap();
        let frame = read_until(&mut client, b"hello").await;
        assert_eq!(frame, Frame::text("hello").to_bytes().to_vec());

        connection.close(close_code::NORMAL, "done");
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest[0], 0x88);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connection.is_upgraded());
        assert!(registry.is_empty());
        assert_eq!(*seen.lock(), vec!["connected", "disconnected:1000"]);
    }

    #[tokio::test]
    async fn test_ping_answered_ahead_of_queued_frames() {
        const QUEUED: usize = 20;

        let registry = Arc::new(Registry::new());
        let (handler, _) = recording_handler();
        // Smaller than one queued frame, so every write waits on the peer.
        let (mut client, server) = duplex(256);

        let connection = Connection::spawn(
            server,
            None,
            &ServerOptions::default(),
            Arc::clone(&registry),
            handler,
        );

        client.write_all(UPGRADE).await.unwrap();
        read_until(&mut client, b"\r\n\r\n").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..QUEUED {
            connection.send(Message::from("x".repeat(1024))).unwrap();
        }
        let ping = Frame::new(OpCode::Ping, Bytes::from_static(b"hi")).masked([1, 2, 3, 4]);
        client.write_all(&ping.to_bytes()).await.unwrap();

        let mut codec = FrameCodec::client(DEFAULT_MAX_FRAME_SIZE);
        let mut wire = BytesMut::new();
        let mut opcodes = Vec::new();
        while opcodes.len() < QUEUED + 1 {
            match codec.decode(&mut wire).unwrap() {
                Some(frame) => opcodes.push(frame.opcode),
                None => assert!(client.read_buf(&mut wire).await.unwrap() > 0),
            }
        }

        let pong = opcodes.iter().position(|op| *op == OpCode::Pong).unwrap();
        assert!(pong <= 1, "pong written after {pong} queued frames");
        assert_eq!(opcodes.iter().filter(|op| **op == OpCode::Text).count(), QUEUED);

        connection.close(close_code::NORMAL, "done");
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_drop_reports_abnormal_close() {
        let registry = Arc::new(Registry::new());
        let (handler, seen) = recording_handler();
        let (mut client, server) = duplex(4096);

        Connection::spawn(
            server,
            None,
            &ServerOptions::default(),
            Arc::clone(&registry),
            handler,
        );

        client.write_all(UPGRADE).await.unwrap();
        read_until(&mut client, b"\r\n\r\n").await;
        drop(client);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
        assert_eq!(*seen.lock(), vec!["connected", "disconnected:1006"]);
    }

    #[tokio::test]
    async fn test_send_to_full_queue_reports_queue_full() {
        let registry = Arc::new(Registry::new());
        let (handler, _seen) = recording_handler();
        // The connection task does not run until the test yields.
        let (_client, server) = duplex(16);
        let options = ServerOptions::default()
            .with_outbound_capacity(2)
            .with_write_timeout(Duration::from_secs(30));

        let connection = Connection::spawn(server, None, &options, registry, handler);

        let results: Vec<_> = (0..16)
            .map(|i| connection.send(Message::from(format!("message {i}"))))
            .collect();
        assert!(results.iter().any(|r| matches!(r, Err(Error::QueueFull { .. }))));
    }

    #[tokio::test]
    async fn test_abort_closes_immediately() {
        let registry = Arc::new(Registry::new());
        let (handler, seen) = recording_handler();
        let (mut client, server) = duplex(4096);

        let connection = Connection::spawn(
            server,
            None,
            &ServerOptions::default(),
            Arc::clone(&registry),
            handler,
        );
        client.write_all(UPGRADE).await.unwrap();
        read_until(&mut client, b"\r\n\r\n").await;

        connection.abort(close_code::POLICY_VIOLATION, "too slow");
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(&rest[2..4], &close_code::POLICY_VIOLATION.to_be_bytes());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().last().map(String::as_str), Some("disconnected:1008"));
    }
}
