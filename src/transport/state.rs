//! Per-connection state machine.
//!
//! [`ConnectionMachine`] performs no I/O. It consumes inbound bytes and
//! lifecycle signals and returns the [`Action`]s the event loop must carry
//! out, in order. Once closed it returns no further actions, so at most one
//! terminal event is ever produced.
//!
//! # States
//!
//! ```text
//!              upgrade request
//! Connecting ─────────────────────► Upgraded ──┐
//!     │                                        │ close frame, protocol error,
//!     │ plain request                          │ transport failure, local close
//!     ▼                                        ▼
//! HttpHandled ─── response written ───────► Closed
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::error::Error;
use crate::identifiers::ConnectionId;
use crate::protocol::handshake::{self, RequestKind};
use crate::protocol::{
    CloseFrame, Frame, FrameCodec, HttpRequest, HttpResponse, Message, Reassembler, close_code,
};

use super::event::ServerEvent;
use super::options::ServerOptions;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a complete HTTP request.
    Connecting,
    /// Plain HTTP request handed to the application, awaiting its response.
    HttpHandled,
    /// WebSocket handshake completed.
    Upgraded,
    /// Terminal.
    Closed,
}

// ============================================================================
// Action
// ============================================================================

/// Work the event loop must perform.
#[derive(Debug)]
pub enum Action {
    /// Write bytes to the transport.
    Write(Bytes),
    /// Deliver an event to the application.
    Emit(ServerEvent),
    /// Shut the transport down and stop.
    Close,
}

// ============================================================================
// ConnectionMachine
// ============================================================================

/// Sans-I/O connection state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    id: ConnectionId,
    state: ConnectionState,
    buffer: BytesMut,
    codec: FrameCodec,
    reassembler: Reassembler,
    max_request_size: usize,
}

impl ConnectionMachine {
    /// Creates a machine in the `Connecting` state.
    #[must_use]
    pub fn new(id: ConnectionId, options: &ServerOptions) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            buffer: BytesMut::new(),
            codec: FrameCodec::server(options.max_frame_size),
            reassembler: Reassembler::new(options.max_message_size),
            max_request_size: options.max_request_size,
        }
    }

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns `true` once the WebSocket handshake has completed and the
    /// connection is still open.
    #[inline]
    #[must_use]
    pub fn is_upgraded(&self) -> bool {
        self.state == ConnectionState::Upgraded
    }

    /// Returns `true` once terminal.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Feeds bytes read from the transport.
    pub fn receive(&mut self, data: &[u8]) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Closed => return actions,
            // Nothing more is read from a connection answered over HTTP.
            ConnectionState::HttpHandled => return actions,
            _ => {}
        }

        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ConnectionState::Connecting => {
                    match HttpRequest::parse(&mut self.buffer, self.max_request_size) {
                        Ok(Some(request)) => self.handle_request(request, &mut actions),
                        Ok(None) => break,
                        Err(e) => {
                            self.reject(e, &mut actions);
                            break;
                        }
                    }
                }
                ConnectionState::Upgraded => match self.codec.decode(&mut self.buffer) {
                    Ok(Some(frame)) => self.handle_frame(frame, &mut actions),
                    Ok(None) => break,
                    Err(e) => {
                        self.fail_protocol(e, &mut actions);
                        break;
                    }
                },
                ConnectionState::HttpHandled | ConnectionState::Closed => break,
            }
        }

        actions
    }

    /// Writes the application's response to a plain HTTP request and closes.
    pub fn respond(&mut self, response: HttpResponse) -> Vec<Action> {
        if self.state != ConnectionState::HttpHandled {
            debug!(id = %self.id, state = ?self.state, "Ignoring HTTP response outside request handling");
            return Vec::new();
        }

        let status = response.status;
        self.state = ConnectionState::Closed;
        vec![
            Action::Write(response.to_bytes()),
            Action::Emit(ServerEvent::Disconnected {
                id: self.id,
                reason: format!("HTTP request answered with {status}"),
                code: close_code::NORMAL,
            }),
            Action::Close,
        ]
    }

    /// Queues an already encoded outbound frame.
    ///
    /// Frames are only written once upgraded; otherwise they are dropped.
    pub fn send(&mut self, frame: Bytes) -> Vec<Action> {
        if !self.is_upgraded() {
            trace!(id = %self.id, state = ?self.state, "Dropping outbound frame before upgrade");
            return Vec::new();
        }
        vec![Action::Write(frame)]
    }

    /// Closes the connection from the local side.
    pub fn close(&mut self, code: u16, reason: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Closed => return actions,
            ConnectionState::Upgraded => {
                let close = CloseFrame::new(code, reason);
                actions.push(Action::Write(Frame::close(Some(&close)).to_bytes()));
            }
            ConnectionState::Connecting | ConnectionState::HttpHandled => {}
        }

        self.state = ConnectionState::Closed;
        actions.push(Action::Emit(ServerEvent::Disconnected {
            id: self.id,
            reason: reason.to_owned(),
            code,
        }));
        actions.push(Action::Close);
        actions
    }

    /// Reports that the peer closed the transport.
    pub fn peer_closed(&mut self) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        self.state = ConnectionState::Closed;
        vec![
            Action::Emit(ServerEvent::Disconnected {
                id: self.id,
                reason: "Connection closed by peer".to_owned(),
                code: close_code::ABNORMAL,
            }),
            Action::Close,
        ]
    }

    /// Reports a transport failure.
    pub fn fail(&mut self, error: Error) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        self.state = ConnectionState::Closed;
        vec![
            Action::Emit(ServerEvent::Error { id: self.id, error }),
            Action::Close,
        ]
    }
}

// ============================================================================
// ConnectionMachine - Inbound Handling
// ============================================================================

impl ConnectionMachine {
    fn handle_request(&mut self, request: HttpRequest, actions: &mut Vec<Action>) {
        match handshake::classify(&request) {
            Ok(RequestKind::Upgrade(upgrade)) => {
                let response = handshake::upgrade_response(&upgrade, SystemTime::now());
                actions.push(Action::Write(response.to_bytes()));
                self.state = ConnectionState::Upgraded;
                debug!(id = %self.id, path = %request.target, "WebSocket upgrade completed");
                actions.push(Action::Emit(ServerEvent::Connected {
                    id: self.id,
                    headers: request.headers,
                }));
            }
            Ok(RequestKind::Plain) => {
                self.state = ConnectionState::HttpHandled;
                actions.push(Action::Emit(ServerEvent::Http {
                    id: self.id,
                    request,
                }));
            }
            Err(e) => self.reject(e, actions),
        }
    }

    fn handle_frame(&mut self, frame: Frame, actions: &mut Vec<Action>) {
        let message = match self.reassembler.push(frame) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => return self.fail_protocol(e, actions),
        };

        let id = self.id;
        match message {
            Message::Text(text) => actions.push(Action::Emit(ServerEvent::Text { id, text })),
            Message::Binary(data) => actions.push(Action::Emit(ServerEvent::Binary { id, data })),
            Message::Ping(data) => {
                actions.push(Action::Write(Frame::pong(data.clone()).to_bytes()));
                actions.push(Action::Emit(ServerEvent::Ping { id, data }));
            }
            Message::Pong(data) => actions.push(Action::Emit(ServerEvent::Pong { id, data })),
            Message::Close(close) => {
                actions.push(Action::Write(Frame::close(close.as_ref()).to_bytes()));
                let (code, reason) = close.map_or((close_code::NO_STATUS, String::new()), |c| {
                    (c.code, c.reason)
                });
                self.state = ConnectionState::Closed;
                actions.push(Action::Emit(ServerEvent::Disconnected { id, reason, code }));
                actions.push(Action::Close);
            }
        }
    }

    /// Rejects an unusable HTTP request with `400 Bad Request`.
    fn reject(&mut self, error: Error, actions: &mut Vec<Action>) {
        debug!(id = %self.id, error = %error, "Rejecting HTTP request");
        actions.push(Action::Write(HttpResponse::bad_request().to_bytes()));
        self.state = ConnectionState::Closed;
        actions.push(Action::Emit(ServerEvent::Error { id: self.id, error }));
        actions.push(Action::Close);
    }

    /// Ends an upgraded connection with a close frame for `error`.
    fn fail_protocol(&mut self, error: Error, actions: &mut Vec<Action>) {
        debug!(id = %self.id, error = %error, "WebSocket protocol error");
        let close = CloseFrame::new(error.close_code(), error.to_string());
        actions.push(Action::Write(Frame::close(Some(&close)).to_bytes()));
        self.state = ConnectionState::Closed;
        actions.push(Action::Emit(ServerEvent::Error { id: self.id, error }));
        actions.push(Action::Close);
    }
}

// ============================================================================
// Tests
// ============================================================================
