//! Registry of live connections.
//!
//! The registry is the single source of truth for which connections are
//! reachable. Membership changes take the write lock; broadcast fan-out
//! takes the read lock, so a connection is either fully in or fully out of
//! any given broadcast.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Registry                  │
//! │  ┌─────────────────────────────────┐    │
//! │  │ ConnectionId → Connection       │    │
//! │  │ ConnectionId → Connection       │    │
//! │  │ ConnectionId → Connection       │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//!             ▲ insert / remove   │ broadcast
//!             │                   ▼
//!      connection tasks     outbound queues
//! ```
//!
//! The registry also tracks the connection tasks themselves, so shutdown can
//! wait for every task to finish writing, including tasks whose entry is
//! already gone.

// ============================================================================
// Imports
// ============================================================================

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::identifiers::ConnectionId;
use crate::protocol::{Message, close_code};

use super::connection::Connection;

// ============================================================================
// Constants
// ============================================================================

/// Close reason sent to a consumer whose outbound queue overflowed.
const SLOW_CONSUMER_REASON: &str = "Consumer too slow";

// ============================================================================
// Registry
// ============================================================================

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<FxHashMap<ConnectionId, Connection>>,
    tasks: TaskTracker,
}

// ============================================================================
// Registry - Membership
// ============================================================================

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. An existing entry with the same id is replaced.
    pub fn insert(&self, connection: Connection) {
        let id = connection.id();
        let previous = self.connections.write().insert(id, connection);
        if previous.is_some() {
            warn!(%id, "Replaced connection with duplicate id");
        }
    }

    /// Removes a connection, returning it if it was present.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.write().remove(&id);
        if removed.is_some() {
            trace!(%id, "Connection removed from registry");
        }
        removed
    }

    /// Returns a handle to a connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.read().get(&id).cloned()
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns `true` if no connection is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Returns the ids of all registered connections.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().copied().collect()
    }

    /// Returns handles to every registered connection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().values().cloned().collect()
    }

    /// Removes and returns every connection.
    pub fn drain(&self) -> Vec<Connection> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }

    /// Tracker of the connection tasks.
    #[inline]
    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }
}

// ============================================================================
// Registry - Broadcast
// ============================================================================

impl Registry {
    /// Queues `message` on every upgraded connection.
    ///
    /// The message is encoded once. A connection whose queue is full is
    /// closed with a policy violation; it never delays the others.
    ///
    /// Returns the number of connections the message was queued on.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.broadcast_frame(&message.clone().into_frame().to_bytes())
    }

    /// Queues an already encoded frame on every upgraded connection.
    pub fn broadcast_frame(&self, frame: &Bytes) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();

        {
            let connections = self.connections.read();
            for connection in connections.values().filter(|c| c.is_upgraded()) {
                match connection.send_frame(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(Error::QueueFull { .. }) => slow.push(connection.clone()),
                    Err(e) => trace!(id = %connection.id(), error = %e, "Skipping closed connection"),
                }
            }
        }

        for connection in slow {
            warn!(id = %connection.id(), "Outbound queue full, closing slow consumer");
            connection.abort(close_code::POLICY_VIOLATION, SLOW_CONSUMER_REASON);
        }

        if delivered > 0 {
            debug!(delivered, bytes = frame.len(), "Broadcast queued");
        }
        delivered
    }
}

// ============================================================================
// Tests
// ============================================================================
