//! Ordered, non-blocking fan-out of log records.
//!
//! Producers hand records to a [`Broadcaster`], which forwards them over an
//! unbounded channel to a single task. That task serializes each record and
//! queues it on every upgraded connection, one record at a time, so every
//! viewer sees records in submission order. Producers never wait on the
//! network.

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::protocol::Message;
use crate::transport::WebSocketServer;

use super::record::{LogLevel, LogRecord};

// ============================================================================
// BroadcastCommand
// ============================================================================

/// Internal commands for the broadcast task.
#[derive(Debug)]
pub(crate) enum BroadcastCommand {
    /// Fan out one record.
    Record(Box<LogRecord>),
    /// Reply once every earlier record has been fanned out.
    Flush(oneshot::Sender<()>),
    /// Fan out what is queued, then stop.
    Stop,
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Producer handle for the broadcast pipeline.
///
/// Cheap to clone and safe to use from any thread, including code that is
/// not running inside the tokio runtime.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    command_tx: mpsc::UnboundedSender<BroadcastCommand>,
}

impl Broadcaster {
    /// Spawns the broadcast task for `server`.
    ///
    /// The returned handle completes after [`Broadcaster::stop`] once every
    /// record queued before it has been fanned out.
    pub(crate) fn spawn(server: WebSocketServer) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_broadcast_loop(server, command_rx));
        (Self { command_tx }, task)
    }

    /// Queues a record for every connected viewer.
    ///
    /// Returns `false` if the pipeline has stopped and the record was
    /// dropped.
    pub fn broadcast(&self, record: LogRecord) -> bool {
        self.command_tx
            .send(BroadcastCommand::Record(Box::new(record)))
            .is_ok()
    }

    /// Queues a record with only a level and a message.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        self.broadcast(LogRecord::new(level, message))
    }

    /// Waits until every record queued so far has been handed to the
    /// connections' outbound queues.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(BroadcastCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Asks the broadcast task to finish the queued records and exit.
    pub(crate) fn stop(&self) {
        let _ = self.command_tx.send(BroadcastCommand::Stop);
    }

    /// Creates a handle whose commands are collected by the caller instead of
    /// a broadcast task.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<BroadcastCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Self { command_tx }, command_rx)
    }

    /// Returns `true` while the broadcast task accepts records.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }
}

// ============================================================================
// Broadcast Loop
// ============================================================================

async fn run_broadcast_loop(
    server: WebSocketServer,
    mut command_rx: mpsc::UnboundedReceiver<BroadcastCommand>,
) {
    debug!("Broadcast loop started");

    while let Some(command) = command_rx.recv().await {
        match command {
            BroadcastCommand::Record(record) => match record.to_json() {
                Ok(json) => {
                    let delivered = server.broadcast(&Message::Text(json));
                    trace!(delivered, level = %record.level, "Record broadcast");
                }
                Err(e) => {
                    warn!(error = %e, "Dropping log record that failed to serialize");
                }
            },
            BroadcastCommand::Flush(done) => {
                let _ = done.send(());
            }
            BroadcastCommand::Stop => {
                command_rx.close();
            }
        }
    }

    debug!("Broadcast loop terminated");
}

// ============================================================================
// Tests
// ============================================================================
