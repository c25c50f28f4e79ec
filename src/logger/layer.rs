//! `tracing` integration.
//!
//! [`BroadcastLayer`] turns `tracing` events into [`LogRecord`]s and hands
//! them to a [`Broadcaster`]:
//!
//! | `tracing` | record |
//! |-----------|--------|
//! | level | `ERROR`→error, `WARN`→warn, `INFO`→info, `DEBUG`→debug, `TRACE`→verbose |
//! | `message` field | message |
//! | `tag` field | tag |
//! | other fields | appended to the message as `name=value` |
//! | file, line | file, line |
//! | module path (or target) | function |
//!
//! Events emitted by this crate are skipped so that logging about a viewer
//! never produces more records for that viewer.
//!
//! # Example
//!
//! ```no_run
//! use tracing_subscriber::prelude::*;
//! use websocket_logger::LogServer;
//!
//! # async fn example() -> websocket_logger::Result<()> {
//! let server = LogServer::builder().start().await?;
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(server.layer())
//!     .init();
//!
//! tracing::info!(tag = "boot", "ready");
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::broadcaster::Broadcaster;
use super::record::{LogLevel, LogRecord};

// ============================================================================
// Constants
// ============================================================================

/// Target prefix of events emitted by this crate.
const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

/// Field carrying the record tag.
const TAG_FIELD: &str = "tag";

// ============================================================================
// BroadcastLayer
// ============================================================================

/// A [`Layer`] that streams events to connected log viewers.
#[derive(Debug, Clone)]
pub struct BroadcastLayer {
    broadcaster: Broadcaster,
}

impl BroadcastLayer {
    /// Creates a layer feeding `broadcaster`.
    #[inline]
    #[must_use]
    pub const fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

impl<S> Layer<S> for BroadcastLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_own_target(metadata.target()) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let function = metadata.module_path().unwrap_or_else(|| metadata.target());
        let mut record = LogRecord::new(LogLevel::from(*metadata.level()), visitor.take_message())
            .with_location(
                metadata.file().unwrap_or_default(),
                function,
                metadata.line().unwrap_or_default(),
            );
        if let Some(tag) = visitor.tag {
            record = record.with_tag(tag);
        }

        let _ = self.broadcaster.broadcast(record);
    }
}

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ============================================================================
// RecordVisitor
// ============================================================================

/// Collects the message, tag and remaining fields of an event.
#[derive(Debug, Default)]
struct RecordVisitor {
    message: String,
    tag: Option<String>,
    fields: String,
}

impl RecordVisitor {
    /// Returns the message followed by the extra fields.
    fn take_message(&mut self) -> String {
        let mut message = std::mem::take(&mut self.message);
        if !self.fields.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&self.fields);
        }
        message
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_owned(),
            TAG_FIELD => self.tag = Some(value.to_owned()),
            name => self.push_field(name, format_args!("{value}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            TAG_FIELD => self.tag = Some(format!("{value:?}")),
            name => self.push_field(name, format_args!("{value:?}")),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tracing_subscriber::layer::SubscriberExt;

    use crate::logger::broadcaster::BroadcastCommand;

    fn collect(rx: &mut UnboundedReceiver<BroadcastCommand>) -> Vec<LogRecord> {
        let mut records = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let BroadcastCommand::Record(record) = command {
                records.push(*record);
            }
        }
        records
    }

    fn capture(emit: impl FnOnce()) -> Vec<LogRecord> {
        let (broadcaster, mut rx) = Broadcaster::detached();
        let subscriber = tracing_subscriber::registry().with(BroadcastLayer::new(broadcaster));
        tracing::subscriber::with_default(subscriber, emit);
        collect(&mut rx)
    }

    #[test]
    fn test_event_becomes_record() {
        let records = capture(|| {
            tracing::warn!(target: "app::net", tag = "net", peer = 7, "connection reset");
        });

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.message, "connection reset peer=7");
        assert_eq!(record.tag.as_deref(), Some("net"));
        assert_eq!(record.display_message(), "[net] connection reset peer=7");
        assert!(record.file.ends_with("layer.rs"));
        assert!(record.line > 0);
    }

    #[test]
    fn test_trace_maps_to_verbose() {
        let records = capture(|| tracing::trace!(target: "app", "fine detail"));
        assert_eq!(records[0].level, LogLevel::Verbose);
    }

    #[test]
    fn test_own_events_are_skipped() {
        let records = capture(|| {
            tracing::info!("from this crate");
            tracing::info!(target: "websocket_logger::transport", "also this crate");
            tracing::info!(target: "websocket_logger_ext", "another crate");
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "another crate");
    }

    #[test]
    fn test_is_own_target() {
        assert!(is_own_target(OWN_TARGET));
        assert!(is_own_target(&format!("{OWN_TARGET}::logger")));
        assert!(!is_own_target("app"));
        assert!(!is_own_target(&format!("{OWN_TARGET}_ext")));
    }

    #[test]
    fn test_fields_without_message() {
        let records = capture(|| tracing::error!(target: "app", code = 3, path = "/tmp"));
        assert_eq!(records[0].message, "code=3 path=/tmp");
    }
}
