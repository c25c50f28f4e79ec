//! Log records and their wire format.
//!
//! A [`LogRecord`] is serialized to a single JSON object per text frame:
//!
//! ```json
//! {
//!   "level": 4,
//!   "levelName": "info",
//!   "message": "[net] connected",
//!   "timestamp": 1700000000.123,
//!   "timeString": "14:13:20.123",
//!   "file": "client.rs",
//!   "function": "client::connect",
//!   "line": 42
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, TimeDelta};
use serde::Serialize;

use crate::error::{Error, Result};

// ============================================================================
// LogLevel
// ============================================================================

/// Severity of a log record.
///
/// The numeric value is a bit flag: error `1`, warn `2`, info `4`,
/// debug `8`, verbose `16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Errors.
    Error,
    /// Warnings.
    Warn,
    /// Informational messages.
    Info,
    /// Debug output.
    Debug,
    /// Verbose tracing output.
    Verbose,
    /// Any other flag value.
    Unknown(u32),
}

impl LogLevel {
    /// Returns the numeric flag.
    #[inline]
    #[must_use]
    pub const fn flag(self) -> u32 {
        match self {
            Self::Error => 1,
            Self::Warn => 2,
            Self::Info => 4,
            Self::Debug => 8,
            Self::Verbose => 16,
            Self::Unknown(flag) => flag,
        }
    }

    /// Returns the level name sent as `levelName`.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "verbose",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Maps a numeric flag back to a level.
    #[must_use]
    pub const fn from_flag(flag: u32) -> Self {
        match flag {
            1 => Self::Error,
            2 => Self::Warn,
            4 => Self::Info,
            8 => Self::Debug,
            16 => Self::Verbose,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => Self::Error,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::INFO => Self::Info,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::TRACE => Self::Verbose,
        }
    }
}

// ============================================================================
// LogRecord
// ============================================================================

/// One log event as produced by the application.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Optional tag, shown as a `[tag]` prefix.
    pub tag: Option<String>,
    /// Source file path.
    pub file: String,
    /// Function or module the record came from.
    pub function: String,
    /// Source line.
    pub line: u32,
    /// When the record was produced.
    pub timestamp: SystemTime,
}

impl LogRecord {
    /// Creates a record stamped with the current time and no location.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            tag: None,
            file: String::new(),
            function: String::new(),
            line: 0,
            timestamp: SystemTime::now(),
        }
    }

    /// Sets the tag.
    #[inline]
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the source location.
    #[inline]
    #[must_use]
    pub fn with_location(
        mut self,
        file: impl Into<String>,
        function: impl Into<String>,
        line: u32,
    ) -> Self {
        self.file = file.into();
        self.function = function.into();
        self.line = line;
        self
    }

    /// Sets the timestamp.
    #[inline]
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the message with its tag prefix.
    ///
    /// Tags already wrapped in `[...]` or `【...】` are used as they are;
    /// others are wrapped in square brackets.
    #[must_use]
    pub fn display_message(&self) -> String {
        match self.tag.as_deref().filter(|t| !t.is_empty()) {
            Some(tag) => format!("{} {}", wrap_tag(tag), self.message),
            None => self.message.clone(),
        }
    }

    /// Serializes the record to its JSON wire form.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRecord`] if the timestamp has no calendar representation
    /// - [`Error::Json`] if serialization fails
    pub fn to_json(&self) -> Result<String> {
        let time = local_time(self.timestamp)
            .ok_or_else(|| Error::invalid_record("timestamp out of range"))?;
        let wire = WireRecord {
            level: self.level.flag(),
            level_name: self.level.name(),
            message: self.display_message(),
            timestamp: epoch_seconds(self.timestamp),
            time_string: time.format("%H:%M:%S%.3f").to_string(),
            file: basename(&self.file),
            function: &self.function,
            line: self.line,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

// ============================================================================
// Wire Format
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord<'a> {
    level: u32,
    level_name: &'static str,
    message: String,
    timestamp: f64,
    time_string: String,
    file: &'a str,
    function: &'a str,
    line: u32,
}

// ============================================================================
// Helpers
// ============================================================================

fn wrap_tag(tag: &str) -> Cow<'_, str> {
    let wrapped = (tag.starts_with('[') && tag.ends_with(']'))
        || (tag.starts_with('【') && tag.ends_with('】'));
    if wrapped {
        Cow::Borrowed(tag)
    } else {
        Cow::Owned(format!("[{tag}]"))
    }
}

/// Last path component, for `/` and `\` separators.
fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Local wall-clock time of `time`, or `None` outside the calendar range.
fn local_time(time: SystemTime) -> Option<DateTime<Local>> {
    let (secs, nanos) = match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (i64::try_from(elapsed.as_secs()).ok()?, elapsed.subsec_nanos()),
        Err(e) => {
            let before = e.duration();
            let secs = i64::try_from(before.as_secs()).ok()?;
            match before.subsec_nanos() {
                0 => (-secs, 0),
                nanos => (-secs - 1, 1_000_000_000 - nanos),
            }
        }
    };

    let utc = DateTime::from_timestamp(secs, nanos)?;
    // A day of headroom on both sides keeps any UTC offset in range.
    utc.checked_add_signed(TimeDelta::days(1))?;
    utc.checked_sub_signed(TimeDelta::days(1))?;
    Some(utc.with_timezone(&Local))
}

fn epoch_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

// ============================================================================
// Tests
// ============================================================================
