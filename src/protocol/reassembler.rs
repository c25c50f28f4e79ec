//! Fragment reassembly and control-frame classification.
//!
//! Data messages may be split across a text/binary frame with `fin = 0`
//! followed by continuation frames. Control frames may interleave with such a
//! sequence and are surfaced immediately.

// ============================================================================
// Imports
// ============================================================================

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

use super::frame::{CloseFrame, DEFAULT_MAX_FRAME_SIZE, Frame, OpCode};

// ============================================================================
// Message
// ============================================================================

/// A complete logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Ping with its application data.
    Ping(Bytes),
    /// Pong with its application data.
    Pong(Bytes),
    /// Close, with optional status and reason.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Converts the message into a single unmasked frame.
    #[must_use]
    pub fn into_frame(self) -> Frame {
        match self {
            Self::Text(text) => Frame::text(text),
            Self::Binary(data) => Frame::binary(data),
            Self::Ping(data) => Frame::new(OpCode::Ping, data),
            Self::Pong(data) => Frame::pong(data),
            Self::Close(close) => Frame::close(close.as_ref()),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

// ============================================================================
// Reassembler
// ============================================================================

/// In-progress fragmented message.
#[derive(Debug)]
struct Partial {
    opcode: OpCode,
    buffer: BytesMut,
}

/// Per-connection fragmentation state.
#[derive(Debug)]
pub struct Reassembler {
    max_message_size: usize,
    partial: Option<Partial>,
    closed: bool,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Reassembler {
    /// Creates a reassembler that rejects messages above `max_message_size`.
    #[must_use]
    pub const fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
            closed: false,
        }
    }

    /// Returns `true` while a fragmented message is being collected.
    #[inline]
    #[must_use]
    pub const fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Returns `true` once a close frame has been seen.
    #[inline]
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feeds one decoded frame.
    ///
    /// Returns `Ok(Some(message))` when a message completes, `Ok(None)` while
    /// a fragmented message is still open.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] on out-of-sequence continuation or data frames,
    ///   or any frame after close
    /// - [`Error::MessageTooBig`] when the accumulated payload exceeds the limit
    /// - [`Error::InvalidUtf8`] when a completed text message is not UTF-8
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.closed {
            return Err(Error::protocol("frame received after close"));
        }

        match frame.opcode {
            OpCode::Close => {
                self.closed = true;
                self.partial = None;
                Ok(Some(Message::Close(CloseFrame::parse(&frame.payload)?)))
            }
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(Error::protocol(
                        "new data frame while a fragmented message is in progress",
                    ));
                }
                self.check_size(frame.payload.len())?;

                if frame.fin {
                    return complete(frame.opcode, frame.payload).map(Some);
                }

                self.partial = Some(Partial {
                    opcode: frame.opcode,
                    buffer: BytesMut::from(&frame.payload[..]),
                });
                Ok(None)
            }
            OpCode::Continuation => {
                let max = self.max_message_size;
                let Some(partial) = self.partial.as_mut() else {
                    return Err(Error::protocol(
                        "continuation frame without a fragmented message",
                    ));
                };
                check_size(partial.buffer.len() + frame.payload.len(), max)?;
                partial.buffer.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                let opcode = partial.opcode;
                let buffer = std::mem::take(&mut partial.buffer);
                self.partial = None;
                complete(opcode, buffer.freeze()).map(Some)
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        check_size(size, self.max_message_size)
    }
}

fn check_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(Error::message_too_big(size as u64, max));
    }
    Ok(())
}

fn complete(opcode: OpCode, payload: Bytes) -> Result<Message> {
    match opcode {
        OpCode::Text => {
            let text = std::str::from_utf8(&payload).map_err(|_| Error::InvalidUtf8)?;
            Ok(Message::Text(text.to_owned()))
        }
        _ => Ok(Message::Binary(payload)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::protocol::close_code;

    fn fragment(opcode: OpCode, payload: &[u8], fin: bool) -> Frame {
        Frame::new(opcode, Bytes::copy_from_slice(payload)).with_fin(fin)
    }

    #[test]
    fn test_single_frame_text() {
        let mut r = Reassembler::default();
        let msg = r.push(fragment(OpCode::Text, b"hi", true)).unwrap();
        assert_eq!(msg, Some(Message::Text("hi".into())));
        assert!(!r.in_progress());
    }

    #[test]
    fn test_fragmented_binary() {
        let mut r = Reassembler::default();
        assert_eq!(r.push(fragment(OpCode::Binary, b"ab", false)).unwrap(), None);
        assert!(r.in_progress());
        assert_eq!(r.push(fragment(OpCode::Continuation, b"cd", false)).unwrap(), None);
        let msg = r.push(fragment(OpCode::Continuation, b"ef", true)).unwrap();
        assert_eq!(msg, Some(Message::Binary(Bytes::from_static(b"abcdef"))));
    }

    #[test]
    fn test_ping_interleaved_with_fragments() {
        let mut r = Reassembler::default();
        r.push(fragment(OpCode::Text, b"Hel", false)).unwrap();
        let ping = r.push(fragment(OpCode::Ping, b"p", true)).unwrap();
        assert_eq!(ping, Some(Message::Ping(Bytes::from_static(b"p"))));
        let msg = r.push(fragment(OpCode::Continuation, b"lo", true)).unwrap();
        assert_eq!(msg, Some(Message::Text("Hello".into())));
    }

    #[test]
    fn test_continuation_without_start_is_error() {
        let mut r = Reassembler::default();
        let err = r.push(fragment(OpCode::Continuation, b"x", true)).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_new_data_frame_during_sequence_is_error() {
        let mut r = Reassembler::default();
        r.push(fragment(OpCode::Text, b"a", false)).unwrap();
        assert!(r.push(fragment(OpCode::Binary, b"b", true)).is_err());
    }

    #[test]
    fn test_close_with_code_and_reason() {
        let mut r = Reassembler::default();
        let close = CloseFrame::new(close_code::GOING_AWAY, "tab closed");
        let msg = r.push(Frame::close(Some(&close))).unwrap();
        assert_eq!(msg, Some(Message::Close(Some(close))));
        assert!(r.is_closed());
        assert!(r.push(fragment(OpCode::Text, b"late", true)).is_err());
    }

    #[test]
    fn test_empty_close() {
        let mut r = Reassembler::default();
        assert_eq!(r.push(Frame::close(None)).unwrap(), Some(Message::Close(None)));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let mut r = Reassembler::default();
        let err = r.push(fragment(OpCode::Text, &[0xC3], true)).unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8));
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let mut r = Reassembler::default();
        let bytes = "é".as_bytes();
        r.push(fragment(OpCode::Text, &bytes[..1], false)).unwrap();
        let msg = r.push(fragment(OpCode::Continuation, &bytes[1..], true)).unwrap();
        assert_eq!(msg, Some(Message::Text("é".into())));
    }

    #[test]
    fn test_accumulated_size_limit() {
        let mut r = Reassembler::new(4);
        r.push(fragment(OpCode::Binary, b"abc", false)).unwrap();
        let err = r.push(fragment(OpCode::Continuation, b"de", true)).unwrap_err();
        assert!(matches!(err, Error::MessageTooBig { size: 5, max: 4 }));
    }

    proptest! {
        #[test]
        fn prop_fragments_concatenate(chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..16)) {
            let mut r = Reassembler::default();
            let last = chunks.len() - 1;
            let mut emitted = Vec::new();

            for (i, chunk) in chunks.iter().enumerate() {
                let opcode = if i == 0 { OpCode::Binary } else { OpCode::Continuation };
                if let Some(msg) = r.push(fragment(opcode, chunk, i == last)).unwrap() {
                    prop_assert_eq!(i, last);
                    emitted.push(msg);
                }
            }

            let expected: Vec<u8> = chunks.concat();
            prop_assert_eq!(emitted, vec![Message::Binary(Bytes::from(expected))]);
        }
    }
}
