//! WebSocket frame codec.
//!
//! Implements the RFC 6455 base framing as a `tokio_util` codec. Decoding is
//! resumable: an incomplete frame leaves the buffer untouched and yields
//! `Ok(None)` so bytes can be fed in as the transport delivers them.
//!
//! # Wire Layout
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key (0 or 4 bytes), then payload data ...         |
//! +---------------------------------------------------------------+
//! ```

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default frame payload limit (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Close status codes used by this crate.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code was present in the close frame.
    pub const NO_STATUS: u16 = 1005;
    /// Transport closed without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Payload inconsistent with the message type (bad UTF-8).
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation (consumer too slow).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big to process.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Unexpected server condition.
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Returns `true` if a peer may send `code` in a close frame.
    #[must_use]
    pub const fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

// ============================================================================
// OpCode
// ============================================================================

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl OpCode {
    /// Returns the 4-bit wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Parses a 4-bit wire value. Reserved values yield `None`.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns `true` for close, ping and pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

// ============================================================================
// CloseFrame
// ============================================================================

/// Status code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code.
    pub code: u16,
    /// UTF-8 reason, possibly empty.
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close frame, truncating the reason to fit a control frame.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        let limit = MAX_CONTROL_PAYLOAD - 2;
        if reason.len() > limit {
            let mut end = limit;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    /// Parses a close frame payload.
    ///
    /// An empty payload carries no status and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] for a one-byte payload or a reserved code
    /// - [`Error::InvalidUtf8`] if the reason is not UTF-8
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload {
            [] => Ok(None),
            [_] => Err(Error::protocol("close frame payload of a single byte")),
            [hi, lo, reason @ ..] => {
                let code = u16::from_be_bytes([*hi, *lo]);
                if !close_code::is_sendable(code) {
                    return Err(Error::protocol(format!("invalid close code {code}")));
                }
                let reason = std::str::from_utf8(reason).map_err(|_| Error::InvalidUtf8)?;
                Ok(Some(Self {
                    code,
                    reason: reason.to_owned(),
                }))
            }
        }
    }

    /// Serializes the code and reason into a close payload.
    #[must_use]
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code);
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Masking key, present on client-to-server frames.
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final, unmasked frame.
    #[inline]
    #[must_use]
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a text frame.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    /// Creates a binary frame.
    #[inline]
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    /// Creates a pong frame.
    #[inline]
    #[must_use]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Creates a close frame; `None` sends an empty close payload.
    #[must_use]
    pub fn close(close: Option<&CloseFrame>) -> Self {
        let payload = close.map(CloseFrame::to_payload).unwrap_or_default();
        Self::new(OpCode::Close, payload)
    }

    /// Sets the fin flag.
    #[inline]
    #[must_use]
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets a masking key, as a client would.
    #[inline]
    #[must_use]
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Encodes the frame into a standalone buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.payload.len() + 14);
        write_frame(self, &mut dst);
        dst.freeze()
    }
}

// ============================================================================
// Role
// ============================================================================

/// Which side of the connection the codec decodes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Decodes client frames: they must be masked.
    #[default]
    Server,
    /// Decodes server frames: they must not be masked.
    Client,
}

// ============================================================================
// FrameCodec
// ============================================================================

/// Stateless frame encoder/decoder.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Role::Server, DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Creates a codec for the given role and payload limit.
    #[inline]
    #[must_use]
    pub const fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
        }
    }

    /// Creates a server-side codec with the given payload limit.
    #[inline]
    #[must_use]
    pub const fn server(max_frame_size: usize) -> Self {
        Self::new(Role::Server, max_frame_size)
    }

    /// Creates a client-side codec with the given payload limit.
    #[inline]
    #[must_use]
    pub const fn client(max_frame_size: usize) -> Self {
        Self::new(Role::Client, max_frame_size)
    }

    /// Returns the payload limit.
    #[inline]
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let (b0, b1) = (src[0], src[1]);
        let fin = b0 & 0x80 != 0;

        if b0 & 0x70 != 0 {
            return Err(Error::protocol("reserved bits set without an extension"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F)
            .ok_or_else(|| Error::protocol(format!("reserved opcode {:#x}", b0 & 0x0F)))?;

        let masked = b1 & 0x80 != 0;
        match (self.role, masked) {
            (Role::Server, false) => return Err(Error::protocol("client frame is not masked")),
            (Role::Client, true) => return Err(Error::protocol("server frame is masked")),
            _ => {}
        }

        let (payload_len, mut offset) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(Error::protocol("64-bit payload length has the high bit set"));
                }
                (len, 10)
            }
            len => (u64::from(len), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(Error::protocol("fragmented control frame"));
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(Error::protocol("control frame payload exceeds 125 bytes"));
            }
        }

        if payload_len > self.max_frame_size as u64 {
            return Err(Error::message_too_big(payload_len, self.max_frame_size));
        }

        let mask = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let key = [
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ];
            offset += 4;
            Some(key)
        } else {
            None
        };

        // Bounded by max_frame_size above, so this fits in usize.
        let len = payload_len as usize;
        if src.len() < offset + len {
            src.reserve(offset + len - src.len());
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        write_frame(&frame, dst);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// XORs `buf` with the masking key, by position modulo 4.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    let len = frame.payload.len();
    let mask_bit = if frame.mask.is_some() { 0x80 } else { 0 };

    let fin_bit = if frame.fin { 0x80 } else { 0 };

    dst.reserve(len + 14);
    dst.put_u8(fin_bit | frame.opcode.as_u8());

    if len < 126 {
        dst.put_u8(mask_bit | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(short);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match frame.mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(&frame.payload),
    }
}

// ============================================================================
// Tests
// ============================================================================
