//! Binary frame codec shared by the server and Rust clients.
//!
//! Every transport message carries exactly one frame:
//!
//! ```text
//! offset  size  field
//! 0       1     type
//! 1       2     payload length (u16, little-endian)
//! 3       len   payload
//! ```
//!
//! Decoding is deliberately permissive about the type byte: unknown values
//! decode into [`FrameKind::Unknown`] and the session decides what to do with
//! them, so a newer client talking to an older server gets a readable ERROR
//! frame back instead of a dropped connection.

use thiserror::Error;

/// Frame header size: one type byte plus a little-endian u16 length.
pub const HEADER_LEN: usize = 3;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Terminal bytes, peer -> shell or shell -> peer.
pub const TYPE_DATA: u8 = 0x01;
/// Window size change, peer -> server.
pub const TYPE_RESIZE: u8 = 0x02;
/// Signal delivery request, peer -> server.
pub const TYPE_CONTROL: u8 = 0x03;
/// Human-readable error text, server -> peer.
pub const TYPE_ERROR: u8 = 0x04;
/// In-band keepalive; the server treats it as a no-op.
pub const TYPE_HEARTBEAT: u8 = 0x05;
/// Orderly session termination, peer -> server.
pub const TYPE_CLOSE: u8 = 0x06;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame payload is {0} bytes, the limit is 65535")]
    OversizedFrame(usize),
    #[error("frame is shorter than the 3-byte header")]
    ShortFrame,
    #[error("frame header declares {declared} payload bytes but only {actual} follow")]
    TruncatedPayload { declared: usize, actual: usize },
    #[error("resize payload must be 4 bytes, got {0}")]
    BadResize(usize),
}

/// Frame type, preserving unknown bytes for the dispatcher to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Resize,
    Control,
    Error,
    Heartbeat,
    Close,
    Unknown(u8),
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            TYPE_DATA => FrameKind::Data,
            TYPE_RESIZE => FrameKind::Resize,
            TYPE_CONTROL => FrameKind::Control,
            TYPE_ERROR => FrameKind::Error,
            TYPE_HEARTBEAT => FrameKind::Heartbeat,
            TYPE_CLOSE => FrameKind::Close,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn into_byte(self) -> u8 {
        match self {
            FrameKind::Data => TYPE_DATA,
            FrameKind::Resize => TYPE_RESIZE,
            FrameKind::Control => TYPE_CONTROL,
            FrameKind::Error => TYPE_ERROR,
            FrameKind::Heartbeat => TYPE_HEARTBEAT,
            FrameKind::Close => TYPE_CLOSE,
            FrameKind::Unknown(other) => other,
        }
    }
}

/// A decoded frame. The payload borrows from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: FrameKind,
    pub payload: &'a [u8],
}

/// Encode one frame. Any type byte is accepted; only the payload length is
/// validated.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CodecError::OversizedFrame(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind.into_byte());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the
/// number of bytes consumed (`HEADER_LEN + payload length`); trailing bytes
/// are left for the caller.
pub fn decode(bytes: &[u8]) -> Result<(Frame<'_>, usize), CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::ShortFrame);
    }
    let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    if bytes.len() < HEADER_LEN + len {
        return Err(CodecError::TruncatedPayload {
            declared: len,
            actual: bytes.len() - HEADER_LEN,
        });
    }
    let frame = Frame {
        kind: FrameKind::from_byte(bytes[0]),
        payload: &bytes[HEADER_LEN..HEADER_LEN + len],
    };
    Ok((frame, HEADER_LEN + len))
}

/// Encode a resize payload: cols then rows, each little-endian u16.
pub fn encode_resize(cols: u16, rows: u16) -> [u8; 4] {
    let c = cols.to_le_bytes();
    let r = rows.to_le_bytes();
    [c[0], c[1], r[0], r[1]]
}

/// Decode a resize payload into `(cols, rows)`. Only the length is checked
/// here; zero dimensions are rejected where the resize is applied.
pub fn decode_resize(payload: &[u8]) -> Result<(u16, u16), CodecError> {
    if payload.len() != 4 {
        return Err(CodecError::BadResize(payload.len()));
    }
    let cols = u16::from_le_bytes([payload[0], payload[1]]);
    let rows = u16::from_le_bytes([payload[2], payload[3]]);
    Ok((cols, rows))
}
