//! Binary frame codec
//!
//! Wire layout, all big-endian:
//!
//! ```text
//! ┌────────────┬──────────────┬─────────────────────┐
//! │ type (u16) │ length (u16) │ payload (length B)  │
//! └────────────┴──────────────┴─────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 4;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Payload type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    /// Raw s16le PCM chunk
    Pcm = 0x0000,
    /// One Opus packet
    Opus = 0x0001,
}

impl FrameType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(FrameType::Pcm),
            0x0001 => Ok(FrameType::Opus),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown frame type 0x{:04x}",
                other
            ))),
        }
    }
}

/// A typed, length-prefixed payload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, rejecting payloads the length field cannot carry
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { frame_type, payload })
    }

    pub fn pcm(payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        Self::new(FrameType::Pcm, payload)
    }

    pub fn opus(payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        Self::new(FrameType::Opus, payload)
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Header plus payload size
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize header and payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16(self.frame_type.as_u16());
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }

    /// Decode the frame at the start of `buf`. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = Self::decode_prefix(buf)?;
        Ok(frame)
    }

    /// Decode one frame from the front of `buf`, advancing it only on success
    pub fn decode_from(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let (frame_type, len) = Self::peek_header(buf)?;
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len);
        Ok(Self { frame_type, payload })
    }

    /// Decode and report how many bytes the frame occupied
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let (frame_type, len) = Self::peek_header(buf)?;
        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + len]);
        Ok((Self { frame_type, payload }, HEADER_LEN + len))
    }

    fn peek_header(buf: &[u8]) -> Result<(FrameType, usize), ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::MalformedFrame(format!(
                "need {} header bytes, have {}",
                HEADER_LEN,
                buf.len()
            )));
        }

        let mut header = &buf[..HEADER_LEN];
        let frame_type = FrameType::try_from(header.get_u16())?;
        let len = header.get_u16() as usize;

        let available = buf.len() - HEADER_LEN;
        if len > available {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared payload of {} bytes, only {} available",
                len, available
            )));
        }

        Ok((frame_type, len))
    }
}
