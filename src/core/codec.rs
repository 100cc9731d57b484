//! Transport framing for streaming connections.
//!
//! ```text
//! [Opcode(1)] [Length(4, BE)] [Payload(N)]
//! ```
//!
//! Binary frames carry exactly one encoded [`Packet`](super::packet::Packet).
//! A close frame ends the connection; text frames exist so a peer can be
//! rejected for speaking the wrong dialect.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, Error, Result};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 5;

/// Default cap on a single frame payload (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            _ => None,
        }
    }
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn binary(payload: Bytes) -> Self {
        Self {
            opcode: Opcode::Binary,
            payload,
        }
    }

    pub fn text(text: &str) -> Self {
        Self {
            opcode: Opcode::Text,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    pub fn close() -> Self {
        Self {
            opcode: Opcode::Close,
            payload: Bytes::new(),
        }
    }
}

/// Length-prefixed frame codec for use with `tokio_util::codec::Framed`.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let opcode = Opcode::from_byte(src[0]).ok_or(CodecError::UnknownOpcode(src[0]))?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        // Reject before buffering anything for an oversized claim
        if len > self.max_frame_size {
            return Err(CodecError::OversizedFrame(len).into());
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { opcode, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if len > self.max_frame_size {
            return Err(CodecError::OversizedFrame(len).into());
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.opcode as u8);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::binary(Bytes::from_static(b"hello")), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(7);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::text("a"), &mut buf).unwrap();
        codec.encode(Frame::close(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opcode, Opcode::Text);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Frame::close());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_claim_is_rejected() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u8(Opcode::Binary as u8);
        buf.put_u32(17);

        match codec.decode(&mut buf) {
            Err(Error::Codec(CodecError::OversizedFrame(17))) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x7u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Codec(CodecError::UnknownOpcode(0x7)))
        ));
    }
}
