// ============================================
// File: crates/meshrelay-core/src/protocol/codec.rs
// ============================================
//! # Frame Codec
//!
//! ## Creation Reason
//! Pure, stateless encoding and decoding of frames. No I/O happens here;
//! peer links hand complete frame buffers in and out.
//!
//! ## Main Functionality
//! - `Codec` trait: generic encode/decode interface
//! - `FrameCodec`: header parsing, size limits, raw and strict decoding
//!
//! ## Parsing Strategy
//! 1. Require the full 14-byte header (`ShortHeader`)
//! 2. Bound the declared payload length (`PayloadTooLarge`)
//! 3. Require the full payload (`Truncated`)
//! 4. Only strict decoding resolves the type byte (`UnknownType`)
//!
//! ## ⚠️ Important Note for Next Developer
//! - Encoding must stay byte-for-byte deterministic: golden vectors in
//!   the tests pin the layout
//! - The relay path uses `decode_raw` so unknown frame types can still be
//!   forwarded
//!
//! ## Last Modified
//! v0.1.0 - Initial codec implementation

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};
use crate::protocol::frame::{
    Flags, Frame, FrameHeader, RawFrame, DEFAULT_MAX_PAYLOAD_SIZE, FRAME_HEADER_SIZE,
};

// ============================================
// Codec Trait
// ============================================

/// Trait for encoding and decoding wire messages.
///
/// # Type Parameters
/// * `T` - The message type to encode/decode
pub trait Codec<T> {
    /// Appends the encoded message to `buf`.
    ///
    /// # Errors
    /// Returns an error if the message cannot be represented on the wire.
    fn encode(&self, msg: &T, buf: &mut BytesMut) -> Result<()>;

    /// Decodes one message from the front of `buf`, advancing it.
    ///
    /// # Errors
    /// Returns an error if the bytes do not form a valid message.
    fn decode(&self, buf: &mut Bytes) -> Result<T>;
}

// ============================================
// FrameCodec
// ============================================

/// Frame codec bounded by a maximum payload size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl FrameCodec {
    /// Creates a codec that rejects payloads above `max_payload` bytes.
    #[must_use]
    pub const fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Configured payload limit.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Parses and bounds-checks the fixed header at the front of `buf`.
    ///
    /// # Errors
    /// `ShortHeader` if fewer than 14 bytes are available, or
    /// `PayloadTooLarge` if the declared length exceeds the limit.
    pub fn decode_header(&self, buf: &[u8]) -> Result<FrameHeader> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(CoreError::ShortHeader {
                expected: FRAME_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut cursor = &buf[..FRAME_HEADER_SIZE];
        let type_byte = cursor.get_u8();
        let flags = Flags::from_bits(cursor.get_u8());
        let stream_id = cursor.get_u64();
        let payload_len = cursor.get_u32();

        if payload_len as usize > self.max_payload {
            return Err(CoreError::PayloadTooLarge {
                max: self.max_payload,
                actual: payload_len as usize,
            });
        }

        Ok(FrameHeader {
            type_byte,
            flags,
            stream_id,
            payload_len,
        })
    }

    /// Checks whether `buf` starts with a complete frame.
    ///
    /// # Returns
    /// - `Ok(Some(len))` - a full frame of `len` bytes is buffered
    /// - `Ok(None)` - more bytes are needed
    ///
    /// # Errors
    /// Returns `PayloadTooLarge` as soon as the header is readable.
    pub fn check_complete(&self, buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = self.decode_header(buf)?;
        let total = header.frame_len();
        Ok((buf.len() >= total).then_some(total))
    }

    /// Decodes one frame without interpreting its type byte.
    ///
    /// # Errors
    /// Any framing error except `UnknownType`.
    pub fn decode_raw(&self, buf: &mut Bytes) -> Result<RawFrame> {
        let header = self.decode_header(buf)?;
        let payload_len = header.payload_len as usize;
        let available = buf.len() - FRAME_HEADER_SIZE;
        if available < payload_len {
            return Err(CoreError::Truncated {
                expected: payload_len,
                actual: available,
            });
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len);

        Ok(RawFrame {
            type_byte: header.type_byte,
            flags: header.flags,
            stream_id: header.stream_id,
            payload,
        })
    }

    /// Appends a raw frame to `buf`.
    ///
    /// # Errors
    /// Returns `PayloadTooLarge` if the payload exceeds the limit.
    pub fn encode_raw(&self, frame: &RawFrame, buf: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if len > self.max_payload || u32::try_from(len).is_err() {
            return Err(CoreError::PayloadTooLarge {
                max: self.max_payload,
                actual: len,
            });
        }

        buf.reserve(FRAME_HEADER_SIZE + len);
        buf.put_u8(frame.type_byte);
        buf.put_u8(frame.flags.bits());
        buf.put_u64(frame.stream_id);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(len as u32);
        buf.put_slice(&frame.payload);
        Ok(())
    }

    /// Encodes a raw frame into a standalone buffer.
    ///
    /// # Errors
    /// Returns `PayloadTooLarge` if the payload exceeds the limit.
    pub fn to_bytes(&self, frame: &RawFrame) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
        self.encode_raw(frame, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Codec<Frame> for FrameCodec {
    fn encode(&self, msg: &Frame, buf: &mut BytesMut) -> Result<()> {
        self.encode_raw(&RawFrame::from(msg.clone()), buf)
    }

    fn decode(&self, buf: &mut Bytes) -> Result<Frame> {
        self.decode_raw(buf)?.into_frame()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameType;

    fn encode(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_golden_vector() {
        let frame = Frame::new(FrameType::StreamData, 0x0102_0304_0506_0708, &b"hi"[..])
            .with_flags(Flags::FIN_WRITE);

        let expected: &[u8] = &[
            0x04, 0x01, // type, flags
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // stream_id
            0x00, 0x00, 0x00, 0x02, // payload_len
            b'h', b'i',
        ];
        assert_eq!(&encode(&frame)[..], expected);
        // Deterministic
        assert_eq!(encode(&frame), encode(&frame));
    }

    #[test]
    fn test_roundtrip_all_types() {
        let codec = FrameCodec::default();
        for byte in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x10, 0x20, 0x21, 0x22, 0x23, 0x24, 0x30, 0x31] {
            let frame_type = FrameType::from_byte(byte).unwrap();
            let frame = Frame::new(frame_type, u64::from(byte) << 40, vec![byte; usize::from(byte)])
                .with_flags(Flags::from_bits(byte & 0x03));
            let mut bytes = encode(&frame);
            assert_eq!(codec.decode(&mut bytes).unwrap(), frame);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_short_header() {
        let codec = FrameCodec::default();
        let mut bytes = Bytes::from_static(&[0x04, 0x00, 0x00]);
        assert!(matches!(
            codec.decode_raw(&mut bytes),
            Err(CoreError::ShortHeader { expected: 14, actual: 3 })
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let codec = FrameCodec::new(8);
        let mut header = BytesMut::new();
        header.put_u8(0x04);
        header.put_u8(0);
        header.put_u64(1);
        header.put_u32(9);
        assert!(matches!(
            codec.decode_header(&header),
            Err(CoreError::PayloadTooLarge { max: 8, actual: 9 })
        ));

        let big = RawFrame::from(Frame::new(FrameType::StreamData, 1, vec![0u8; 9]));
        assert!(codec.to_bytes(&big).is_err());
    }

    #[test]
    fn test_unknown_type_raw_vs_strict() {
        let codec = FrameCodec::default();
        let raw = RawFrame {
            type_byte: 0x77,
            flags: Flags::NONE,
            stream_id: 5,
            payload: Bytes::from_static(b"xyz"),
        };
        let bytes = codec.to_bytes(&raw).unwrap();

        let mut relay_view = bytes.clone();
        assert_eq!(codec.decode_raw(&mut relay_view).unwrap(), raw);

        let mut strict_view = bytes;
        assert!(matches!(codec.decode(&mut strict_view), Err(CoreError::UnknownType(0x77))));
    }

    #[test]
    fn test_truncated_payload() {
        let codec = FrameCodec::default();
        let full = encode(&Frame::new(FrameType::StreamData, 1, &b"abcdef"[..]));
        let mut partial = full.slice(..full.len() - 2);
        assert!(matches!(
            codec.decode_raw(&mut partial),
            Err(CoreError::Truncated { expected: 6, actual: 4 })
        ));
    }

    #[test]
    fn test_check_complete() {
        let codec = FrameCodec::default();
        let full = encode(&Frame::new(FrameType::Keepalive, 0, &b"1234"[..]));
        assert_eq!(codec.check_complete(&full[..5]).unwrap(), None);
        assert_eq!(codec.check_complete(&full[..full.len() - 1]).unwrap(), None);
        assert_eq!(codec.check_complete(&full).unwrap(), Some(full.len()));
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let a = Frame::empty(FrameType::StreamClose, 1);
        let b = Frame::new(FrameType::StreamData, 2, &b"x"[..]);
        codec.encode(&a, &mut buf).unwrap();
        codec.encode(&b, &mut buf).unwrap();

        let mut bytes = buf.freeze();
        assert_eq!(codec.decode(&mut bytes).unwrap(), a);
        assert_eq!(codec.decode(&mut bytes).unwrap(), b);
        assert!(bytes.is_empty());
    }
}
