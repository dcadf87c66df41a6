// ============================================
// File: crates/meshrelay-core/src/protocol/frame.rs
// ============================================
//! # Frame Definitions
//!
//! ## Creation Reason
//! Everything exchanged between two agents on a peer link is a frame.
//! This module defines the frame types, flags and the two in-memory
//! representations: the strict [`Frame`] and the forwardable [`RawFrame`].
//!
//! ## Wire Format (Big Endian)
//! ```text
//! ┌──────────┬──────────┬────────────────────┬──────────────────┐
//! │ type (1) │ flags (1)│  stream_id (8)     │ payload_len (4)  │
//! ├──────────┴──────────┴────────────────────┴──────────────────┤
//! │                   payload (payload_len bytes)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Type byte values are frozen; add new types, never renumber
//! - A `RawFrame` keeps the type byte as-is so transit agents can relay
//!   frame types they do not understand
//!
//! ## Last Modified
//! v0.1.0 - Initial frame definitions

use std::fmt;

use bytes::Bytes;

use crate::error::{CoreError, Result};

// ============================================
// Constants
// ============================================

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 14;

/// Default maximum payload: a 16 KiB data chunk plus AEAD overhead and
/// some slack for control payloads.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 + 64;

/// Stream id carried by link-level control frames.
pub const CONTROL_STREAM_ID: u64 = 0;

// ============================================
// FrameType
// ============================================

/// Frame type identifier.
///
/// # Values
/// | Value | Type |
/// |-------|------|
/// | 0x01 | StreamOpen |
/// | 0x02 | StreamOpenAck |
/// | 0x03 | StreamOpenErr |
/// | 0x04 | StreamData |
/// | 0x05 | StreamClose |
/// | 0x06 | StreamReset |
/// | 0x07 | StreamWindow |
/// | 0x10 | RouteAdvertise |
/// | 0x20 | UdpOpen |
/// | 0x21 | UdpOpenAck |
/// | 0x22 | UdpOpenErr |
/// | 0x23 | UdpDatagram |
/// | 0x24 | UdpClose |
/// | 0x30 | Keepalive |
/// | 0x31 | PeerHello |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Open a virtual TCP stream toward a destination.
    StreamOpen = 0x01,
    /// Exit accepted the stream.
    StreamOpenAck = 0x02,
    /// Stream could not be opened.
    StreamOpenErr = 0x03,
    /// Ciphertext for an open stream.
    StreamData = 0x04,
    /// Clean teardown after both halves closed.
    StreamClose = 0x05,
    /// Immediate teardown.
    StreamReset = 0x06,
    /// Grants the other endpoint more `STREAM_DATA` frames.
    StreamWindow = 0x07,
    /// Route flooding.
    RouteAdvertise = 0x10,
    /// Open a UDP association.
    UdpOpen = 0x20,
    /// Exit bound a socket for the association.
    UdpOpenAck = 0x21,
    /// UDP association could not be opened.
    UdpOpenErr = 0x22,
    /// One encrypted datagram.
    UdpDatagram = 0x23,
    /// Association released.
    UdpClose = 0x24,
    /// Link liveness signal.
    Keepalive = 0x30,
    /// First frame on a new link, names the sender.
    PeerHello = 0x31,
}

impl FrameType {
    /// Converts a byte to a `FrameType`.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::StreamOpen),
            0x02 => Some(Self::StreamOpenAck),
            0x03 => Some(Self::StreamOpenErr),
            0x04 => Some(Self::StreamData),
            0x05 => Some(Self::StreamClose),
            0x06 => Some(Self::StreamReset),
            0x07 => Some(Self::StreamWindow),
            0x10 => Some(Self::RouteAdvertise),
            0x20 => Some(Self::UdpOpen),
            0x21 => Some(Self::UdpOpenAck),
            0x22 => Some(Self::UdpOpenErr),
            0x23 => Some(Self::UdpDatagram),
            0x24 => Some(Self::UdpClose),
            0x30 => Some(Self::Keepalive),
            0x31 => Some(Self::PeerHello),
            _ => None,
        }
    }

    /// Returns the wire byte.
    #[must_use]
    pub const fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Frames that belong to a virtual TCP stream.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(
            self,
            Self::StreamOpen
                | Self::StreamOpenAck
                | Self::StreamOpenErr
                | Self::StreamData
                | Self::StreamClose
                | Self::StreamReset
                | Self::StreamWindow
        )
    }

    /// Frames that belong to a UDP association.
    #[must_use]
    pub const fn is_udp(&self) -> bool {
        matches!(
            self,
            Self::UdpOpen | Self::UdpOpenAck | Self::UdpOpenErr | Self::UdpDatagram | Self::UdpClose
        )
    }

    /// Link-level frames that are never relayed.
    #[must_use]
    pub const fn is_link_control(&self) -> bool {
        matches!(self, Self::RouteAdvertise | Self::Keepalive | Self::PeerHello)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self> {
        Self::from_byte(value).ok_or(CoreError::UnknownType(value))
    }
}

impl From<FrameType> for u8 {
    fn from(frame_type: FrameType) -> Self {
        frame_type.as_byte()
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StreamOpen => "STREAM_OPEN",
            Self::StreamOpenAck => "STREAM_OPEN_ACK",
            Self::StreamOpenErr => "STREAM_OPEN_ERR",
            Self::StreamData => "STREAM_DATA",
            Self::StreamClose => "STREAM_CLOSE",
            Self::StreamReset => "STREAM_RESET",
            Self::StreamWindow => "STREAM_WINDOW",
            Self::RouteAdvertise => "ROUTE_ADVERTISE",
            Self::UdpOpen => "UDP_OPEN",
            Self::UdpOpenAck => "UDP_OPEN_ACK",
            Self::UdpOpenErr => "UDP_OPEN_ERR",
            Self::UdpDatagram => "UDP_DATAGRAM",
            Self::UdpClose => "UDP_CLOSE",
            Self::Keepalive => "KEEPALIVE",
            Self::PeerHello => "PEER_HELLO",
        };
        f.write_str(name)
    }
}

// ============================================
// Flags
// ============================================

/// Frame flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Sender has no more data to write.
    pub const FIN_WRITE: Self = Self(0x01);
    /// Sender will not read any more data.
    pub const FIN_READ: Self = Self(0x02);

    /// Wraps a raw byte; unknown bits are preserved for relaying.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw byte.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if no bit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

// ============================================
// FrameHeader
// ============================================

/// Parsed fixed header. The type byte is kept raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw type byte.
    pub type_byte: u8,
    /// Flag bits.
    pub flags: Flags,
    /// Hop-local stream id.
    pub stream_id: u64,
    /// Declared payload length.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Total encoded size of the frame this header describes.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len as usize
    }
}

// ============================================
// Frame
// ============================================

/// A frame whose type is known to this agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Flag bits.
    pub flags: Flags,
    /// Hop-local stream id.
    pub stream_id: u64,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame with no flags.
    #[must_use]
    pub fn new(frame_type: FrameType, stream_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            flags: Flags::NONE,
            stream_id,
            payload: payload.into(),
        }
    }

    /// Creates a payload-less frame.
    #[must_use]
    pub fn empty(frame_type: FrameType, stream_id: u64) -> Self {
        Self::new(frame_type, stream_id, Bytes::new())
    }

    /// Sets flags.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }
}

// ============================================
// RawFrame
// ============================================

/// A structurally valid frame whose type may be unknown.
///
/// This is what travels through the relay path; it only becomes a
/// [`Frame`] when a handler needs to interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Raw type byte.
    pub type_byte: u8,
    /// Flag bits.
    pub flags: Flags,
    /// Hop-local stream id.
    pub stream_id: u64,
    /// Payload bytes.
    pub payload: Bytes,
}

impl RawFrame {
    /// Known frame type, or `UnknownType`.
    ///
    /// # Errors
    /// Returns `CoreError::UnknownType` for unrecognized type bytes.
    pub fn frame_type(&self) -> Result<FrameType> {
        FrameType::try_from(self.type_byte)
    }

    /// Converts into a strict frame.
    ///
    /// # Errors
    /// Returns `CoreError::UnknownType` for unrecognized type bytes.
    pub fn into_frame(self) -> Result<Frame> {
        Ok(Frame {
            frame_type: self.frame_type()?,
            flags: self.flags,
            stream_id: self.stream_id,
            payload: self.payload,
        })
    }

    /// Same frame with a different hop-local stream id.
    #[must_use]
    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = stream_id;
        self
    }
}

impl From<Frame> for RawFrame {
    fn from(frame: Frame) -> Self {
        Self {
            type_byte: frame.frame_type.as_byte(),
            flags: frame.flags,
            stream_id: frame.stream_id,
            payload: frame.payload,
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [FrameType; 15] = [
        FrameType::StreamOpen,
        FrameType::StreamOpenAck,
        FrameType::StreamOpenErr,
        FrameType::StreamData,
        FrameType::StreamClose,
        FrameType::StreamReset,
        FrameType::StreamWindow,
        FrameType::RouteAdvertise,
        FrameType::UdpOpen,
        FrameType::UdpOpenAck,
        FrameType::UdpOpenErr,
        FrameType::UdpDatagram,
        FrameType::UdpClose,
        FrameType::Keepalive,
        FrameType::PeerHello,
    ];

    #[test]
    fn test_frame_type_byte_mapping() {
        for t in ALL_TYPES {
            assert_eq!(FrameType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(FrameType::from_byte(0x00), None);
        assert!(matches!(FrameType::try_from(0x7f), Err(CoreError::UnknownType(0x7f))));
    }

    #[test]
    fn test_frame_type_classes_are_disjoint() {
        for t in ALL_TYPES {
            let classes = [t.is_stream(), t.is_udp(), t.is_link_control()];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{t}");
        }
    }

    #[test]
    fn test_flags() {
        let flags = Flags::FIN_WRITE | Flags::FIN_READ;
        assert!(flags.contains(Flags::FIN_WRITE));
        assert!(flags.contains(Flags::FIN_READ));
        assert!(!Flags::FIN_WRITE.contains(Flags::FIN_READ));
        assert!(Flags::NONE.is_empty());
        assert_eq!(Flags::from_bits(0x83).bits(), 0x83);
    }

    #[test]
    fn test_raw_frame_conversion() {
        let frame = Frame::new(FrameType::StreamData, 42, &b"abc"[..]).with_flags(Flags::FIN_WRITE);
        let raw = RawFrame::from(frame.clone());
        assert_eq!(raw.type_byte, 0x04);
        assert_eq!(raw.clone().into_frame().unwrap(), frame);

        let relabelled = raw.with_stream_id(9);
        assert_eq!(relabelled.stream_id, 9);
    }

    #[test]
    fn test_unknown_raw_frame_is_kept() {
        let raw = RawFrame {
            type_byte: 0xe0,
            flags: Flags::NONE,
            stream_id: 3,
            payload: Bytes::from_static(b"future"),
        };
        assert!(raw.frame_type().is_err());
        assert!(matches!(raw.into_frame(), Err(CoreError::UnknownType(0xe0))));
    }
}
