//! Frame header, type tags and protocol versioning.
//!
//! Every frame starts with a 5-byte header: a one-byte type tag followed by
//! the big-endian length of the payload that follows.

use std::fmt;

/// Frame header size in bytes (tag + payload length)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Protocol version spoken by this build
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Reserved, carries no payload
    Nop = 0x00,
    /// Client protocol version, first frame of every session
    Version = 0x01,
    /// Server-assigned session identifier
    SessionId = 0x02,
    /// Announces a chunked transfer
    TransferStart = 0x03,
    /// One ordered slice of a transfer payload
    TransferChunk = 0x04,
    /// Announces transfer completion
    TransferStop = 0x05,
    /// Receiver pull request for the next transfer step
    TransferSync = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Nop),
            0x01 => Ok(FrameType::Version),
            0x02 => Ok(FrameType::SessionId),
            0x03 => Ok(FrameType::TransferStart),
            0x04 => Ok(FrameType::TransferChunk),
            0x05 => Ok(FrameType::TransferStop),
            0x06 => Ok(FrameType::TransferSync),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

impl FrameType {
    /// Exact payload length for kinds with a fixed layout
    pub fn fixed_payload_len(self) -> Option<usize> {
        match self {
            FrameType::Nop => Some(0),
            FrameType::Version => Some(6),
            FrameType::SessionId => Some(4),
            FrameType::TransferStart => Some(8),
            FrameType::TransferChunk => None,
            FrameType::TransferStop => Some(4),
            FrameType::TransferSync => Some(4),
        }
    }
}

/// Protocol version triple carried by a `Version` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    /// Major version, must match exactly for a session to be accepted
    pub major: u16,
    /// Minor version (informational)
    pub minor: u16,
    /// Patch version (informational)
    pub patch: u16,
}

impl ProtocolVersion {
    /// Create a version triple
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a peer speaking `other` can talk to us
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
