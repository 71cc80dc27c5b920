//! Message framing for the wire protocol.
//!
//! This module provides the closed set of frame kinds, their encoding, and an
//! incremental decoder that survives partial reads.

use crate::header::{FrameType, ProtocolVersion, FRAME_HEADER_SIZE};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum payload size accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Transfer ID sentinel meaning "any ready transfer" in a sync request
pub const ANY_TRANSFER: u32 = 0xFFFF_FFFF;

/// Target of a `TransferSync` pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    /// Advance this transfer
    Transfer(u32),
    /// Advance whichever transfer is ready
    Any,
}

impl SyncTarget {
    /// Map a wire value to a target
    pub fn from_wire(value: u32) -> Self {
        if value == ANY_TRANSFER {
            SyncTarget::Any
        } else {
            SyncTarget::Transfer(value)
        }
    }

    /// Wire value of this target
    pub fn to_wire(self) -> u32 {
        match self {
            SyncTarget::Transfer(id) => id,
            SyncTarget::Any => ANY_TRANSFER,
        }
    }

    /// Whether a transfer with `transfer_id` is addressed by this target
    pub fn matches(self, transfer_id: u32) -> bool {
        match self {
            SyncTarget::Transfer(id) => id == transfer_id,
            SyncTarget::Any => true,
        }
    }
}

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reserved, no payload
    Nop,
    /// Client protocol version
    Version(ProtocolVersion),
    /// Server-assigned session identifier
    SessionId(u32),
    /// Announces a new chunked transfer
    TransferStart {
        /// Transfer identifier
        transfer_id: u32,
        /// Total payload size in bytes
        total_size: u32,
    },
    /// One ordered slice of a transfer payload
    TransferChunk {
        /// Transfer identifier
        transfer_id: u32,
        /// Slice contents
        bytes: Bytes,
    },
    /// Announces transfer completion
    TransferStop {
        /// Transfer identifier
        transfer_id: u32,
    },
    /// Pull request for the next step of a transfer
    TransferSync(SyncTarget),
}

impl Frame {
    /// Type tag of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Nop => FrameType::Nop,
            Frame::Version(_) => FrameType::Version,
            Frame::SessionId(_) => FrameType::SessionId,
            Frame::TransferStart { .. } => FrameType::TransferStart,
            Frame::TransferChunk { .. } => FrameType::TransferChunk,
            Frame::TransferStop { .. } => FrameType::TransferStop,
            Frame::TransferSync(_) => FrameType::TransferSync,
        }
    }

    /// Transfer this frame belongs to, if any
    pub fn transfer_id(&self) -> Option<u32> {
        match self {
            Frame::TransferStart { transfer_id, .. }
            | Frame::TransferChunk { transfer_id, .. }
            | Frame::TransferStop { transfer_id } => Some(*transfer_id),
            Frame::TransferSync(SyncTarget::Transfer(id)) => Some(*id),
            _ => None,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::TransferChunk { bytes, .. } => 8 + bytes.len(),
            other => other.frame_type().fixed_payload_len().unwrap_or(0),
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len()
    }

    /// Append the encoding of this frame to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.frame_type() as u8);
        buf.put_u32(self.payload_len() as u32);

        match self {
            Frame::Nop => {}
            Frame::Version(version) => {
                buf.put_u16(version.major);
                buf.put_u16(version.minor);
                buf.put_u16(version.patch);
            }
            Frame::SessionId(id) => buf.put_u32(*id),
            Frame::TransferStart {
                transfer_id,
                total_size,
            } => {
                buf.put_u32(*transfer_id);
                buf.put_u32(*total_size);
            }
            Frame::TransferChunk { transfer_id, bytes } => {
                buf.put_u32(*transfer_id);
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            Frame::TransferStop { transfer_id } => buf.put_u32(*transfer_id),
            Frame::TransferSync(target) => buf.put_u32(target.to_wire()),
        }
    }

    /// Encode frame to a contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom payload size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from a buffer
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame at the
    /// front of the buffer is still incomplete.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Reject unknown tags without waiting for the rest of the header
        let typ = FrameType::try_from(buf[0])?;

        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        if payload_len > self.max_frame_size {
            return Err(WireError::Size(payload_len));
        }

        match typ.fixed_payload_len() {
            Some(expected) if payload_len != expected => {
                return Err(WireError::Malformed {
                    typ,
                    reason: "unexpected payload length",
                });
            }
            None if payload_len < 8 => {
                return Err(WireError::Malformed {
                    typ,
                    reason: "payload shorter than chunk header",
                });
            }
            _ => {}
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            buf.reserve(FRAME_HEADER_SIZE + payload_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        parse_payload(typ, payload).map(Some)
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Result<Vec<Frame>, WireError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_payload(typ: FrameType, mut payload: Bytes) -> Result<Frame, WireError> {
    let frame = match typ {
        FrameType::Nop => Frame::Nop,
        FrameType::Version => Frame::Version(ProtocolVersion::new(
            payload.get_u16(),
            payload.get_u16(),
            payload.get_u16(),
        )),
        FrameType::SessionId => Frame::SessionId(payload.get_u32()),
        FrameType::TransferStart => Frame::TransferStart {
            transfer_id: payload.get_u32(),
            total_size: payload.get_u32(),
        },
        FrameType::TransferChunk => {
            let transfer_id = payload.get_u32();
            let chunk_len = payload.get_u32() as usize;
            if chunk_len != payload.len() {
                return Err(WireError::Malformed {
                    typ,
                    reason: "chunk length disagrees with payload length",
                });
            }
            Frame::TransferChunk {
                transfer_id,
                bytes: payload,
            }
        }
        FrameType::TransferStop => Frame::TransferStop {
            transfer_id: payload.get_u32(),
        },
        FrameType::TransferSync => Frame::TransferSync(SyncTarget::from_wire(payload.get_u32())),
    };

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CURRENT_VERSION;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Nop,
            Frame::Version(CURRENT_VERSION),
            Frame::SessionId(42),
            Frame::TransferStart {
                transfer_id: 7,
                total_size: 25_000,
            },
            Frame::TransferChunk {
                transfer_id: 7,
                bytes: Bytes::from_static(b"hello whiteboard"),
            },
            Frame::TransferChunk {
                transfer_id: 7,
                bytes: Bytes::new(),
            },
            Frame::TransferStop { transfer_id: 7 },
            Frame::TransferSync(SyncTarget::Transfer(7)),
            Frame::TransferSync(SyncTarget::Any),
            // The sentinel only means "any" inside a sync
            Frame::TransferStart {
                transfer_id: ANY_TRANSFER,
                total_size: 3,
            },
            Frame::TransferChunk {
                transfer_id: ANY_TRANSFER,
                bytes: Bytes::from_static(b"abc"),
            },
            Frame::TransferStop {
                transfer_id: ANY_TRANSFER,
            },
        ]
    }

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf);
        }
        buf
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut decoder = FrameDecoder::new();
        for frame in sample_frames() {
            let mut buf = BytesMut::from(frame.to_bytes().as_ref());
            assert_eq!(buf.len(), frame.encoded_len());

            let decoded = decoder.decode_all(&mut buf).unwrap();
            assert_eq!(decoded, vec![frame]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_known_encoding() {
        let bytes = Frame::Version(ProtocolVersion::new(1, 2, 3)).to_bytes();
        assert_eq!(
            bytes.as_ref(),
            &[0x01, 0, 0, 0, 6, 0, 1, 0, 2, 0, 3][..]
        );

        let bytes = Frame::TransferSync(SyncTarget::Any).to_bytes();
        assert_eq!(bytes.as_ref(), &[0x06, 0, 0, 0, 4, 0xFF, 0xFF, 0xFF, 0xFF][..]);
    }

    #[test]
    fn test_split_boundaries_yield_same_frames() {
        let frames = sample_frames();
        let stream = encode_all(&frames).freeze();

        // All at once
        let mut decoder = FrameDecoder::new();
        let mut whole = BytesMut::from(stream.as_ref());
        assert_eq!(decoder.decode_all(&mut whole).unwrap(), frames);

        // One byte at a time
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            decoded.extend(decoder.decode_all(&mut buf).unwrap());
        }
        assert_eq!(decoded, frames);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let bytes = Frame::TransferStart {
            transfer_id: 1,
            total_size: 10,
        }
        .to_bytes();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&bytes[..7]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(&bytes[7..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0x7Fu8][..]);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::Type(0x7F)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_size(1024);
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::TransferChunk as u8);
        buf.put_u32(4096);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::Size(4096)));
    }

    #[test]
    fn test_wrong_fixed_length_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::SessionId as u8);
        buf.put_u32(2);
        buf.put_u16(1);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::Malformed {
                typ: FrameType::SessionId,
                ..
            })
        ));
    }

    #[test]
    fn test_chunk_length_mismatch_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::TransferChunk as u8);
        buf.put_u32(8 + 3);
        buf.put_u32(1);
        buf.put_u32(5);
        buf.put_slice(b"abc");
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::Malformed {
                typ: FrameType::TransferChunk,
                ..
            })
        ));
    }

    #[test]
    fn test_sentinel_id_outside_sync_is_plain_id() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::TransferStop as u8);
        buf.put_u32(4);
        buf.put_u32(ANY_TRANSFER);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::TransferStop {
                transfer_id: ANY_TRANSFER
            })
        );
    }

    #[test]
    fn test_sync_target_matching() {
        assert!(SyncTarget::Any.matches(3));
        assert!(SyncTarget::Transfer(3).matches(3));
        assert!(!SyncTarget::Transfer(4).matches(3));
        assert_eq!(SyncTarget::from_wire(ANY_TRANSFER), SyncTarget::Any);
        assert_eq!(Frame::TransferSync(SyncTarget::Any).transfer_id(), None);
    }
}
