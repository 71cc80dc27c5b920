//! Wire protocol framing and encoding/decoding for the canvas server.
//!
//! This crate provides the low-level wire protocol: the closed set of frame
//! kinds exchanged between whiteboard clients and the server, their binary
//! encoding, and an incremental decoder that tolerates arbitrary read
//! boundaries.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 type tag          | FrameType                  |
//! +----------------------+----------------------------+
//! | u32 payload_len      | big-endian, bytes follow   |
//! +----------------------+----------------------------+
//! | payload              | layout depends on the tag  |
//! +----------------------+----------------------------+
//! ```
//!
//! | Frame         | Payload                                   |
//! |---------------|-------------------------------------------|
//! | Nop           | empty                                     |
//! | Version       | u16 major, u16 minor, u16 patch           |
//! | SessionId     | u32 id                                    |
//! | TransferStart | u32 transfer id, u32 total size           |
//! | TransferChunk | u32 transfer id, u32 length, bytes        |
//! | TransferStop  | u32 transfer id                           |
//! | TransferSync  | u32 transfer id (`0xFFFFFFFF` = any)      |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use error::WireError;
pub use frame::{Frame, FrameDecoder, SyncTarget, ANY_TRANSFER, DEFAULT_MAX_FRAME_SIZE};
pub use header::{FrameType, ProtocolVersion, CURRENT_VERSION, FRAME_HEADER_SIZE};
