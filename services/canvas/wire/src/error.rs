//! Wire protocol error types.

use crate::header::FrameType;
use thiserror::Error;

/// Wire protocol errors
///
/// Any of these is fatal to the connection that produced the bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unknown frame type tag
    #[error("unknown type {0}")]
    Type(u8),

    /// Declared payload length exceeds the decoder limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Payload does not match the layout of its frame type
    #[error("malformed {typ:?} frame: {reason}")]
    Malformed {
        /// Frame type whose payload was rejected
        typ: FrameType,
        /// What was wrong with it
        reason: &'static str,
    },
}
