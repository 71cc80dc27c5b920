//! Session and transfer error types.

use canvas_wire::{FrameType, ProtocolVersion, WireError};
use thiserror::Error;

/// Errors that end a connection
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer sent bytes that do not decode into frames
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    /// Peer speaks an incompatible protocol version
    #[error("incompatible protocol version {client} (server speaks {server})")]
    VersionIncompatible {
        /// Version announced by the client
        client: ProtocolVersion,
        /// Version spoken by this server
        server: ProtocolVersion,
    },

    /// Peer sent something other than `Version` before the handshake
    #[error("unexpected {0:?} frame before version handshake")]
    UnexpectedFrame(FrameType),

    /// Registry cannot hand out another session identifier
    #[error("session identifiers exhausted")]
    SessionIdExhausted,

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors local to one transfer; they never tear down the connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Payload source could not produce the bytes
    #[error("payload {id} unavailable: {reason}")]
    PayloadUnavailable {
        /// Identifier asked of the source
        id: u32,
        /// Why the source failed
        reason: String,
    },

    /// The identifier collides with the sync "any" sentinel
    #[error("transfer id {0:#x} is reserved")]
    ReservedId(u32),

    /// A transfer with this identifier is already active
    #[error("transfer {0} already active")]
    DuplicateId(u32),

    /// Payload cannot be described by a 32-bit size
    #[error("payload of {0} bytes exceeds the transfer size limit")]
    TooLarge(usize),

    /// Frame does not belong to any transfer in progress
    #[error("unexpected {typ:?} frame for transfer {id}")]
    Unexpected {
        /// Transfer the frame named
        id: u32,
        /// Kind of the offending frame
        typ: FrameType,
    },

    /// Received bytes disagree with the announced size
    #[error("transfer {id} size mismatch: announced {expected} bytes, received {actual}")]
    SizeMismatch {
        /// Transfer identifier
        id: u32,
        /// Size from `TransferStart`
        expected: u32,
        /// Bytes actually received
        actual: usize,
    },
}
