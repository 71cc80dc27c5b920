//! Pull-based chunked transfers.
//!
//! A sender never pushes: every `TransferSync` from the receiver advances one
//! transfer by exactly one step (`TransferStart`, one `TransferChunk`, or
//! `TransferStop`). At most one chunk per transfer is in flight, and many
//! transfers interleave on one connection since each only moves when asked.

use crate::adapter::FrameAdapter;
use crate::error::TransferError;
use bytes::{Bytes, BytesMut};
use canvas_wire::{Frame, SyncTarget, ANY_TRANSFER};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Payload bytes per `TransferChunk`
pub const CHUNK_SIZE: usize = 10 * 1024;

/// Something that can produce the bytes of a payload by identifier
pub trait PayloadSource {
    /// Encode the payload `id`, failing with `PayloadUnavailable`
    fn encode(&self, id: u32) -> Result<Bytes, TransferError>;
}

/// Sender-side transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// `TransferStart` not sent yet
    NotStarted,
    /// Start sent, chunks or stop pending
    Sending,
    /// `TransferStop` sent
    Finished,
}

/// Result of one sync-driven step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The sync request addresses another transfer
    NotApplicable,
    /// The next frame of this transfer
    Emitted(Frame),
    /// Transfer already complete, nothing left to send
    Idle,
}

/// One payload moving through the frame channel
#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    id: u32,
    payload: Bytes,
    sent: usize,
    state: TransferState,
}

impl ChunkedTransfer {
    /// Create a transfer of `payload` identified by `id`
    pub fn new(id: u32, payload: Bytes) -> Result<Self, TransferError> {
        if id == ANY_TRANSFER {
            return Err(TransferError::ReservedId(id));
        }
        if u32::try_from(payload.len()).is_err() {
            return Err(TransferError::TooLarge(payload.len()));
        }

        Ok(Self {
            id,
            payload,
            sent: 0,
            state: TransferState::NotStarted,
        })
    }

    /// Create a transfer whose payload comes from `source`
    pub fn from_source<S>(source: &S, id: u32) -> Result<Self, TransferError>
    where
        S: PayloadSource + ?Sized,
    {
        let payload = source.encode(id)?;
        Self::new(id, payload)
    }

    /// Transfer identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Total payload size
    pub fn total_size(&self) -> usize {
        self.payload.len()
    }

    /// Payload bytes already emitted in chunks
    pub fn bytes_sent(&self) -> usize {
        self.sent
    }

    /// True once `TransferStop` has been emitted
    pub fn is_finished(&self) -> bool {
        self.state == TransferState::Finished
    }

    /// Take one step in response to a sync request
    pub fn advance(&mut self, target: SyncTarget) -> Advance {
        if !target.matches(self.id) {
            return Advance::NotApplicable;
        }

        match self.state {
            TransferState::NotStarted => {
                self.state = TransferState::Sending;
                Advance::Emitted(Frame::TransferStart {
                    transfer_id: self.id,
                    // Checked against u32 in `new`
                    total_size: self.payload.len() as u32,
                })
            }
            TransferState::Sending if self.sent < self.payload.len() => {
                let len = CHUNK_SIZE.min(self.payload.len() - self.sent);
                let bytes = self.payload.slice(self.sent..self.sent + len);
                self.sent += len;
                Advance::Emitted(Frame::TransferChunk {
                    transfer_id: self.id,
                    bytes,
                })
            }
            TransferState::Sending => {
                self.state = TransferState::Finished;
                Advance::Emitted(Frame::TransferStop {
                    transfer_id: self.id,
                })
            }
            TransferState::Finished => Advance::Idle,
        }
    }
}

/// Active outgoing transfers of one connection, in creation order
#[derive(Debug, Default)]
pub struct TransferSet {
    transfers: Vec<ChunkedTransfer>,
}

impl TransferSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer; its ID must not be active already
    pub fn add(&mut self, transfer: ChunkedTransfer) -> Result<(), TransferError> {
        if self.transfers.iter().any(|t| t.id() == transfer.id()) {
            return Err(TransferError::DuplicateId(transfer.id()));
        }

        debug!(
            "Registered transfer {} ({} bytes)",
            transfer.id(),
            transfer.total_size()
        );
        self.transfers.push(transfer);
        Ok(())
    }

    /// Serve one sync request, returning the ID of the transfer advanced
    ///
    /// `Any` picks the oldest active transfer. A request naming no active
    /// transfer is ignored. Nothing advances once the adapter is closed.
    pub fn on_sync(&mut self, adapter: &FrameAdapter, target: SyncTarget) -> Option<u32> {
        if adapter.is_closed() {
            debug!("Adapter closed, not advancing {} transfers", self.transfers.len());
            return None;
        }

        let Some(index) = self
            .transfers
            .iter()
            .position(|t| target.matches(t.id()) && !t.is_finished())
        else {
            trace!("Ignoring sync for {:?}: no active transfer", target);
            return None;
        };

        let transfer = &mut self.transfers[index];
        let id = transfer.id();
        if let Advance::Emitted(frame) = transfer.advance(target) {
            adapter.enqueue(frame);
        }

        if transfer.is_finished() {
            debug!("Transfer {} finished", id);
            self.transfers.remove(index);
        }

        Some(id)
    }

    /// IDs of active transfers in creation order
    pub fn ids(&self) -> Vec<u32> {
        self.transfers.iter().map(ChunkedTransfer::id).collect()
    }

    /// Number of active transfers
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfer is active
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Progress reported by [`TransferAssembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// Frame is not part of a transfer
    Ignored,
    /// Transfer still in progress
    Pending {
        /// Transfer identifier
        transfer_id: u32,
    },
    /// Transfer complete
    Complete {
        /// Transfer identifier
        transfer_id: u32,
        /// Reassembled payload
        payload: Bytes,
    },
}

#[derive(Debug)]
struct Inbound {
    total_size: u32,
    data: BytesMut,
}

/// Receiver-side reassembly of chunked transfers
#[derive(Debug, Default)]
pub struct TransferAssembler {
    transfers: HashMap<u32, Inbound>,
}

impl TransferAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received frame
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Assembly, TransferError> {
        match frame {
            Frame::TransferStart {
                transfer_id,
                total_size,
            } => {
                if self.transfers.contains_key(transfer_id) {
                    return Err(TransferError::DuplicateId(*transfer_id));
                }
                self.transfers.insert(
                    *transfer_id,
                    Inbound {
                        total_size: *total_size,
                        // Announced size is untrusted; grow as chunks arrive
                        data: BytesMut::with_capacity(CHUNK_SIZE.min(*total_size as usize)),
                    },
                );
                Ok(Assembly::Pending {
                    transfer_id: *transfer_id,
                })
            }
            Frame::TransferChunk { transfer_id, bytes } => {
                let inbound = self.inbound(*transfer_id, frame)?;
                let received = inbound.data.len() + bytes.len();
                if received > inbound.total_size as usize {
                    let expected = inbound.total_size;
                    self.transfers.remove(transfer_id);
                    return Err(TransferError::SizeMismatch {
                        id: *transfer_id,
                        expected,
                        actual: received,
                    });
                }
                inbound.data.extend_from_slice(bytes);
                Ok(Assembly::Pending {
                    transfer_id: *transfer_id,
                })
            }
            Frame::TransferStop { transfer_id } => {
                let inbound =
                    self.transfers
                        .remove(transfer_id)
                        .ok_or(TransferError::Unexpected {
                            id: *transfer_id,
                            typ: frame.frame_type(),
                        })?;
                if inbound.data.len() != inbound.total_size as usize {
                    return Err(TransferError::SizeMismatch {
                        id: *transfer_id,
                        expected: inbound.total_size,
                        actual: inbound.data.len(),
                    });
                }
                Ok(Assembly::Complete {
                    transfer_id: *transfer_id,
                    payload: inbound.data.freeze(),
                })
            }
            _ => Ok(Assembly::Ignored),
        }
    }

    fn inbound(&mut self, transfer_id: u32, frame: &Frame) -> Result<&mut Inbound, TransferError> {
        self.transfers
            .get_mut(&transfer_id)
            .ok_or(TransferError::Unexpected {
                id: transfer_id,
                typ: frame.frame_type(),
            })
    }

    /// Number of transfers started but not stopped
    pub fn in_progress(&self) -> usize {
        self.transfers.len()
    }
}
