//! Image transfers over the frame channel.
//!
//! An `ImageSender` is a chunked transfer keyed by image ID whose bytes come
//! from an image store. It holds only a weak reference to the connection's
//! adapter and goes quiet once that connection is gone.

use crate::adapter::FrameAdapter;
use crate::error::TransferError;
use crate::transfer::{Advance, ChunkedTransfer, PayloadSource};
use canvas_wire::SyncTarget;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Streams one encoded image to one connection
#[derive(Debug)]
pub struct ImageSender {
    transfer: ChunkedTransfer,
    adapter: Weak<FrameAdapter>,
}

impl ImageSender {
    /// Encode `image_id` from `store` and prepare it for `adapter`
    ///
    /// Fails with `PayloadUnavailable` when the store cannot encode the image;
    /// no frame is ever emitted in that case.
    pub fn new<S>(store: &S, image_id: u32, adapter: &Arc<FrameAdapter>) -> Result<Self, TransferError>
    where
        S: PayloadSource + ?Sized,
    {
        let transfer = ChunkedTransfer::from_source(store, image_id)?;
        debug!(
            "Prepared image {} ({} bytes) for session candidate {}",
            image_id,
            transfer.total_size(),
            adapter.assigned_id()
        );

        Ok(Self {
            transfer,
            adapter: Arc::downgrade(adapter),
        })
    }

    /// Image being sent
    pub fn image_id(&self) -> u32 {
        self.transfer.id()
    }

    /// Serve a sync request; returns whether it addressed this image
    ///
    /// Returns `false` without advancing once the connection is gone.
    pub fn process(&mut self, target: SyncTarget) -> bool {
        let Some(adapter) = self.adapter.upgrade() else {
            return false;
        };
        if adapter.is_closed() {
            return false;
        }

        match self.transfer.advance(target) {
            Advance::NotApplicable => false,
            Advance::Emitted(frame) => {
                adapter.enqueue(frame);
                true
            }
            Advance::Idle => true,
        }
    }

    /// True once the stop frame has been queued
    pub fn is_finished(&self) -> bool {
        self.transfer.is_finished()
    }

    /// Hand the underlying transfer to a [`TransferSet`](crate::TransferSet)
    pub fn into_transfer(self) -> ChunkedTransfer {
        self.transfer
    }
}
