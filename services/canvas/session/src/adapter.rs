//! Per-connection frame adapter.
//!
//! A `FrameAdapter` owns the protocol state of one connection: the decode
//! buffer, the queue of decoded frames waiting for dispatch and the queue of
//! frames waiting to be written. Socket I/O happens elsewhere; the connection
//! loop feeds received bytes into [`FrameAdapter::decode`] and writes whatever
//! [`FrameAdapter::flush`] returns.

use bytes::{Bytes, BytesMut};
use canvas_wire::{Frame, FrameDecoder, WireError, DEFAULT_MAX_FRAME_SIZE};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug)]
struct Queues {
    incoming: VecDeque<Frame>,
    outgoing: VecDeque<Frame>,
    decode_buffer: BytesMut,
    decoder: FrameDecoder,
}

impl Queues {
    fn new(max_frame_size: usize) -> Self {
        Self {
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            decode_buffer: BytesMut::new(),
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }
}

/// Protocol state of one connection
#[derive(Debug)]
pub struct FrameAdapter {
    /// Identifier handed out by the registry, becomes the session ID
    assigned_id: u32,
    /// Set once the handshake succeeds
    session_id: OnceLock<u32>,
    closed: AtomicBool,
    queues: Mutex<Queues>,
    /// Wakes the connection writer on enqueue and on disconnect
    wake: Notify,
}

impl FrameAdapter {
    /// Create an adapter holding `assigned_id` as its session candidate
    pub fn new(assigned_id: u32) -> Self {
        Self::with_max_frame_size(assigned_id, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create an adapter with a custom decoder payload limit
    pub fn with_max_frame_size(assigned_id: u32, max_frame_size: usize) -> Self {
        Self {
            assigned_id,
            session_id: OnceLock::new(),
            closed: AtomicBool::new(false),
            queues: Mutex::new(Queues::new(max_frame_size)),
            wake: Notify::new(),
        }
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session candidate assigned by the registry
    pub fn assigned_id(&self) -> u32 {
        self.assigned_id
    }

    /// Negotiated session ID, `None` until the handshake succeeds
    pub fn session_id(&self) -> Option<u32> {
        self.session_id.get().copied()
    }

    /// Promote the assigned candidate to the session ID
    pub(crate) fn establish_session(&self) -> u32 {
        *self.session_id.get_or_init(|| self.assigned_id)
    }

    /// Whether `disconnect` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Feed received bytes, returning how many frames were completed
    ///
    /// Completed frames are appended to the incoming queue in arrival order;
    /// a trailing partial frame stays buffered for the next call. An error is
    /// fatal and the caller must disconnect the adapter.
    pub fn decode(&self, bytes: &[u8]) -> Result<usize, WireError> {
        if self.is_closed() {
            trace!("Dropping {} bytes for closed adapter {}", bytes.len(), self.assigned_id);
            return Ok(0);
        }

        let mut queues = self.queues();
        // `disconnect` may have run while we waited for the lock
        if self.is_closed() {
            return Ok(0);
        }
        let Queues {
            incoming,
            decode_buffer,
            decoder,
            ..
        } = &mut *queues;

        decode_buffer.extend_from_slice(bytes);

        let mut completed = 0;
        while let Some(frame) = decoder.decode(decode_buffer)? {
            trace!("Adapter {} decoded {:?}", self.assigned_id, frame.frame_type());
            incoming.push_back(frame);
            completed += 1;
        }

        Ok(completed)
    }

    /// Drain decoded frames in arrival order
    pub fn take_incoming(&self) -> Vec<Frame> {
        let mut queues = self.queues();
        if self.is_closed() {
            return Vec::new();
        }
        queues.incoming.drain(..).collect()
    }

    /// Number of decoded frames waiting for dispatch
    pub fn pending_incoming(&self) -> usize {
        self.queues().incoming.len()
    }

    /// Queue a frame for sending; ignored once disconnected
    pub fn enqueue(&self, frame: Frame) {
        if self.is_closed() {
            trace!("Dropping {:?} for closed adapter {}", frame.frame_type(), self.assigned_id);
            return;
        }

        {
            let mut queues = self.queues();
            if self.is_closed() {
                return;
            }
            queues.outgoing.push_back(frame);
        }
        self.wake.notify_one();
    }

    /// Number of frames waiting to be flushed
    pub fn pending_outgoing(&self) -> usize {
        self.queues().outgoing.len()
    }

    /// Serialize every queued frame in FIFO order and clear the queue
    pub fn flush(&self) -> Bytes {
        if self.is_closed() {
            return Bytes::new();
        }

        let mut queues = self.queues();
        let size: usize = queues.outgoing.iter().map(Frame::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(size);
        for frame in queues.outgoing.drain(..) {
            frame.encode(&mut buf);
        }

        buf.freeze()
    }

    /// Close the adapter; queues become permanently inert
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut queues = self.queues();
            queues.incoming = VecDeque::new();
            queues.outgoing = VecDeque::new();
            queues.decode_buffer = BytesMut::new();
        }

        debug!("Adapter {} disconnected", self.assigned_id);
        self.wake.notify_one();
    }

    /// Resolves when frames were enqueued or the adapter was closed
    pub async fn flushed(&self) {
        self.wake.notified().await
    }
}
