//! Registry of live connections and their frame adapters.
//!
//! Exactly one adapter exists per live connection. The registry hands out
//! session identifiers and publishes lifecycle events to subscribers; the
//! events carry weak references only, so observers never extend an
//! adapter's lifetime.

use crate::adapter::FrameAdapter;
use crate::error::SessionError;
use canvas_wire::DEFAULT_MAX_FRAME_SIZE;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identity of one accepted socket
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle events published by the registry
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// An adapter was created for a new connection
    Created {
        /// Connection the adapter serves
        connection: ConnectionId,
        /// Session identifier assigned to it
        session_id: u32,
        /// Back-reference to the adapter
        adapter: Weak<FrameAdapter>,
    },
    /// An adapter was removed and disconnected
    Destroyed {
        /// Connection the adapter served
        connection: ConnectionId,
        /// Session identifier it held
        session_id: u32,
    },
}

/// Maps each live connection to its adapter
#[derive(Debug)]
pub struct AdapterRegistry {
    adapters: DashMap<ConnectionId, Arc<FrameAdapter>>,
    next_session_id: AtomicU32,
    max_frame_size: usize,
    listeners: Mutex<Vec<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl AdapterRegistry {
    /// Create an empty registry; session identifiers start at 1
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a registry whose adapters use a custom payload limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            adapters: DashMap::new(),
            next_session_id: AtomicU32::new(1),
            max_frame_size,
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    fn starting_at(first_session_id: u32) -> Self {
        let registry = Self::new();
        registry
            .next_session_id
            .store(first_session_id, Ordering::SeqCst);
        registry
    }

    /// Subscribe to adapter lifecycle events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AdapterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn publish(&self, event: AdapterEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop subscribers whose receiver is gone
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn allocate_session_id(&self) -> Result<u32, SessionError> {
        self.next_session_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map_err(|_| SessionError::SessionIdExhausted)
    }

    /// Return the adapter for `connection`, creating it on first use
    pub fn get_or_create(&self, connection: ConnectionId) -> Result<Arc<FrameAdapter>, SessionError> {
        match self.adapters.entry(connection) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let session_id = self.allocate_session_id()?;
                let adapter = Arc::new(FrameAdapter::with_max_frame_size(
                    session_id,
                    self.max_frame_size,
                ));
                entry.insert(adapter.clone());

                debug!("Created adapter for {} (session candidate {})", connection, session_id);
                self.publish(AdapterEvent::Created {
                    connection,
                    session_id,
                    adapter: Arc::downgrade(&adapter),
                });

                Ok(adapter)
            }
        }
    }

    /// Look up the adapter for `connection`
    pub fn get(&self, connection: ConnectionId) -> Option<Arc<FrameAdapter>> {
        self.adapters.get(&connection).map(|entry| entry.clone())
    }

    /// Remove and disconnect the adapter for `connection`
    pub fn destroy(&self, connection: ConnectionId) -> Option<Arc<FrameAdapter>> {
        let (_, adapter) = self.adapters.remove(&connection)?;
        adapter.disconnect();

        info!("Destroyed adapter for {} (session {})", connection, adapter.assigned_id());
        self.publish(AdapterEvent::Destroyed {
            connection,
            session_id: adapter.assigned_id(),
        });

        Some(adapter)
    }

    /// Session IDs of all live connections that completed the handshake
    pub fn sessions(&self) -> Vec<u32> {
        let mut sessions: Vec<u32> = self
            .adapters
            .iter()
            .filter_map(|entry| entry.value().session_id())
            .collect();
        sessions.sort_unstable();
        sessions
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no connection is live
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
