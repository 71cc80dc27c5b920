//! Per-connection protocol engine for the canvas collaboration server.
//!
//! This crate turns byte streams into authorized sessions: it owns the
//! per-connection frame adapter, the registry that hands out session IDs,
//! the version handshake, and pull-based chunked transfers of large payloads
//! such as encoded images.
//!
//! ## Features
//!
//! - **Frame adapter**: Incremental decoding and queued, batched encoding
//! - **Adapter registry**: One adapter per connection, unique session IDs
//! - **Handshake**: Version negotiation gating all business traffic
//! - **Chunked transfers**: Client-paced streaming in 10 KiB chunks
//! - **Server pipeline**: Accept loop with one task per connection
//!
//! ## Example
//!
//! ```rust,no_run
//! use canvas_session::{
//!     listen_tcp, AdapterRegistry, LoggingDispatcher, Server, ServerConfig, SettingsHandle,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Arc::new(Server::new(
//!     ServerConfig::default(),
//!     Arc::new(AdapterRegistry::new()),
//!     Arc::new(SettingsHandle::default()),
//!     Arc::new(LoggingDispatcher),
//! ));
//!
//! let listener = listen_tcp("0.0.0.0:12345".parse()?).await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod error;
pub mod handshake;
pub mod image;
pub mod registry;
pub mod server;
pub mod settings;
pub mod transfer;
pub mod transport;

// Re-export main types
pub use adapter::FrameAdapter;
pub use error::{SessionError, TransferError};
pub use handshake::{Handshake, HandshakeOutcome, HandshakeState};
pub use image::ImageSender;
pub use registry::{AdapterEvent, AdapterRegistry, ConnectionId};
pub use server::{Dispatcher, LoggingDispatcher, Server, ServerConfig, SessionContext};
pub use settings::{ServerSettings, SettingsHandle};
pub use transfer::{
    Advance, Assembly, ChunkedTransfer, PayloadSource, TransferAssembler, TransferSet,
    TransferState, CHUNK_SIZE,
};
pub use transport::{connect_tcp, listen_tcp};
