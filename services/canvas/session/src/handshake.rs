//! Version handshake for canvas sessions.
//!
//! The first frame a client sends must be `Version`. A compatible version
//! turns the adapter's candidate identifier into the session ID and answers
//! with a `SessionId` frame; anything else closes the connection silently.

use crate::adapter::FrameAdapter;
use crate::error::SessionError;
use canvas_wire::{Frame, ProtocolVersion, CURRENT_VERSION};
use tracing::{debug, info, warn};

/// Handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the client's `Version` frame
    AwaitingVersion,
    /// Session established, traffic flows to the dispatcher
    Authorized,
    /// Terminal
    Disconnected,
}

/// What the caller should do with a frame after the handshake saw it
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Handshake completed with this session ID
    Authorized(u32),
    /// Authorized traffic for the dispatcher
    Forward(Frame),
    /// Handshake failed and the adapter was disconnected
    Rejected(SessionError),
    /// Connection already closed, frame dropped
    Closed,
}

/// Version negotiation state machine for one connection
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    server_version: ProtocolVersion,
}

impl Handshake {
    /// Handshake against the version of this build
    pub fn new() -> Self {
        Self::with_version(CURRENT_VERSION)
    }

    /// Handshake against a specific server version
    pub fn with_version(server_version: ProtocolVersion) -> Self {
        Self {
            state: HandshakeState::AwaitingVersion,
            server_version,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the session has been established
    pub fn is_authorized(&self) -> bool {
        self.state == HandshakeState::Authorized
    }

    /// Feed one incoming frame through the state machine
    pub fn on_frame(&mut self, adapter: &FrameAdapter, frame: Frame) -> HandshakeOutcome {
        if adapter.is_closed() {
            self.state = HandshakeState::Disconnected;
        }

        match self.state {
            HandshakeState::Authorized => HandshakeOutcome::Forward(frame),
            HandshakeState::Disconnected => {
                debug!("Dropping {:?} on closed handshake", frame.frame_type());
                HandshakeOutcome::Closed
            }
            HandshakeState::AwaitingVersion => match frame {
                Frame::Version(client) if self.server_version.is_compatible(&client) => {
                    let session_id = adapter.establish_session();
                    adapter.enqueue(Frame::SessionId(session_id));
                    self.state = HandshakeState::Authorized;

                    info!("Version {} accepted, assigned session {}", client, session_id);
                    HandshakeOutcome::Authorized(session_id)
                }
                Frame::Version(client) => {
                    warn!(
                        "Version {} incompatible with {}; disconnecting",
                        client, self.server_version
                    );
                    self.reject(
                        adapter,
                        SessionError::VersionIncompatible {
                            client,
                            server: self.server_version,
                        },
                    )
                }
                other => {
                    warn!("Received {:?} before version handshake; disconnecting", other.frame_type());
                    self.reject(adapter, SessionError::UnexpectedFrame(other.frame_type()))
                }
            },
        }
    }

    fn reject(&mut self, adapter: &FrameAdapter, error: SessionError) -> HandshakeOutcome {
        self.state = HandshakeState::Disconnected;
        adapter.disconnect();
        HandshakeOutcome::Rejected(error)
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}
