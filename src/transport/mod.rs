//! Media transport layer
//!
//! Moves frames between peers over a dedicated TCP connection, separate
//! from the signaling channel. The wire format lives in [`wire`]; the
//! connection lifecycle and drive threads live in [`peer`].
//!
//! The transport never talks to the session state machine directly. It
//! reports link changes as [`TransportEvent`] values on a channel and the
//! supervisor translates them into state transitions.

pub mod peer;
pub mod wire;

pub use peer::{MediaParams, PeerTransport};
pub use wire::{FramePacket, MediaDecoder, MediaPacket};

use std::fmt;
use std::net::SocketAddr;

/// Errors from transport setup and handshake operations.
#[derive(Debug)]
pub enum TransportError {
    /// Socket-level failure.
    Io(std::io::Error),
    /// Peer sent parameters or packets the transport cannot accept.
    Protocol(String),
    /// A bounded wait elapsed before the link came up.
    Timeout(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::Protocol(msg) => write!(f, "transport protocol error: {}", msg),
            TransportError::Timeout(msg) => write!(f, "transport timeout: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Link lifecycle notifications from the transport's drive threads.
///
/// At most one terminal event (`LinkFailed` or `LinkClosed`) is emitted
/// per transport; a locally initiated close emits nothing.
#[derive(Debug)]
pub enum TransportEvent {
    /// Media connection is up.
    LinkEstablished { peer: SocketAddr },
    /// Media connection died from an I/O or protocol error.
    LinkFailed { reason: String },
    /// Peer ended the stream cleanly.
    LinkClosed,
}
