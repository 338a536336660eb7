//! framecast - point-to-point raw video streaming
//!
//! A sender captures frames, paces them to the target rate and streams them
//! over TCP; a receiver renders them. Both sides negotiate over a small
//! signaling channel and are driven by a session supervisor that owns the
//! connection state machine.

pub mod args;
pub mod capture;
pub mod config;
pub mod frame;
pub mod overlay;
pub mod pipeline;
pub mod render;
pub mod session;
pub mod signaling;
pub mod transport;

// Re-exports
pub use config::Config;
pub use frame::{FrameQueue, PixelFormat, TimeBase, VideoFrame};
pub use session::{ConnectionState, ConnectionStateMachine, SessionReport, SessionSupervisor};
pub use signaling::{SessionDescription, SignalingChannel};
pub use transport::{MediaParams, PeerTransport};
