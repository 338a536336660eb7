//! Session layer
//!
//! The connection state machine plus the supervisor that drives one
//! session through handshake, streaming and teardown.

pub mod state;
pub mod supervisor;

pub use state::{ConnectionState, ConnectionStateMachine, StateError, StateObserver};
pub use supervisor::{
    SessionError, SessionErrorKind, SessionOutcome, SessionReport, SessionStage,
    SessionSupervisor,
};
