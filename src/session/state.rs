//! Peer-connection lifecycle tracking
//!
//! A validated transition table owns the session's `ConnectionState`.
//! Every other component reads the state or requests a transition
//! through the single entry point; nothing mutates it directly.

use log::{info, warn};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Peer-connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session created, awaiting offer/answer
    New,
    /// Handshake in progress
    Connecting,
    /// Connected and streaming
    Connected,
    /// Disconnected (can reconnect)
    Disconnected,
    /// Failed (cannot recover)
    Failed,
    /// Closed (intentionally terminated)
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine errors
#[derive(Debug, PartialEq, Eq)]
pub enum StateError {
    /// Requested transition is not in the table; state is unchanged
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::InvalidTransition { from, to } => {
                write!(f, "invalid connection state transition: {} -> {}", from, to)
            }
        }
    }
}

impl Error for StateError {}

/// Synchronous "entered state" notification.
///
/// Observers run inside the transition entry point, in registration
/// order, before the transition call returns. They must be quick (set a
/// flag, post a message) and must not re-enter the machine.
pub trait StateObserver: Send + Sync {
    fn on_transition(&self, from: ConnectionState, to: ConnectionState);
}

impl<F> StateObserver for F
where
    F: Fn(ConnectionState, ConnectionState) + Send + Sync,
{
    fn on_transition(&self, from: ConnectionState, to: ConnectionState) {
        self(from, to)
    }
}

/// Legal transitions. `Closed` is reachable from anywhere (local
/// shutdown); everything else follows the handshake/stream lifecycle.
fn transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (New, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed)
            | (Connected, Disconnected)
            | (Connected, Failed)
            | (Disconnected, Connected)
            | (_, Closed)
    )
}

struct Inner {
    state: ConnectionState,
    observers: Vec<Box<dyn StateObserver>>,
}

/// Monitor for the session's connection state.
pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
    mirror: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (mirror, _) = watch::channel(ConnectionState::New);
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::New,
                observers: Vec::new(),
            }),
            mirror,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Register an observer. Registration order is notification order;
    /// pipeline stop gates register first so entering `Failed`/`Closed`
    /// halts frame processing before anyone else hears about it.
    pub fn observe(&self, observer: Box<dyn StateObserver>) {
        self.inner.lock().observers.push(observer);
    }

    /// Async mirror of the state for `select!`-style waiting.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.mirror.subscribe()
    }

    /// Request a transition. Invalid requests leave the state untouched
    /// and are logged. Returns the previous state on success.
    /// `Closed -> Closed` is an idempotent no-op (repeat shutdown).
    pub fn request_transition(&self, to: ConnectionState) -> Result<ConnectionState, StateError> {
        let mut inner = self.inner.lock();
        let from = inner.state;

        if from == ConnectionState::Closed && to == ConnectionState::Closed {
            return Ok(from);
        }
        if !transition_allowed(from, to) {
            drop(inner);
            warn!("rejected connection state transition: {} -> {}", from, to);
            return Err(StateError::InvalidTransition { from, to });
        }

        inner.state = to;
        info!("connection state: {} -> {}", from, to);
        self.mirror.send_replace(to);
        for observer in &inner.observers {
            observer.on_transition(from, to);
        }
        Ok(from)
    }

    /// Wait until the state reaches `Connected`, bounded by `timeout`.
    pub async fn wait_for_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.mirror.subscribe();
        let connected = match tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        {
            Ok(Ok(_)) => true,
            _ => false,
        };
        connected
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn starts_in_new() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(machine.current(), ConnectionState::New);
    }

    #[test]
    fn full_lifecycle_is_legal() {
        use ConnectionState::*;
        let machine = ConnectionStateMachine::new();
        for to in [Connecting, Connected, Disconnected, Connected, Failed, Closed] {
            assert!(machine.request_transition(to).is_ok(), "transition to {:?}", to);
        }
        assert_eq!(machine.current(), Closed);
    }

    #[test]
    fn invalid_transitions_leave_state_unchanged() {
        use ConnectionState::*;
        let machine = ConnectionStateMachine::new();
        for to in [Connected, Disconnected, Failed] {
            let err = machine.request_transition(to).unwrap_err();
            assert_eq!(err, StateError::InvalidTransition { from: New, to });
            assert_eq!(machine.current(), New);
        }

        machine.request_transition(Connecting).unwrap();
        machine.request_transition(Connected).unwrap();
        assert!(machine.request_transition(Connecting).is_err());
        assert!(machine.request_transition(New).is_err());
        assert_eq!(machine.current(), Connected);
    }

    #[test]
    fn closed_is_reachable_from_everywhere() {
        use ConnectionState::*;
        let reach = |path: &[ConnectionState]| {
            let machine = ConnectionStateMachine::new();
            for &to in path {
                machine.request_transition(to).unwrap();
            }
            machine
        };
        for path in [
            &[][..],
            &[Connecting][..],
            &[Connecting, Connected][..],
            &[Connecting, Connected, Disconnected][..],
            &[Connecting, Failed][..],
        ] {
            let machine = reach(path);
            assert!(machine.request_transition(Closed).is_ok());
            assert_eq!(machine.current(), Closed);
        }
    }

    #[test]
    fn repeated_close_is_a_quiet_noop() {
        let machine = ConnectionStateMachine::new();
        let notified = Arc::new(AtomicBool::new(false));
        let flag = notified.clone();
        machine.request_transition(ConnectionState::Closed).unwrap();
        machine.observe(Box::new(move |_, _| flag.store(true, Ordering::SeqCst)));
        assert!(machine.request_transition(ConnectionState::Closed).is_ok());
        assert!(!notified.load(Ordering::SeqCst), "no-op close must not notify");
    }

    #[test]
    fn observers_see_transitions_in_order() {
        use ConnectionState::*;
        let machine = ConnectionStateMachine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        machine.observe(Box::new(move |from: ConnectionState, to: ConnectionState| {
            sink.lock().push((from, to));
        }));

        machine.request_transition(Connecting).unwrap();
        machine.request_transition(Connected).unwrap();
        machine.request_transition(Failed).unwrap();
        machine.request_transition(Closed).unwrap();

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (New, Connecting),
                (Connecting, Connected),
                (Connected, Failed),
                (Failed, Closed),
            ]
        );
    }

    #[test]
    fn failure_stops_gate_before_later_observers_run() {
        use ConnectionState::*;
        let machine = ConnectionStateMachine::new();
        let running = Arc::new(AtomicBool::new(true));

        // Stop gate registered first, the way the supervisor wires it.
        let gate = running.clone();
        machine.observe(Box::new(move |_, to: ConnectionState| {
            if to != Connected {
                gate.store(false, Ordering::SeqCst);
            }
        }));

        let observed = Arc::new(Mutex::new(Vec::new()));
        let probe_flag = running.clone();
        let probe_sink = observed.clone();
        machine.observe(Box::new(move |_, to: ConnectionState| {
            probe_sink.lock().push((to, probe_flag.load(Ordering::SeqCst)));
        }));

        machine.request_transition(Connecting).unwrap();
        machine.request_transition(Connected).unwrap();
        machine.request_transition(Failed).unwrap();

        assert!(!running.load(Ordering::SeqCst));
        let observed = observed.lock();
        // By the time any later subscriber hears about Failed, the
        // pipeline gate has already been stopped.
        assert_eq!(observed.last(), Some(&(Failed, false)));
    }

    #[tokio::test]
    async fn wait_for_connected_wakes_on_transition() {
        let machine = Arc::new(ConnectionStateMachine::new());
        let mover = machine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            mover.request_transition(ConnectionState::Connecting).unwrap();
            mover.request_transition(ConnectionState::Connected).unwrap();
        });
        assert!(machine.wait_for_connected(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn wait_for_connected_times_out() {
        let machine = ConnectionStateMachine::new();
        assert!(!machine.wait_for_connected(Duration::from_millis(50)).await);
    }
}
