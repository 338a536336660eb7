//! Session supervision
//!
//! One supervisor drives one session end to end: signaling handshake,
//! media link establishment, the role's pipeline, and a guaranteed
//! teardown sequence (stop pipelines, close transport, close signaling,
//! mark the state machine `Closed`) regardless of how the session ends.
//!
//! The supervisor is the only component that mutates the state machine.
//! Transport and pipeline workers report through channels; signaling is
//! split so a forwarder task can keep reading while the supervisor
//! waits on all event sources at once.

use crate::capture::FrameSource;
use crate::config::Config;
use crate::frame::PixelFormat;
use crate::overlay::FrameAnnotator;
use crate::pipeline::{
    ConsumerReport, ConsumerSettings, FrameConsumerPipeline, FrameProducerPipeline,
    PipelineControl, PipelineEvent, ProducerReport, ProducerSettings,
};
use crate::render::FrameSink;
use crate::session::state::{ConnectionState, ConnectionStateMachine};
use crate::signaling::{
    DescriptionKind, SessionDescription, SignalingChannel, SignalingError, SignalingReader,
    SignalingWriter,
};
use crate::transport::{MediaParams, PeerTransport, TransportError, TransportEvent};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;
use tokio::task;
use uuid::Uuid;

/// Lifecycle phase an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Handshake,
    Streaming,
    Teardown,
}

impl SessionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStage::Handshake => "handshake",
            SessionStage::Streaming => "streaming",
            SessionStage::Teardown => "teardown",
        }
    }
}

/// Underlying cause of a session failure.
#[derive(Debug)]
pub enum SessionErrorKind {
    Signaling(SignalingError),
    Transport(TransportError),
    Protocol(String),
    Timeout(String),
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErrorKind::Signaling(e) => write!(f, "signaling error: {}", e),
            SessionErrorKind::Transport(e) => write!(f, "transport error: {}", e),
            SessionErrorKind::Protocol(msg) => write!(f, "protocol error: {}", msg),
            SessionErrorKind::Timeout(msg) => write!(f, "timed out: {}", msg),
        }
    }
}

/// Failure surfaced to the caller: which stage broke, the last state
/// observed before teardown, and the cause.
#[derive(Debug)]
pub struct SessionError {
    pub stage: SessionStage,
    pub state: ConnectionState,
    pub kind: SessionErrorKind,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed in state {}: {}",
            self.stage.as_str(),
            self.state,
            self.kind
        )
    }
}

impl std::error::Error for SessionError {}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The peer closed the media link cleanly.
    RemoteClosed,
    /// A local shutdown request (interrupt, test harness).
    LocalShutdown,
    /// The peer ended the signaling stream.
    SignalingEnded,
    /// The media link or signaling stream broke.
    TransportFailed(String),
    /// A pipeline exhausted its consecutive-error budget.
    BudgetExhausted { failures: u32 },
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::RemoteClosed => write!(f, "peer closed the session"),
            SessionOutcome::LocalShutdown => write!(f, "local shutdown"),
            SessionOutcome::SignalingEnded => write!(f, "peer ended signaling"),
            SessionOutcome::TransportFailed(reason) => write!(f, "transport failed: {}", reason),
            SessionOutcome::BudgetExhausted { failures } => {
                write!(f, "error budget exhausted after {} consecutive failures", failures)
            }
        }
    }
}

/// End-of-session summary returned to the caller.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub final_state: ConnectionState,
    pub producer: Option<ProducerReport>,
    pub consumer: Option<ConsumerReport>,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} ended: {} (final state {})",
            self.session_id, self.outcome, self.final_state
        )?;
        if let Some(producer) = &self.producer {
            write!(f, "; producer: {}", producer)?;
        }
        if let Some(consumer) = &self.consumer {
            write!(f, "; consumer: {}", consumer)?;
        }
        Ok(())
    }
}

/// Messages forwarded off the signaling reader task.
enum SignalingInbound {
    Description(SessionDescription),
    Ended,
    Error(SignalingError),
}

/// Runs one session. Construct, optionally attach observers through
/// [`state_machine`](Self::state_machine), then call the role's run
/// method exactly once.
pub struct SessionSupervisor {
    session_id: String,
    machine: Arc<ConnectionStateMachine>,
    controls: Arc<Mutex<Vec<PipelineControl>>>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let machine = Arc::new(ConnectionStateMachine::new());
        let controls: Arc<Mutex<Vec<PipelineControl>>> = Arc::new(Mutex::new(Vec::new()));

        // First observer on the machine: halt pipelines the moment the
        // state leaves Connected, before any later subscriber runs.
        let gate = controls.clone();
        machine.observe(Box::new(move |_from: ConnectionState, to: ConnectionState| {
            if to != ConnectionState::Connected {
                for control in gate.lock().iter() {
                    control.stop();
                }
            }
        }));

        Self {
            session_id: Uuid::new_v4().to_string(),
            machine,
            controls,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The session's state machine, for observers and diagnostics.
    pub fn state_machine(&self) -> Arc<ConnectionStateMachine> {
        self.machine.clone()
    }

    /// Request teardown from outside the run loop. Safe to call any
    /// number of times, before, during or after the session.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("Session {} shutdown requested", self.session_id);
        }
        self.notify.notify_waiters();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn register_control(&self) -> PipelineControl {
        let control = PipelineControl::new();
        self.controls.lock().push(control.clone());
        control
    }

    fn error(&self, stage: SessionStage, kind: SessionErrorKind) -> SessionError {
        SessionError {
            stage,
            state: self.machine.current(),
            kind,
        }
    }

    /// Abort a half-built session: capture the failure, mark the machine
    /// failed then closed, release whatever transport exists.
    async fn abort_handshake(
        &self,
        kind: SessionErrorKind,
        transport: Option<&PeerTransport>,
    ) -> SessionError {
        let error = self.error(SessionStage::Handshake, kind);
        warn!("Session {}: {}", self.session_id, error);
        let _ = self.machine.request_transition(ConnectionState::Failed);
        if let Some(transport) = transport {
            transport.close().await;
        }
        let _ = self.machine.request_transition(ConnectionState::Closed);
        error
    }

    /// Run a full sending session: offer, answer, media accept, producer
    /// pipeline, teardown.
    pub async fn run_sender(
        &self,
        config: &Config,
        source: Box<dyn FrameSource>,
        annotator: Option<Box<dyn FrameAnnotator>>,
    ) -> Result<SessionReport, SessionError> {
        let handshake_timeout = config.signaling.handshake_timeout();
        let deadline = Instant::now() + handshake_timeout;
        info!(
            "Session {} starting as sender (signaling {})",
            self.session_id,
            config.signaling.addr()
        );
        if let Err(e) = self.machine.request_transition(ConnectionState::Connecting) {
            return Err(self.error(SessionStage::Handshake, SessionErrorKind::Protocol(e.to_string())));
        }

        let (transport_tx, mut transport_events) = mpsc::unbounded_channel();
        let params = MediaParams {
            address: String::new(),
            width: config.video.width,
            height: config.video.height,
            fps: config.video.fps,
            format: config.video.format.clone(),
        };
        let transport = match PeerTransport::bind_sender(
            &config.media.bind_addr(),
            &config.media.advertised_host(),
            params,
            transport_tx,
            config.pipeline.queue_capacity,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => return Err(self.abort_handshake(SessionErrorKind::Transport(e), None).await),
        };

        let mut signaling =
            match SignalingChannel::dial(&config.signaling.addr(), remaining(deadline)).await {
                Ok(signaling) => signaling,
                Err(e) => {
                    return Err(self
                        .abort_handshake(SessionErrorKind::Signaling(e), Some(&transport))
                        .await)
                }
            };

        let offer_payload = match transport.local_params().to_json() {
            Ok(payload) => payload,
            Err(e) => {
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Protocol(format!("offer encoding failed: {}", e)),
                        Some(&transport),
                    )
                    .await)
            }
        };
        if let Err(e) = signaling
            .send(&SessionDescription::offer(offer_payload), Some(&self.session_id))
            .await
        {
            return Err(self
                .abort_handshake(SessionErrorKind::Signaling(e), Some(&transport))
                .await);
        }
        debug!("Offer sent, awaiting answer");

        let answer = match tokio::time::timeout(remaining(deadline), signaling.receive()).await {
            Err(_) => {
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Timeout(format!(
                            "no answer within {:?}",
                            handshake_timeout
                        )),
                        Some(&transport),
                    )
                    .await)
            }
            Ok(Err(e)) => {
                return Err(self
                    .abort_handshake(SessionErrorKind::Signaling(e), Some(&transport))
                    .await)
            }
            Ok(Ok(None)) => {
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Protocol(
                            "peer ended signaling before answering".to_string(),
                        ),
                        Some(&transport),
                    )
                    .await)
            }
            Ok(Ok(Some(description))) => description,
        };
        if answer.kind != DescriptionKind::Answer {
            return Err(self
                .abort_handshake(
                    SessionErrorKind::Protocol(format!(
                        "expected answer, got {}",
                        answer.kind.as_str()
                    )),
                    Some(&transport),
                )
                .await);
        }
        let remote = match MediaParams::from_json(&answer.payload) {
            Ok(remote) => remote,
            Err(e) => {
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Protocol(format!("unparseable answer payload: {}", e)),
                        Some(&transport),
                    )
                    .await)
            }
        };
        let local = transport.local_params();
        if !local.agrees_with(&remote) {
            return Err(self
                .abort_handshake(
                    SessionErrorKind::Protocol(format!(
                        "answer disagrees on media parameters: offered {}, answered {}",
                        local.describe(),
                        remote.describe()
                    )),
                    Some(&transport),
                )
                .await);
        }

        if let Err(e) = transport.establish(remaining(deadline)).await {
            return Err(self
                .abort_handshake(SessionErrorKind::Transport(e), Some(&transport))
                .await);
        }
        if let Err(e) = self.machine.request_transition(ConnectionState::Connected) {
            return Err(self
                .abort_handshake(SessionErrorKind::Protocol(e.to_string()), Some(&transport))
                .await);
        }

        let control = self.register_control();
        let format = match PixelFormat::parse(&config.video.format) {
            Some(format) => format,
            None => {
                // Validation should have rejected the config already.
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Protocol(format!(
                            "unsupported pixel format: {}",
                            config.video.format
                        )),
                        Some(&transport),
                    )
                    .await);
            }
        };
        let settings = ProducerSettings {
            width: config.video.width,
            height: config.video.height,
            fps: config.video.fps,
            format,
            capture_wait: Duration::from_millis(config.pipeline.capture_wait_ms),
            capture_retries: config.pipeline.capture_retries,
            stats_interval: config.pipeline.stats_interval,
            error_threshold: config.pipeline.error_threshold,
        };
        let pipeline = FrameProducerPipeline::new(
            source,
            annotator,
            transport.outbound(),
            control.clone(),
            settings,
        );
        let producer_task = task::spawn_blocking(move || pipeline.run());

        let (sig_reader, mut sig_writer) = signaling.split();
        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        let _sig_guard = sig_tx.clone();
        let sig_task = tokio::spawn(forward_signaling(sig_reader, sig_tx));
        let mut state_watch = self.machine.watch();

        let outcome = loop {
            if self.shutdown_requested() {
                break SessionOutcome::LocalShutdown;
            }
            tokio::select! {
                event = transport_events.recv() => match event {
                    Some(TransportEvent::LinkEstablished { peer }) => {
                        debug!("Media link confirmed with {}", peer);
                    }
                    Some(TransportEvent::LinkFailed { reason }) => {
                        let _ = self.machine.request_transition(ConnectionState::Failed);
                        break SessionOutcome::TransportFailed(reason);
                    }
                    Some(TransportEvent::LinkClosed) | None => break SessionOutcome::RemoteClosed,
                },
                inbound = sig_rx.recv() => match inbound {
                    Some(SignalingInbound::Description(description)) => {
                        warn!(
                            "Ignoring unexpected {} during streaming",
                            description.kind.as_str()
                        );
                    }
                    Some(SignalingInbound::Ended) | None => {
                        info!("Peer ended signaling");
                        break SessionOutcome::SignalingEnded;
                    }
                    Some(SignalingInbound::Error(e)) => {
                        let _ = self.machine.request_transition(ConnectionState::Failed);
                        break SessionOutcome::TransportFailed(format!("signaling: {}", e));
                    }
                },
                changed = state_watch.changed() => {
                    if changed.is_err() {
                        break SessionOutcome::TransportFailed("state machine dropped".to_string());
                    }
                    let state = *state_watch.borrow_and_update();
                    if state != ConnectionState::Connected {
                        break outcome_for_state(state);
                    }
                },
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_secs(1)) => {},
            }
        };

        info!("Session {} ending: {}", self.session_id, outcome);
        control.stop();
        let producer = match producer_task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Producer task join failed: {}", e);
                None
            }
        };
        transport.close().await;
        if let Err(e) = sig_writer.send_bye().await {
            debug!("Signaling bye not delivered: {}", e);
        }
        sig_task.abort();
        let _ = sig_task.await;
        let _ = self.machine.request_transition(ConnectionState::Closed);

        Ok(SessionReport {
            session_id: self.session_id.clone(),
            outcome,
            final_state: self.machine.current(),
            producer,
            consumer: None,
        })
    }

    /// Run a full receiving session: await offer, echo answer, dial
    /// media, consumer pipeline, teardown.
    pub async fn run_receiver(
        &self,
        config: &Config,
        sink: Box<dyn FrameSink>,
        annotator: Option<Box<dyn FrameAnnotator>>,
    ) -> Result<SessionReport, SessionError> {
        let handshake_timeout = config.signaling.handshake_timeout();
        let deadline = Instant::now() + handshake_timeout;
        info!(
            "Session {} starting as receiver (signaling {})",
            self.session_id,
            config.signaling.addr()
        );
        if let Err(e) = self.machine.request_transition(ConnectionState::Connecting) {
            return Err(self.error(SessionStage::Handshake, SessionErrorKind::Protocol(e.to_string())));
        }

        let (transport_tx, mut transport_events) = mpsc::unbounded_channel();
        let transport =
            PeerTransport::new_receiver(transport_tx, config.pipeline.queue_capacity);

        let mut signaling =
            match SignalingChannel::listen(&config.signaling.addr(), remaining(deadline)).await {
                Ok(signaling) => signaling,
                Err(e) => {
                    return Err(self
                        .abort_handshake(SessionErrorKind::Signaling(e), Some(&transport))
                        .await)
                }
            };

        let offer = match tokio::time::timeout(remaining(deadline), signaling.receive()).await {
            Err(_) => {
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Timeout(format!(
                            "no offer within {:?}",
                            handshake_timeout
                        )),
                        Some(&transport),
                    )
                    .await)
            }
            Ok(Err(e)) => {
                return Err(self
                    .abort_handshake(SessionErrorKind::Signaling(e), Some(&transport))
                    .await)
            }
            Ok(Ok(None)) => {
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Protocol(
                            "peer ended signaling before offering".to_string(),
                        ),
                        Some(&transport),
                    )
                    .await)
            }
            Ok(Ok(Some(description))) => description,
        };
        if offer.kind != DescriptionKind::Offer {
            return Err(self
                .abort_handshake(
                    SessionErrorKind::Protocol(format!(
                        "expected offer, got {}",
                        offer.kind.as_str()
                    )),
                    Some(&transport),
                )
                .await);
        }
        let remote = match MediaParams::from_json(&offer.payload) {
            Ok(remote) => remote,
            Err(e) => {
                return Err(self
                    .abort_handshake(
                        SessionErrorKind::Protocol(format!("unparseable offer payload: {}", e)),
                        Some(&transport),
                    )
                    .await)
            }
        };
        info!("Offer received: {} at {}", remote.describe(), remote.address);

        // Echo the offered parameters back as our answer.
        if let Err(e) = signaling
            .send(
                &SessionDescription::answer(offer.payload.clone()),
                Some(&self.session_id),
            )
            .await
        {
            return Err(self
                .abort_handshake(SessionErrorKind::Signaling(e), Some(&transport))
                .await);
        }

        if let Err(e) = transport.connect(&remote, remaining(deadline)).await {
            return Err(self
                .abort_handshake(SessionErrorKind::Transport(e), Some(&transport))
                .await);
        }
        if let Err(e) = self.machine.request_transition(ConnectionState::Connected) {
            return Err(self
                .abort_handshake(SessionErrorKind::Protocol(e.to_string()), Some(&transport))
                .await);
        }

        let control = self.register_control();
        let (pipeline_tx, mut pipeline_events) = mpsc::unbounded_channel();
        let _pipeline_guard = pipeline_tx.clone();
        let settings = ConsumerSettings {
            receive_timeout: config.pipeline.receive_timeout(),
            error_threshold: config.pipeline.error_threshold,
            stats_interval: config.pipeline.stats_interval,
        };
        let pipeline = FrameConsumerPipeline::new(
            transport.inbound(),
            sink,
            annotator,
            control.clone(),
            pipeline_tx,
            settings,
        );
        let consumer_task = task::spawn_blocking(move || pipeline.run());

        let (sig_reader, mut sig_writer) = signaling.split();
        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        let _sig_guard = sig_tx.clone();
        let sig_task = tokio::spawn(forward_signaling(sig_reader, sig_tx));
        let mut state_watch = self.machine.watch();

        let outcome = loop {
            if self.shutdown_requested() {
                break SessionOutcome::LocalShutdown;
            }
            tokio::select! {
                event = transport_events.recv() => match event {
                    Some(TransportEvent::LinkEstablished { peer }) => {
                        debug!("Media link confirmed with {}", peer);
                    }
                    Some(TransportEvent::LinkFailed { reason }) => {
                        let _ = self.machine.request_transition(ConnectionState::Failed);
                        break SessionOutcome::TransportFailed(reason);
                    }
                    Some(TransportEvent::LinkClosed) | None => break SessionOutcome::RemoteClosed,
                },
                event = pipeline_events.recv() => {
                    if let Some(PipelineEvent::BudgetExhausted { failures }) = event {
                        let _ = self.machine.request_transition(ConnectionState::Failed);
                        break SessionOutcome::BudgetExhausted { failures };
                    }
                },
                inbound = sig_rx.recv() => match inbound {
                    Some(SignalingInbound::Description(description))
                        if description.kind == DescriptionKind::Offer =>
                    {
                        self.renegotiate(&transport, &mut sig_writer, description).await;
                    }
                    Some(SignalingInbound::Description(description)) => {
                        warn!(
                            "Ignoring unexpected {} during streaming",
                            description.kind.as_str()
                        );
                    }
                    Some(SignalingInbound::Ended) | None => {
                        info!("Peer ended signaling");
                        break SessionOutcome::SignalingEnded;
                    }
                    Some(SignalingInbound::Error(e)) => {
                        let _ = self.machine.request_transition(ConnectionState::Failed);
                        break SessionOutcome::TransportFailed(format!("signaling: {}", e));
                    }
                },
                changed = state_watch.changed() => {
                    if changed.is_err() {
                        break SessionOutcome::TransportFailed("state machine dropped".to_string());
                    }
                    let state = *state_watch.borrow_and_update();
                    if state != ConnectionState::Connected {
                        break outcome_for_state(state);
                    }
                },
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_secs(1)) => {},
            }
        };

        info!("Session {} ending: {}", self.session_id, outcome);
        control.stop();
        let consumer = match consumer_task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Consumer task join failed: {}", e);
                None
            }
        };
        transport.close().await;
        if let Err(e) = sig_writer.send_bye().await {
            debug!("Signaling bye not delivered: {}", e);
        }
        sig_task.abort();
        let _ = sig_task.await;
        let _ = self.machine.request_transition(ConnectionState::Closed);

        Ok(SessionReport {
            session_id: self.session_id.clone(),
            outcome,
            final_state: self.machine.current(),
            producer: None,
            consumer,
        })
    }

    /// Adopt renegotiated parameters mid-session and re-echo them.
    async fn renegotiate(
        &self,
        transport: &PeerTransport,
        sig_writer: &mut SignalingWriter,
        offer: SessionDescription,
    ) {
        match MediaParams::from_json(&offer.payload) {
            Ok(params) => match transport.apply_remote(&params) {
                Ok(()) => {
                    info!("Renegotiated media parameters: {}", params.describe());
                    if let Err(e) = sig_writer
                        .send(
                            &SessionDescription::answer(offer.payload),
                            Some(&self.session_id),
                        )
                        .await
                    {
                        warn!("Could not answer renegotiation: {}", e);
                    }
                }
                Err(e) => warn!("Rejecting renegotiation: {}", e),
            },
            Err(e) => warn!("Ignoring unparseable renegotiation offer: {}", e),
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Outcome when the state leaves Connected through an external
/// transition rather than one of the supervisor's own event arms.
fn outcome_for_state(state: ConnectionState) -> SessionOutcome {
    match state {
        ConnectionState::Closed => SessionOutcome::LocalShutdown,
        ConnectionState::Disconnected => {
            SessionOutcome::TransportFailed("connection lost".to_string())
        }
        other => SessionOutcome::TransportFailed(format!("connection state changed to {}", other)),
    }
}

async fn forward_signaling(
    mut reader: SignalingReader,
    tx: UnboundedSender<SignalingInbound>,
) {
    loop {
        match reader.receive().await {
            Ok(Some(description)) => {
                if tx.send(SignalingInbound::Description(description)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(SignalingInbound::Ended);
                break;
            }
            Err(e) => {
                let _ = tx.send(SignalingInbound::Error(e));
                break;
            }
        }
    }
}
