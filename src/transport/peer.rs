//! Peer media connection
//!
//! One TCP connection per session, created out-of-band from signaling:
//! the sending side binds a listener and advertises its endpoint inside
//! the offer payload; the receiving side dials it and echoes the
//! parameters back in the answer.
//!
//! Socket I/O runs on blocking worker threads (`spawn_blocking`) with
//! short read timeouts so stop flags are observed promptly. Pipelines
//! exchange frames with those threads through drop-oldest queues and
//! never touch the socket.

use super::wire::{encode_bye, encode_frame, encode_keepalive, FramePacket, MediaDecoder, MediaPacket};
use super::{TransportError, TransportEvent};
use crate::frame::{FrameQueue, PixelFormat, VideoFrame};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task;

/// Writer-side poll interval on the outbound queue.
const OUTBOUND_POLL: Duration = Duration::from_millis(100);
/// Socket read timeout; bounds how long threads ignore the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Socket write timeout; a stalled peer fails the link after this long.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Receiver-to-sender keepalive cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Delay between dial attempts while the remote listener comes up.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);
/// Upper bound on a single dial attempt.
const CONNECT_ATTEMPT_CAP: Duration = Duration::from_secs(2);

/// Media parameters carried in signaling payloads.
///
/// The offer advertises the sender's listener endpoint and stream
/// geometry; the answer echoes them so both sides agree before frames
/// flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaParams {
    /// `host:port` of the sending side's media listener.
    pub address: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: String,
}

impl MediaParams {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// True when the stream settings match; the endpoint address is not
    /// compared.
    pub fn agrees_with(&self, other: &MediaParams) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.fps == other.fps
            && self.format == other.format
    }

    /// Short human-readable form for logs.
    pub fn describe(&self) -> String {
        format!("{}x{}@{}fps {}", self.width, self.height, self.fps, self.format)
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(TransportError::Protocol(format!(
                "invalid media geometry: {}",
                self.describe()
            )));
        }
        if PixelFormat::parse(&self.format).is_none() {
            return Err(TransportError::Protocol(format!(
                "unsupported pixel format: {}",
                self.format
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sender,
    Receiver,
}

/// One side of the media connection.
pub struct PeerTransport {
    role: Role,
    params: Mutex<MediaParams>,
    listener: Mutex<Option<TcpListener>>,
    outbound: Arc<FrameQueue<VideoFrame>>,
    inbound: Arc<FrameQueue<FramePacket>>,
    events: UnboundedSender<TransportEvent>,
    running: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    closed: AtomicBool,
    stream: Mutex<Option<std::net::TcpStream>>,
    tasks: Mutex<Vec<task::JoinHandle<()>>>,
}

impl PeerTransport {
    /// Create the sending side: bind the media listener and fold the
    /// resulting endpoint into the advertised parameters.
    pub async fn bind_sender(
        bind: &str,
        advertise_host: &str,
        mut params: MediaParams,
        events: UnboundedSender<TransportEvent>,
        queue_capacity: usize,
    ) -> Result<Self, TransportError> {
        params.validate()?;
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        params.address = format!("{}:{}", advertise_host, local.port());
        info!(
            "Media listener on {} advertising {} ({})",
            local,
            params.address,
            params.describe()
        );
        Ok(Self {
            role: Role::Sender,
            params: Mutex::new(params),
            listener: Mutex::new(Some(listener)),
            outbound: Arc::new(FrameQueue::new(queue_capacity)),
            inbound: Arc::new(FrameQueue::new(queue_capacity)),
            events,
            running: Arc::new(AtomicBool::new(true)),
            reported: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            stream: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Create the receiving side. Parameters are adopted from the remote
    /// offer in [`connect`](Self::connect).
    pub fn new_receiver(events: UnboundedSender<TransportEvent>, queue_capacity: usize) -> Self {
        Self {
            role: Role::Receiver,
            params: Mutex::new(MediaParams {
                address: String::new(),
                width: 0,
                height: 0,
                fps: 0,
                format: String::new(),
            }),
            listener: Mutex::new(None),
            outbound: Arc::new(FrameQueue::new(queue_capacity)),
            inbound: Arc::new(FrameQueue::new(queue_capacity)),
            events,
            running: Arc::new(AtomicBool::new(true)),
            reported: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            stream: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Currently negotiated media parameters.
    pub fn local_params(&self) -> MediaParams {
        self.params.lock().clone()
    }

    /// Queue the producer pipeline writes into (sending side).
    pub fn outbound(&self) -> Arc<FrameQueue<VideoFrame>> {
        self.outbound.clone()
    }

    /// Queue the consumer pipeline reads from (receiving side).
    pub fn inbound(&self) -> Arc<FrameQueue<FramePacket>> {
        self.inbound.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Adopt updated parameters from the remote peer (renegotiation or
    /// initial offer on the receiving side).
    pub fn apply_remote(&self, remote: &MediaParams) -> Result<(), TransportError> {
        remote.validate()?;
        let mut params = self.params.lock();
        if *params != *remote {
            info!("Media parameters updated: {}", remote.describe());
            *params = remote.clone();
        }
        Ok(())
    }

    /// Sending side: wait for the peer to dial the advertised endpoint,
    /// then start the drive threads.
    pub async fn establish(&self, wait: Duration) -> Result<SocketAddr, TransportError> {
        if self.role != Role::Sender {
            return Err(TransportError::Protocol(
                "establish is a sending-side operation".to_string(),
            ));
        }
        let listener = self.listener.lock().take().ok_or_else(|| {
            TransportError::Protocol("media listener already consumed".to_string())
        })?;

        let (stream, peer) = tokio::time::timeout(wait, listener.accept())
            .await
            .map_err(|_| {
                TransportError::Timeout(format!("no media connection within {:?}", wait))
            })??;
        stream.set_nodelay(true)?;
        let stream = into_blocking(stream)?;
        self.start_threads(stream)?;

        info!("Media link established with {}", peer);
        let _ = self.events.send(TransportEvent::LinkEstablished { peer });
        Ok(peer)
    }

    /// Receiving side: adopt the offered parameters and dial the sender's
    /// endpoint, retrying until `wait` elapses.
    pub async fn connect(
        &self,
        remote: &MediaParams,
        wait: Duration,
    ) -> Result<SocketAddr, TransportError> {
        if self.role != Role::Receiver {
            return Err(TransportError::Protocol(
                "connect is a receiving-side operation".to_string(),
            ));
        }
        self.apply_remote(remote)?;

        let deadline = Instant::now() + wait;
        let stream = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(format!(
                    "could not reach media endpoint {} within {:?}",
                    remote.address, wait
                )));
            }
            let attempt = remaining.min(CONNECT_ATTEMPT_CAP);
            match tokio::time::timeout(attempt, TcpStream::connect(remote.address.as_str())).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => {
                    debug!("Media dial to {} failed ({}), retrying", remote.address, e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY.min(remaining)).await;
                }
                Err(_) => continue,
            }
        };

        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let stream = into_blocking(stream)?;
        self.start_threads(stream)?;

        info!("Media link established with {}", peer);
        let _ = self.events.send(TransportEvent::LinkEstablished { peer });
        Ok(peer)
    }

    fn start_threads(&self, stream: std::net::TcpStream) -> Result<(), TransportError> {
        let read_half = stream.try_clone()?;
        read_half.set_read_timeout(Some(READ_TIMEOUT))?;
        let write_half = stream.try_clone()?;
        write_half.set_write_timeout(Some(WRITE_TIMEOUT))?;
        *self.stream.lock() = Some(stream);

        let mut tasks = self.tasks.lock();
        match self.role {
            Role::Sender => {
                let writer = MediaWriter {
                    stream: write_half,
                    outbound: self.outbound.clone(),
                    running: self.running.clone(),
                    reported: self.reported.clone(),
                    events: self.events.clone(),
                };
                tasks.push(task::spawn_blocking(move || writer.run()));

                let reader = ControlReader {
                    stream: read_half,
                    running: self.running.clone(),
                    reported: self.reported.clone(),
                    events: self.events.clone(),
                };
                tasks.push(task::spawn_blocking(move || reader.run()));
            }
            Role::Receiver => {
                let reader = MediaReader {
                    stream: read_half,
                    inbound: self.inbound.clone(),
                    running: self.running.clone(),
                    reported: self.reported.clone(),
                    events: self.events.clone(),
                };
                tasks.push(task::spawn_blocking(move || reader.run()));

                let writer = KeepaliveWriter {
                    stream: write_half,
                    running: self.running.clone(),
                    reported: self.reported.clone(),
                    events: self.events.clone(),
                };
                tasks.push(task::spawn_blocking(move || writer.run()));
            }
        }
        Ok(())
    }

    /// Tear the link down. Safe to call repeatedly; later calls return
    /// immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing media transport");
        self.running.store(false, Ordering::SeqCst);

        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            if let Ok(mut writer) = stream.try_clone() {
                let _ = writer.set_write_timeout(Some(Duration::from_secs(1)));
                let _ = writer.write_all(&encode_bye());
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Unconsumed listener from a handshake that never completed.
        drop(self.listener.lock().take());

        self.outbound.close();
        self.inbound.close();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Convert a tokio stream into a blocking std stream for thread use.
fn into_blocking(stream: TcpStream) -> Result<std::net::TcpStream, TransportError> {
    let std_stream = stream.into_std()?;
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}

fn report_terminal(
    running: &AtomicBool,
    reported: &AtomicBool,
    events: &UnboundedSender<TransportEvent>,
    event: TransportEvent,
) {
    running.store(false, Ordering::SeqCst);
    if !reported.swap(true, Ordering::SeqCst) {
        let _ = events.send(event);
    }
}

fn is_wait_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Sending side: pumps encoded frames from the outbound queue onto the
/// socket.
struct MediaWriter {
    stream: std::net::TcpStream,
    outbound: Arc<FrameQueue<VideoFrame>>,
    running: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    events: UnboundedSender<TransportEvent>,
}

impl MediaWriter {
    fn run(mut self) {
        let mut sent: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            let Some(frame) = self.outbound.take(OUTBOUND_POLL) else {
                continue;
            };
            let encoded = match encode_frame(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping unencodable frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.stream.write_all(&encoded) {
                // A write timeout means the peer stopped draining; the
                // link is not usable either way.
                report_terminal(
                    &self.running,
                    &self.reported,
                    &self.events,
                    TransportEvent::LinkFailed {
                        reason: format!("media write failed: {}", e),
                    },
                );
                break;
            }
            sent += 1;
            if sent <= 5 || sent % 500 == 0 {
                debug!("Sent {} media frames (pts={})", sent, frame.pts);
            }
        }
        debug!("Media writer thread exiting ({} frames sent)", sent);
    }
}

/// Sending side: watches the socket for keepalives and the peer's bye.
struct ControlReader {
    stream: std::net::TcpStream,
    running: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    events: UnboundedSender<TransportEvent>,
}

impl ControlReader {
    fn run(mut self) {
        let mut decoder = MediaDecoder::new();
        let mut buf = [0u8; 4096];
        let mut keepalives: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => {
                    report_terminal(
                        &self.running,
                        &self.reported,
                        &self.events,
                        TransportEvent::LinkFailed {
                            reason: "peer closed media connection without bye".to_string(),
                        },
                    );
                    return;
                }
                Ok(n) => n,
                Err(e) if is_wait_error(&e) => continue,
                Err(e) => {
                    report_terminal(
                        &self.running,
                        &self.reported,
                        &self.events,
                        TransportEvent::LinkFailed {
                            reason: format!("media read failed: {}", e),
                        },
                    );
                    return;
                }
            };
            decoder.extend(&buf[..n]);
            loop {
                match decoder.next_packet() {
                    Ok(Some(MediaPacket::Keepalive)) => {
                        keepalives += 1;
                        if keepalives <= 3 || keepalives % 60 == 0 {
                            debug!("Received {} keepalives from peer", keepalives);
                        }
                    }
                    Ok(Some(MediaPacket::Bye)) => {
                        report_terminal(
                            &self.running,
                            &self.reported,
                            &self.events,
                            TransportEvent::LinkClosed,
                        );
                        return;
                    }
                    Ok(Some(MediaPacket::Frame(_))) => {
                        warn!("Ignoring unexpected media frame from receiving peer");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        report_terminal(
                            &self.running,
                            &self.reported,
                            &self.events,
                            TransportEvent::LinkFailed {
                                reason: format!("media protocol error: {}", e),
                            },
                        );
                        return;
                    }
                }
            }
        }
    }
}

/// Receiving side: decodes frame packets into the inbound queue.
struct MediaReader {
    stream: std::net::TcpStream,
    inbound: Arc<FrameQueue<FramePacket>>,
    running: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    events: UnboundedSender<TransportEvent>,
}

impl MediaReader {
    fn run(mut self) {
        let mut decoder = MediaDecoder::new();
        let mut buf = [0u8; 64 * 1024];
        let mut received: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => {
                    report_terminal(
                        &self.running,
                        &self.reported,
                        &self.events,
                        TransportEvent::LinkFailed {
                            reason: "peer closed media connection without bye".to_string(),
                        },
                    );
                    break;
                }
                Ok(n) => n,
                Err(e) if is_wait_error(&e) => continue,
                Err(e) => {
                    report_terminal(
                        &self.running,
                        &self.reported,
                        &self.events,
                        TransportEvent::LinkFailed {
                            reason: format!("media read failed: {}", e),
                        },
                    );
                    break;
                }
            };
            decoder.extend(&buf[..n]);
            let mut stop = false;
            loop {
                match decoder.next_packet() {
                    Ok(Some(MediaPacket::Frame(packet))) => {
                        received += 1;
                        if received <= 5 || received % 500 == 0 {
                            debug!("Received {} media frames (pts={})", received, packet.pts);
                        }
                        self.inbound.offer(packet);
                    }
                    Ok(Some(MediaPacket::Keepalive)) => {}
                    Ok(Some(MediaPacket::Bye)) => {
                        report_terminal(
                            &self.running,
                            &self.reported,
                            &self.events,
                            TransportEvent::LinkClosed,
                        );
                        stop = true;
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        report_terminal(
                            &self.running,
                            &self.reported,
                            &self.events,
                            TransportEvent::LinkFailed {
                                reason: format!("media protocol error: {}", e),
                            },
                        );
                        stop = true;
                        break;
                    }
                }
            }
            if stop {
                break;
            }
        }
        // Let the consumer drain what already arrived, then observe the
        // closed queue.
        self.inbound.close();
        debug!("Media reader thread exiting ({} frames received)", received);
    }
}

/// Receiving side: periodic keepalives so the sender can tell the link
/// is alive even when it only transmits.
struct KeepaliveWriter {
    stream: std::net::TcpStream,
    running: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    events: UnboundedSender<TransportEvent>,
}

impl KeepaliveWriter {
    fn run(mut self) {
        let tick = Duration::from_millis(100);
        let mut since_last = Duration::ZERO;
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(tick);
            since_last += tick;
            if since_last < KEEPALIVE_INTERVAL {
                continue;
            }
            since_last = Duration::ZERO;
            if let Err(e) = self.stream.write_all(&encode_keepalive()) {
                report_terminal(
                    &self.running,
                    &self.reported,
                    &self.events,
                    TransportEvent::LinkFailed {
                        reason: format!("keepalive write failed: {}", e),
                    },
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TimeBase;
    use tokio::sync::mpsc;

    fn test_params() -> MediaParams {
        MediaParams {
            address: String::new(),
            width: 4,
            height: 4,
            fps: 30,
            format: "rgb24".to_string(),
        }
    }

    #[tokio::test]
    async fn test_frame_flows_sender_to_receiver() {
        let (sender_events, mut sender_rx) = mpsc::unbounded_channel();
        let (receiver_events, mut receiver_rx) = mpsc::unbounded_channel();

        let sender = PeerTransport::bind_sender(
            "127.0.0.1:0",
            "127.0.0.1",
            test_params(),
            sender_events,
            4,
        )
        .await
        .unwrap();
        let receiver = PeerTransport::new_receiver(receiver_events, 4);

        let offer = sender.local_params();
        let (established, connected) = tokio::join!(
            sender.establish(Duration::from_secs(2)),
            receiver.connect(&offer, Duration::from_secs(2)),
        );
        established.unwrap();
        connected.unwrap();
        assert!(matches!(
            sender_rx.recv().await,
            Some(TransportEvent::LinkEstablished { .. })
        ));
        assert!(matches!(
            receiver_rx.recv().await,
            Some(TransportEvent::LinkEstablished { .. })
        ));
        assert_eq!(receiver.local_params().describe(), offer.describe());

        let mut frame = VideoFrame::captured(4, 4, PixelFormat::Rgb24, vec![7u8; 48]);
        frame.stamp(3, TimeBase::per_frame(30));
        sender.outbound().offer(frame);

        let inbound = receiver.inbound();
        let packet = task::spawn_blocking(move || inbound.take(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("frame should arrive");
        assert_eq!(packet.pts, 3);
        let decoded = VideoFrame::try_from(packet).unwrap();
        assert_eq!(decoded.data, vec![7u8; 48]);

        sender.close().await;
        let event = tokio::time::timeout(Duration::from_secs(2), receiver_rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(TransportEvent::LinkClosed)));
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_connect_times_out_without_listener() {
        let (events, _rx) = mpsc::unbounded_channel();
        let receiver = PeerTransport::new_receiver(events, 4);
        let mut remote = test_params();
        remote.address = "127.0.0.1:1".to_string();

        let err = receiver
            .connect(&remote, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_apply_remote_rejects_bad_parameters() {
        let (events, _rx) = mpsc::unbounded_channel();
        let receiver = PeerTransport::new_receiver(events, 4);

        let mut remote = test_params();
        remote.format = "yuv420".to_string();
        assert!(matches!(
            receiver.apply_remote(&remote),
            Err(TransportError::Protocol(_))
        ));

        let mut remote = test_params();
        remote.width = 0;
        assert!(matches!(
            receiver.apply_remote(&remote),
            Err(TransportError::Protocol(_))
        ));
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_establish_requires_sending_role() {
        let (events, _rx) = mpsc::unbounded_channel();
        let receiver = PeerTransport::new_receiver(events, 4);
        let err = receiver.establish(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        receiver.close().await;
    }

    #[test]
    fn test_params_agreement_ignores_address() {
        let a = test_params();
        let mut b = test_params();
        b.address = "10.0.0.1:9999".to_string();
        assert!(a.agrees_with(&b));
        b.width = 8;
        assert!(!a.agrees_with(&b));
    }

    #[test]
    fn test_params_json_roundtrip() {
        let mut params = test_params();
        params.address = "127.0.0.1:5000".to_string();
        let json = params.to_json().unwrap();
        assert_eq!(MediaParams::from_json(&json).unwrap(), params);
    }
}
