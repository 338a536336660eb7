//! Session-description signaling over TCP
//!
//! Point-to-point exchange of offer/answer descriptions ahead of media
//! flow:
//! - Length-prefixed JSON envelopes over a persistent TCP connection
//! - Either peer may start first (dial retries until its deadline)
//! - A clean peer close (EOF or `bye`) is end-of-signaling, not an error

pub mod framing;

pub use framing::{FrameDecoder, FramingError, MAX_SIGNAL_FRAME};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Signaling-related errors
#[derive(Debug)]
pub enum SignalingError {
    /// Transport-level connection could not be established
    Unavailable(String),
    /// Peer end disconnected while sending
    Closed,
    /// Framing or envelope violation
    Protocol(String),
    /// Underlying I/O failure
    Io(std::io::Error),
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::Unavailable(msg) => write!(f, "signaling unavailable: {}", msg),
            SignalingError::Closed => write!(f, "signaling channel closed by peer"),
            SignalingError::Protocol(msg) => write!(f, "signaling protocol error: {}", msg),
            SignalingError::Io(e) => write!(f, "signaling I/O error: {}", e),
        }
    }
}

impl Error for SignalingError {}

impl From<std::io::Error> for SignalingError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => SignalingError::Closed,
            _ => SignalingError::Io(e),
        }
    }
}

impl From<FramingError> for SignalingError {
    fn from(e: FramingError) -> Self {
        SignalingError::Protocol(e.to_string())
    }
}

/// Role of a session description in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

/// An offer or answer with an opaque payload blob.
///
/// The payload is the media transport's native description format; the
/// signaling layer never interprets it. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub payload: String,
}

impl SessionDescription {
    pub fn offer(payload: String) -> Self {
        Self { kind: DescriptionKind::Offer, payload }
    }

    pub fn answer(payload: String) -> Self {
        Self { kind: DescriptionKind::Answer, payload }
    }
}

/// Wire envelope for signaling messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Session description from the offering peer
    Offer {
        payload: String,
        #[serde(default)]
        session: Option<String>,
    },

    /// Session description from the answering peer
    Answer {
        payload: String,
        #[serde(default)]
        session: Option<String>,
    },

    /// Clean end-of-signaling marker
    Bye,
}

impl SignalMessage {
    /// Parse an envelope from JSON
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json)
            .map_err(|e| SignalingError::Protocol(format!("invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self)
            .map_err(|e| SignalingError::Protocol(format!("failed to serialize message: {}", e)))
    }

    fn from_description(desc: &SessionDescription, session: Option<&str>) -> Self {
        let session = session.map(|s| s.to_string());
        match desc.kind {
            DescriptionKind::Offer => SignalMessage::Offer {
                payload: desc.payload.clone(),
                session,
            },
            DescriptionKind::Answer => SignalMessage::Answer {
                payload: desc.payload.clone(),
                session,
            },
        }
    }

    /// `None` means the envelope carried an end-of-signaling marker.
    fn into_description(self) -> Option<SessionDescription> {
        match self {
            SignalMessage::Offer { payload, .. } => Some(SessionDescription::offer(payload)),
            SignalMessage::Answer { payload, .. } => Some(SessionDescription::answer(payload)),
            SignalMessage::Bye => None,
        }
    }
}

async fn write_envelope<W: AsyncWrite + Unpin>(
    stream: &mut W,
    message: &SignalMessage,
) -> Result<(), SignalingError> {
    let json = message.to_json()?;
    let framed = framing::frame_message(json.as_bytes());
    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the next description. `Ok(None)` is end-of-signaling: the peer
/// closed the stream cleanly or sent a `bye` envelope.
async fn read_description<R: AsyncRead + Unpin>(
    stream: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Option<SessionDescription>, SignalingError> {
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(raw) = decoder.next_message()? {
            let json = String::from_utf8(raw)
                .map_err(|e| SignalingError::Protocol(format!("non-UTF8 message: {}", e)))?;
            let message = SignalMessage::from_json(&json)?;
            match message.into_description() {
                Some(desc) => return Ok(Some(desc)),
                None => {
                    debug!("signaling peer sent bye");
                    return Ok(None);
                }
            }
        }

        let n = match stream.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) => match SignalingError::from(e) {
                SignalingError::Closed => return Ok(None),
                other => return Err(other),
            },
        };
        if n == 0 {
            debug!("signaling stream closed by peer");
            return Ok(None);
        }
        decoder.extend(&chunk[..n]);
    }
}

/// Accepts exactly one signaling peer.
pub struct SignalingListener {
    inner: TcpListener,
}

impl SignalingListener {
    pub async fn bind(addr: &str) -> Result<Self, SignalingError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| SignalingError::Unavailable(format!("bind {}: {}", addr, e)))?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SignalingError> {
        self.inner.local_addr().map_err(SignalingError::Io)
    }

    /// Wait up to `timeout` for the peer to connect.
    pub async fn accept(self, timeout: Duration) -> Result<SignalingChannel, SignalingError> {
        let (stream, peer) = tokio::time::timeout(timeout, self.inner.accept())
            .await
            .map_err(|_| {
                SignalingError::Unavailable(format!("no signaling peer within {:?}", timeout))
            })?
            .map_err(|e| SignalingError::Unavailable(format!("accept failed: {}", e)))?;
        stream.set_nodelay(true).map_err(SignalingError::Io)?;
        info!("signaling peer connected from {}", peer);
        Ok(SignalingChannel {
            stream,
            decoder: FrameDecoder::new(),
            peer,
        })
    }
}

/// One end of the signaling exchange.
///
/// Exactly one outstanding `receive` at a time (single reader); `&mut
/// self` enforces it, and `split` hands the read half to one owner for
/// the streaming phase.
pub struct SignalingChannel {
    stream: TcpStream,
    decoder: FrameDecoder,
    peer: SocketAddr,
}

impl SignalingChannel {
    /// Connect to the peer's signaling endpoint, retrying until the
    /// deadline so the two sides may start in either order.
    pub async fn dial(addr: &str, timeout: Duration) -> Result<Self, SignalingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_err = String::new();
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(SignalingError::Io)?;
                    let peer = stream.peer_addr().map_err(SignalingError::Io)?;
                    info!("signaling connected to {}", peer);
                    return Ok(Self {
                        stream,
                        decoder: FrameDecoder::new(),
                        peer,
                    });
                }
                Err(e) => {
                    last_err = e.to_string();
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SignalingError::Unavailable(format!(
                    "connect {} timed out: {}",
                    addr, last_err
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Bind `addr` and wait for the single signaling peer.
    pub async fn listen(addr: &str, timeout: Duration) -> Result<Self, SignalingError> {
        SignalingListener::bind(addr).await?.accept(timeout).await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send a description in order. Fails with `Closed` once the peer
    /// end has disconnected.
    pub async fn send(
        &mut self,
        description: &SessionDescription,
        session: Option<&str>,
    ) -> Result<(), SignalingError> {
        let message = SignalMessage::from_description(description, session);
        write_envelope(&mut self.stream, &message).await
    }

    /// Receive the next description; `Ok(None)` is end-of-signaling.
    pub async fn receive(&mut self) -> Result<Option<SessionDescription>, SignalingError> {
        read_description(&mut self.stream, &mut self.decoder).await
    }

    /// Best-effort clean-close marker for teardown.
    pub async fn send_bye(&mut self) -> Result<(), SignalingError> {
        write_envelope(&mut self.stream, &SignalMessage::Bye).await
    }

    /// Split for the streaming phase: the reader goes to the one task
    /// that keeps consuming signaling, the writer stays with teardown.
    pub fn split(self) -> (SignalingReader, SignalingWriter) {
        let (read, write) = self.stream.into_split();
        (
            SignalingReader {
                stream: read,
                decoder: self.decoder,
            },
            SignalingWriter { stream: write },
        )
    }
}

/// Read half of a split channel; the session's single signaling reader.
pub struct SignalingReader {
    stream: OwnedReadHalf,
    decoder: FrameDecoder,
}

impl SignalingReader {
    pub async fn receive(&mut self) -> Result<Option<SessionDescription>, SignalingError> {
        read_description(&mut self.stream, &mut self.decoder).await
    }
}

/// Write half of a split channel.
pub struct SignalingWriter {
    stream: OwnedWriteHalf,
}

impl SignalingWriter {
    pub async fn send(
        &mut self,
        description: &SessionDescription,
        session: Option<&str>,
    ) -> Result<(), SignalingError> {
        let message = SignalMessage::from_description(description, session);
        write_envelope(&mut self.stream, &message).await
    }

    pub async fn send_bye(&mut self) -> Result<(), SignalingError> {
        write_envelope(&mut self.stream, &SignalMessage::Bye).await
    }
}
