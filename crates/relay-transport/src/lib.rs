//! # Relay Transports
//!
//! Two ways to move peer-protocol frames between the endpoints, one
//! interface. The direct path is a mutually-authenticated QUIC connection
//! pinned to exchanged certificate fingerprints; the fallback is a framing
//! shim over the signaling WebSocket once the rendezvous server enters
//! relay mode. The orchestrator binds to the [`MessageSink`] /
//! [`MessageStream`] capabilities, never to a concrete transport.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod direct;
pub mod net;
pub mod relay;
pub mod signaling;

use async_trait::async_trait;
use relay_proto::PeerMessage;
use thiserror::Error;

pub use direct::DirectEndpoint;
pub use relay::{RelaySink, RelayStream};
pub use signaling::SignalingClient;

/// Which transport carries the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Peer-to-peer QUIC
    Direct,
    /// Server-mediated WebSocket relay
    Relay,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Transport-layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection ended
    #[error("connection closed")]
    Closed,

    /// Connection attempt ran out of time
    #[error("connection attempt timed out")]
    Timeout,

    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] relay_proto::CodecError),

    /// QUIC or TLS setup failure
    #[error("secure channel error: {0}")]
    Tls(String),

    /// Dial or handshake failure
    #[error("connect failed: {0}")]
    Connect(String),

    /// WebSocket failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Unexpected or malformed signaling traffic
    #[error("signaling error: {0}")]
    Signaling(String),
}

/// Outbound half of a peer connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Send one peer message, preserving submission order.
    async fn send(&mut self, message: &PeerMessage) -> Result<(), TransportError>;

    /// Flush and close the outbound side.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a peer connection.
#[async_trait]
pub trait MessageStream: Send {
    /// Receive the next peer message; `None` on clean end-of-stream.
    async fn recv(&mut self) -> Result<Option<PeerMessage>, TransportError>;
}

/// An established peer connection over either transport.
pub struct PeerConnection {
    kind: TransportKind,
    sink: Box<dyn MessageSink>,
    stream: Box<dyn MessageStream>,
}

impl PeerConnection {
    /// Wrap transport halves.
    #[must_use]
    pub fn new(
        kind: TransportKind,
        sink: Box<dyn MessageSink>,
        stream: Box<dyn MessageStream>,
    ) -> Self {
        Self { kind, sink, stream }
    }

    /// Which transport this connection runs over.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Split into independently-owned halves for the reader/writer tasks.
    #[must_use]
    pub fn split(self) -> (Box<dyn MessageSink>, Box<dyn MessageStream>) {
        (self.sink, self.stream)
    }

    /// Send one message (convenience before the split).
    ///
    /// # Errors
    ///
    /// Propagates the sink's [`TransportError`].
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), TransportError> {
        self.sink.send(message).await
    }

    /// Receive one message (convenience before the split).
    ///
    /// # Errors
    ///
    /// Propagates the stream's [`TransportError`].
    pub async fn recv(&mut self) -> Result<Option<PeerMessage>, TransportError> {
        self.stream.recv().await
    }
}
