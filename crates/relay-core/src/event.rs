//! Progress events.
//!
//! The engine publishes `(session_id, Event)` pairs on one stream; the
//! desktop shell forwards them to its UI verbatim, so everything here is
//! serde-serializable with stable names.

use serde::Serialize;
use uuid::Uuid;

use relay_proto::FileDescriptor;
use relay_transport::TransportKind;

/// Orchestrator states visible to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// No session
    Idle,
    /// Connecting to and registering with the rendezvous
    Signaling,
    /// Waiting for the counterpart to register
    AwaitPeer,
    /// Running the PAKE
    KeyExchange,
    /// Swapping encrypted certificate fingerprints
    FingerprintExchange,
    /// Trying direct QUIC, falling back to relay
    TransportSelect,
    /// Sender: offer sent, waiting for the answer
    Offering,
    /// Receiver: waiting for the sender's offer
    AwaitOffer,
    /// Receiver: offer shown, waiting for the user
    AwaitUserDecision,
    /// Chunks are flowing
    Streaming,
    /// All files verified and acknowledged
    Completed,
    /// Session torn down by either side
    Cancelled,
    /// Session ended with an error event
    Errored,
}

/// Which transport carries the session, for the UI's status badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Peer-to-peer QUIC
    Direct,
    /// Server-mediated relay
    Relay,
}

impl From<TransportKind> for ConnectionType {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Direct => Self::Direct,
            TransportKind::Relay => Self::Relay,
        }
    }
}

/// One progress event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The state machine moved
    StateChanged {
        /// New state
        state: TransferState,
    },
    /// Periodic throughput update, at most one per 100 ms
    TransferProgress {
        /// Bytes moved so far across all files
        bytes_transferred: u64,
        /// Sum of all offered file sizes
        bytes_total: u64,
        /// Windowed speed estimate
        speed_bps: f64,
        /// Estimated seconds remaining
        eta_s: f64,
        /// Name of the file currently streaming
        current_file: String,
        /// Whole-transfer completion percentage
        percent: f64,
    },
    /// Receiver only: an offer needs a user decision
    FileOffer {
        /// The local session awaiting `accept_transfer`
        session_id: Uuid,
        /// Offered files
        files: Vec<FileDescriptor>,
    },
    /// One file fully verified
    FileCompleted {
        /// The file's offered name
        name: String,
    },
    /// The whole transfer finished
    TransferComplete {
        /// Number of files moved
        files: usize,
        /// Total plaintext bytes moved
        bytes: u64,
    },
    /// Terminal failure; the session is gone
    Error {
        /// Human-readable description
        message: String,
    },
    /// The transport decision, for the status badge
    ConnectionTypeChanged {
        /// Direct or relay
        connection: ConnectionType,
    },
}
