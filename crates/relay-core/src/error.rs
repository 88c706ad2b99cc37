//! Error types for the transfer orchestrator.
//!
//! Every task failure is converted to one of these kinds and surfaced as a
//! terminal `Error` progress event; the orchestrator never panics on I/O.

use thiserror::Error;

use relay_transport::TransportError;

/// Terminal transfer errors, by kind.
#[derive(Debug, Error)]
pub enum TransferError {
    /// PAKE, AEAD or digest failure; usually a wrong transfer code
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Dial, socket or timeout failure
    #[error("network failure: {0}")]
    Network(String),

    /// Frame decode failure, out-of-order chunk, unexpected message
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// File open/read/write failure, checksum mismatch, path rejection
    #[error("transfer failure: {0}")]
    Transfer(String),

    /// Rendezvous-side failure: code in use, server unreachable, peer gone
    #[error("signaling failure: {0}")]
    Signaling(String),

    /// The session was cancelled, locally or by the peer
    #[error("transfer cancelled")]
    Cancelled,

    /// The peer declined the offer
    #[error("peer declined the transfer")]
    PeerRejected,
}

impl From<relay_crypto::CryptoError> for TransferError {
    fn from(e: relay_crypto::CryptoError) -> Self {
        Self::Crypto(e.to_string())
    }
}

impl From<relay_proto::CodecError> for TransferError {
    fn from(e: relay_proto::CodecError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Codec(inner) => Self::Protocol(inner.to_string()),
            TransportError::Signaling(msg) => Self::Signaling(msg),
            TransportError::WebSocket(msg) => Self::Signaling(msg),
            other => Self::Network(other.to_string()),
        }
    }
}
