//! Signaling wire protocol.
//!
//! JSON text frames on the rendezvous WebSocket. After `relay_active` and
//! both `relay_ready` acknowledgements the connection switches to binary
//! frames carrying peer-protocol bytes as-is; nothing here applies past
//! that point.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which slot a peer occupies in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Offers files
    Sender,
    /// Receives files
    Receiver,
}

impl Role {
    /// The opposite slot.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sender => write!(f, "sender"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

/// Network info a peer declares at registration.
///
/// `local_port` is the peer's QUIC port; the server substitutes it for the
/// useless WebSocket ephemeral port when announcing the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Address on the peer's own network
    pub local_ip: IpAddr,
    /// The peer's QUIC listening port
    pub local_port: u16,
}

/// Full addressing info announced to the counterpart peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Address observed by the server on the signaling connection
    pub public_ip: IpAddr,
    /// The peer's declared QUIC port
    pub public_port: u16,
    /// Address on the peer's own network
    pub local_ip: IpAddr,
    /// The peer's QUIC listening port
    pub local_port: u16,
}

/// Error codes the server may return while in signaling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalError {
    /// The code's slot is occupied, or the session cap is reached
    CodeInUse,
    /// First frame was not a valid `register`
    InvalidMessage,
    /// Message type not forwardable in the current phase
    UnknownType,
}

/// One signaling frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Client's first frame: claim a slot under the code
    Register {
        /// Requested slot
        role: Role,
        /// Declared network info (optional; absent peers cannot be dialed)
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_info: Option<PeerInfo>,
    },
    /// Server: the other slot filled; here is how to reach it
    PeerJoined {
        /// The counterpart's addressing info, public fields rewritten
        peer_info: PeerAddr,
    },
    /// PAKE message, forwarded verbatim (base64 payload)
    Spake2 {
        /// Opaque PAKE bytes
        payload: String,
    },
    /// AEAD-wrapped certificate fingerprint, forwarded verbatim
    CertFingerprint {
        /// base64(nonce || ciphertext)
        payload: String,
    },
    /// Client asks to enter relay mode
    RelayRequest,
    /// Server: both peers asked; relay mode begins
    RelayActive,
    /// Client: its framing layer is drained and ready for binary
    RelayReady,
    /// Server: the counterpart's connection is gone
    PeerDisconnected {
        /// Explanation for logs and UI
        message: String,
    },
    /// Server: a signaling-phase error
    Error {
        /// Machine-readable code
        code: SignalError,
        /// Human-readable detail
        message: String,
    },
    /// Client: leaving the session deliberately
    Disconnect,
}

impl SignalMessage {
    /// Serialize to the JSON text carried in one WebSocket frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        // The enum has no map keys that can fail to serialize
        serde_json::to_string(self).expect("signal message serializes")
    }

    /// Parse one WebSocket text frame.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error for malformed or unknown frames.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
