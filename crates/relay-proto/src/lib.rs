//! # Relay Protocol
//!
//! The two wire surfaces of Relay and the data they carry:
//!
//! - **Peer protocol**: the length-prefixed, bincode-tagged messages the two
//!   endpoints exchange over whichever transport wins (direct QUIC or the
//!   server relay)
//! - **Signaling protocol**: the JSON text frames spoken with the
//!   rendezvous server during pairing
//! - **Transfer codes**: the `D-word1-word2` tokens that name a session and
//!   seed the PAKE
//! - **File descriptors**: offered file metadata with receiver-side path
//!   sanitization

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod code;
pub mod descriptor;
pub mod message;
pub mod signal;

pub use code::TransferCode;
pub use descriptor::{DescriptorError, FileDescriptor, validate_offer};
pub use message::{CodecError, PeerMessage};
pub use signal::{PeerAddr, PeerInfo, Role, SignalError, SignalMessage};

/// Plaintext bytes per file chunk
pub const CHUNK_SIZE: usize = 262_144;

/// Upper bound on one encoded peer frame (chunk + AEAD tag + envelope)
pub const MAX_FRAME_SIZE: usize = CHUNK_SIZE + 1024;
