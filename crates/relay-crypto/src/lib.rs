//! # Relay Crypto
//!
//! Cryptographic primitives for the Relay file-transfer protocol:
//!
//! - **PAKE key agreement**: SPAKE2 over the transfer code, yielding the
//!   32-byte session key
//! - **Chunk AEAD**: AES-256-GCM with counter nonces for file chunks
//! - **Streaming hash**: incremental SHA-256 for file integrity and
//!   certificate fingerprints
//!
//! The rendezvous server never sees any of this material; everything here
//! runs end-to-end between the two peers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod error;
pub mod hash;
pub mod pake;

pub use cipher::{ChunkCipher, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use hash::{StreamingHash, fingerprint, hash_file};
pub use pake::{PakeExchange, PakeRole, SessionKey};

/// Size of the derived session key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the random per-session nonce prefix in bytes
pub const NONCE_PREFIX_SIZE: usize = 4;
