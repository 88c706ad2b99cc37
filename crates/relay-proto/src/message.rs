//! Peer message codec.
//!
//! Every message is sent as a 4-byte big-endian length prefix followed by
//! the bincode-serialized body. Over QUIC the frames share one
//! bidirectional stream; over the relay each frame is one binary WebSocket
//! message (the prefix is then redundant but retained so both transports
//! use the same codec).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::MAX_FRAME_SIZE;
use crate::descriptor::FileDescriptor;

/// Length-prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame shorter than its declared or minimum length
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the frame claimed to contain
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Declared length exceeds the protocol bound
    #[error("frame length {0} exceeds maximum {MAX_FRAME_SIZE}")]
    Oversized(usize),

    /// Body failed to serialize or deserialize
    #[error("malformed frame body: {0}")]
    Body(String),
}

/// Messages exchanged between the two peers once a transport is up.
///
/// Chunk ciphertext is opaque to everything below the orchestrator; the
/// relay server forwards these frames without parsing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Sender lists every file in the transfer
    FileOffer {
        /// Sender's session id, echoed in progress events
        session_id: Uuid,
        /// Offered files in transmission order
        files: Vec<FileDescriptor>,
    },
    /// Receiver accepts the whole offer
    FileAccept,
    /// Receiver declines the whole offer
    FileDecline,
    /// One encrypted chunk of one file
    FileChunk {
        /// Index into the offered file list
        file_index: u16,
        /// Position of this chunk within the file
        chunk_index: u32,
        /// AEAD nonce: 4-byte session prefix then 8-byte counter
        nonce: [u8; 12],
        /// AES-256-GCM ciphertext (plaintext length + 16-byte tag)
        ciphertext: Vec<u8>,
    },
    /// Sender finished a file and transmits its digest
    FileComplete {
        /// Index of the finished file
        file_index: u16,
        /// SHA-256 over the file plaintext
        sha256: [u8; 32],
    },
    /// Receiver confirms the digest matched
    FileVerified {
        /// Index of the verified file
        file_index: u16,
    },
    /// Sender signals the whole transfer finished
    TransferComplete,
    /// Either side aborts the session
    Cancel {
        /// Human-readable reason, e.g. "user" or "network"
        reason: String,
    },
    /// Keepalive probe; may interleave with anything
    Ping,
    /// Keepalive response
    Pong,
}

impl PeerMessage {
    /// Encode into a length-prefixed frame.
    ///
    /// # Errors
    ///
    /// [`CodecError::Body`] if serialization fails (practically
    /// unreachable for these types), [`CodecError::Oversized`] if the body
    /// exceeds the frame bound.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = bincode::serialize(self).map_err(|e| CodecError::Body(e.to_string()))?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(CodecError::Oversized(body.len()));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a full length-prefixed frame.
    ///
    /// # Errors
    ///
    /// [`CodecError::Truncated`] if the buffer is shorter than the prefix
    /// or the declared body, [`CodecError::Oversized`] for absurd lengths,
    /// [`CodecError::Body`] for an unknown tag or malformed body.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < LENGTH_PREFIX_SIZE {
            return Err(CodecError::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                actual: frame.len(),
            });
        }

        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared > MAX_FRAME_SIZE {
            return Err(CodecError::Oversized(declared));
        }

        let body = &frame[LENGTH_PREFIX_SIZE..];
        if body.len() != declared {
            return Err(CodecError::Truncated {
                expected: declared,
                actual: body.len(),
            });
        }

        Self::decode_body(body)
    }

    /// Decode a frame body without its length prefix.
    ///
    /// # Errors
    ///
    /// [`CodecError::Body`] for an unknown tag or malformed body.
    pub fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(body).map_err(|e| CodecError::Body(e.to_string()))
    }
}
