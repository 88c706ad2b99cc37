//! Error types for Relay cryptographic operations.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The SPAKE2 exchange could not be completed
    #[error("key agreement failed")]
    Pake,

    /// AEAD encryption failed
    #[error("encryption failed")]
    Encrypt,

    /// AEAD decryption or authentication failed
    #[error("decryption failed")]
    Decrypt,

    /// The per-session chunk counter ran out
    #[error("nonce counter exhausted")]
    NonceExhausted,
}
