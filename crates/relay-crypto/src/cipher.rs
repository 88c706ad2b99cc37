//! AES-256-GCM chunk encryption with counter nonces.
//!
//! Each side of a session seals its chunks under the shared session key
//! with a 12-byte nonce laid out as a 4-byte random session prefix followed
//! by an 8-byte big-endian counter. Prefixes are drawn independently per
//! side, so the two directions never collide; the receiver does not inspect
//! the prefix beyond feeding the nonce to decryption.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::{CryptoError, KEY_SIZE, NONCE_PREFIX_SIZE, SessionKey};

/// AEAD nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AEAD authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Sealing and opening of session payloads.
pub struct ChunkCipher {
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u64,
}

impl ChunkCipher {
    /// Create a cipher for the session key with a fresh random nonce prefix.
    #[must_use]
    pub fn new(key: &SessionKey) -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng.fill_bytes(&mut prefix);
        Self::with_prefix(key, prefix)
    }

    /// Create a cipher with an explicit nonce prefix.
    #[must_use]
    pub fn with_prefix(key: &SessionKey, prefix: [u8; NONCE_PREFIX_SIZE]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
            prefix,
            counter: 0,
        }
    }

    /// Seal one chunk, advancing the counter.
    ///
    /// Returns the nonce used and the ciphertext (plaintext length plus the
    /// 16-byte tag).
    ///
    /// # Errors
    ///
    /// [`CryptoError::NonceExhausted`] once the 64-bit counter runs out;
    /// [`CryptoError::Encrypt`] on cipher failure.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        let nonce = self.next_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok((nonce, ciphertext))
    }

    /// Open one chunk with the nonce carried alongside it.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Decrypt`] on authentication failure. This is fatal to
    /// the session: it means tampering or a code mismatch.
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Seal a small payload under a fresh random nonce.
    ///
    /// Used for the certificate-fingerprint exchange during signaling,
    /// where no counter sequence exists yet.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Encrypt`] on cipher failure.
    pub fn seal_detached(
        key: &SessionKey,
        plaintext: &[u8],
    ) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok((nonce, ciphertext))
    }

    /// Open a payload sealed with [`ChunkCipher::seal_detached`].
    ///
    /// # Errors
    ///
    /// [`CryptoError::Decrypt`] on authentication failure; with a wrong
    /// transfer code this is where the mismatch is detected.
    pub fn open_detached(
        key: &SessionKey,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// The session nonce prefix.
    #[must_use]
    pub fn prefix(&self) -> [u8; NONCE_PREFIX_SIZE] {
        self.prefix
    }

    /// Number of chunks sealed so far.
    #[must_use]
    pub fn sealed_count(&self) -> u64 {
        self.counter
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        let count = self.counter;
        self.counter = self.counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.prefix);
        nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&count.to_be_bytes());
        Ok(nonce)
    }
}
