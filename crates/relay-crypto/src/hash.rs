//! Incremental SHA-256 for file integrity and certificate fingerprints.

use sha2::{Digest, Sha256};

/// Streaming SHA-256 over the plaintext of one file.
///
/// The sender finalizes when the last chunk is emitted; the receiver
/// recomputes over decrypted chunks and compares digests.
#[derive(Default)]
pub struct StreamingHash {
    hasher: Sha256,
}

impl StreamingHash {
    /// Create a fresh hash state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of plaintext.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and return the digest.
    #[must_use]
    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

/// Hash a whole in-memory buffer.
#[must_use]
pub fn hash_file(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 fingerprint of a DER-encoded certificate.
#[must_use]
pub fn fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_one_shot() {
        let data = vec![0x5Au8; 300_000];

        let mut streaming = StreamingHash::new();
        for chunk in data.chunks(65536) {
            streaming.update(chunk);
        }

        assert_eq!(streaming.finalize(), hash_file(&data));
    }

    #[test]
    fn empty_input_yields_empty_digest() {
        // SHA-256 of the empty string
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(StreamingHash::new().finalize().as_slice(), &expected[..]);
        assert_eq!(hash_file(&[]).as_slice(), &expected[..]);
    }

    #[test]
    fn fingerprint_is_stable() {
        let der = b"not really a certificate";
        assert_eq!(fingerprint(der), fingerprint(der));
        assert_ne!(fingerprint(der), fingerprint(b"another certificate"));
    }
}
