//! SPAKE2 key agreement over the transfer code.
//!
//! Both peers feed the same transfer code into a symmetric two-message
//! SPAKE2 run and derive the 32-byte session key. The identity strings are
//! pinned per role so a sender can only pair with a receiver. A run where
//! the two sides used different codes completes without error but yields
//! two different keys; the mismatch surfaces as an AEAD failure on the
//! first encrypted exchange.

use spake2::{Ed25519Group, Identity, Password, Spake2};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, KEY_SIZE};

/// Identity string for the sending side
const SENDER_IDENTITY: &[u8] = b"relay-sender";

/// Identity string for the receiving side
const RECEIVER_IDENTITY: &[u8] = b"relay-receiver";

/// Which side of the exchange this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeRole {
    /// The peer offering files
    Sender,
    /// The peer receiving files
    Receiver,
}

/// The derived 32-byte session key.
///
/// Wiped from memory when dropped; never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Borrow the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material
        write!(f, "SessionKey(..)")
    }
}

/// An in-progress SPAKE2 exchange.
///
/// `start` produces the outbound message to forward through signaling;
/// `finish` consumes the peer's message and yields the session key.
pub struct PakeExchange {
    state: Spake2<Ed25519Group>,
}

impl PakeExchange {
    /// Begin an exchange for the given role and transfer code.
    ///
    /// Returns the exchange state and the outbound PAKE message.
    #[must_use]
    pub fn start(role: PakeRole, code: &str) -> (Self, Vec<u8>) {
        let password = Password::new(code.as_bytes());
        let sender = Identity::new(SENDER_IDENTITY);
        let receiver = Identity::new(RECEIVER_IDENTITY);

        let (state, outbound) = match role {
            PakeRole::Sender => Spake2::<Ed25519Group>::start_a(&password, &sender, &receiver),
            PakeRole::Receiver => Spake2::<Ed25519Group>::start_b(&password, &sender, &receiver),
        };

        (Self { state }, outbound)
    }

    /// Complete the exchange with the peer's PAKE message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Pake`] if the peer's message is malformed.
    /// A wrong code is NOT an error here; it produces a divergent key.
    pub fn finish(self, peer_message: &[u8]) -> Result<SessionKey, CryptoError> {
        let raw = self.state.finish(peer_message).map_err(|_| CryptoError::Pake)?;

        let mut key = [0u8; KEY_SIZE];
        if raw.len() != KEY_SIZE {
            return Err(CryptoError::Pake);
        }
        key.copy_from_slice(&raw);
        Ok(SessionKey(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_exchange(sender_code: &str, receiver_code: &str) -> (SessionKey, SessionKey) {
        let (sender, sender_msg) = PakeExchange::start(PakeRole::Sender, sender_code);
        let (receiver, receiver_msg) = PakeExchange::start(PakeRole::Receiver, receiver_code);

        let sender_key = sender.finish(&receiver_msg).unwrap();
        let receiver_key = receiver.finish(&sender_msg).unwrap();
        (sender_key, receiver_key)
    }

    #[test]
    fn same_code_agrees() {
        let (a, b) = run_exchange("7-guitar-palace", "7-guitar-palace");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_codes_diverge() {
        let (a, b) = run_exchange("7-guitar-palace", "7-guitar-castle");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn exchange_messages_differ_per_run() {
        let (_, msg1) = PakeExchange::start(PakeRole::Sender, "3-apple-river");
        let (_, msg2) = PakeExchange::start(PakeRole::Sender, "3-apple-river");
        assert_ne!(msg1, msg2);
    }

    #[test]
    fn garbage_peer_message_fails() {
        let (sender, _) = PakeExchange::start(PakeRole::Sender, "3-apple-river");
        assert!(sender.finish(b"not a spake2 message").is_err());
    }
}
