//! Transfer codes: `D-word1-word2`.
//!
//! One decimal digit and two words from a fixed 256-entry list. The code
//! names the pending session on the rendezvous server and is the PAKE
//! password. The word list ships with the binary; both endpoints carry
//! identical copies.

use std::collections::HashSet;
use std::sync::LazyLock;

use rand::Rng;
use thiserror::Error;

/// The canonical word list, one word per line.
const WORDLIST_RAW: &str = include_str!("wordlist.txt");

/// Number of entries in the word list
pub const WORDLIST_LEN: usize = 256;

static WORDS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| WORDLIST_RAW.lines().filter(|l| !l.is_empty()).collect());

static WORD_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| WORDS.iter().copied().collect());

/// Transfer-code errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    /// Not of the shape `D-word1-word2`
    #[error("malformed transfer code")]
    Malformed,
    /// A word is not in the shipped list
    #[error("unknown code word: {0}")]
    UnknownWord(String),
}

/// A validated transfer code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferCode(String);

impl TransferCode {
    /// Generate a fresh random code.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let digit = rng.gen_range(0..10u8);
        let first = WORDS[rng.gen_range(0..WORDS.len())];
        let second = WORDS[rng.gen_range(0..WORDS.len())];
        Self(format!("{digit}-{first}-{second}"))
    }

    /// Parse and validate a code typed or pasted by a user.
    ///
    /// # Errors
    ///
    /// [`CodeError::Malformed`] for a wrong shape,
    /// [`CodeError::UnknownWord`] when a word is not in the list.
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let trimmed = input.trim();
        let mut parts = trimmed.splitn(3, '-');

        let digit = parts.next().ok_or(CodeError::Malformed)?;
        if digit.len() != 1 || !digit.chars().all(|c| c.is_ascii_digit()) {
            return Err(CodeError::Malformed);
        }

        for _ in 0..2 {
            let word = parts.next().ok_or(CodeError::Malformed)?;
            if word.is_empty() {
                return Err(CodeError::Malformed);
            }
            if !WORD_SET.contains(word) {
                return Err(CodeError::UnknownWord(word.to_string()));
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    /// The code as it appears on the wire and in the PAKE.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransferCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wordlist_integrity() {
        assert_eq!(WORDS.len(), WORDLIST_LEN);

        let unique: HashSet<_> = WORDS.iter().collect();
        assert_eq!(unique.len(), WORDLIST_LEN);

        for word in WORDS.iter() {
            assert!(!word.is_empty());
            assert!(
                word.chars().all(|c| c.is_ascii_lowercase()),
                "word {word:?} is not lowercase ascii"
            );
        }
    }

    #[test]
    fn generated_codes_parse() {
        for _ in 0..100 {
            let code = TransferCode::generate();
            let parsed = TransferCode::parse(code.as_str()).unwrap();
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn known_shapes() {
        assert!(TransferCode::parse("7-guitar-palace").is_ok());
        assert!(TransferCode::parse("3-apple-river").is_ok());
        assert!(TransferCode::parse("  0-acorn-zebra ").is_ok());
    }

    #[test]
    fn malformed_codes_rejected() {
        for bad in [
            "",
            "guitar-palace",
            "77-guitar-palace",
            "x-guitar-palace",
            "7-guitar",
            "7--palace",
        ] {
            assert_eq!(TransferCode::parse(bad), Err(CodeError::Malformed), "{bad}");
        }
    }

    #[test]
    fn unknown_words_rejected() {
        assert!(matches!(
            TransferCode::parse("7-guitar-xylophone"),
            Err(CodeError::UnknownWord(w)) if w == "xylophone"
        ));
    }
}
