//! Offered-file metadata and receiver-side path sanitization.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Descriptor validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Empty or separator-bearing file name
    #[error("invalid file name: {0:?}")]
    BadName(String),
    /// Relative path is absolute, escapes the root, or carries bad bytes
    #[error("invalid relative path: {0:?}")]
    BadPath(String),
}

/// One offered file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File name without any directory part
    pub name: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// Path under the transfer root, only present for folder transfers
    pub relative_path: Option<String>,
}

impl FileDescriptor {
    /// Validate this descriptor before the receiver opens anything.
    ///
    /// Names must be plain (no separators, no NUL, no control characters).
    /// Relative paths must be normalized: not absolute, no `..`, no empty
    /// components, no control characters.
    ///
    /// # Errors
    ///
    /// [`DescriptorError`] naming the offending field.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.is_empty()
            || self.name.contains(['/', '\\'])
            || has_forbidden_chars(&self.name)
            || self.name == "."
            || self.name == ".."
        {
            return Err(DescriptorError::BadName(self.name.clone()));
        }

        if let Some(rel) = &self.relative_path {
            if rel.is_empty()
                || has_forbidden_chars(rel)
                || rel.contains('\\')
                || rel.starts_with('/')
            {
                return Err(DescriptorError::BadPath(rel.clone()));
            }

            // Wire paths are '/'-separated; every segment must be a plain
            // name. `.` and `..` alias or escape the save directory.
            for segment in rel.split('/') {
                if segment.is_empty() || segment == "." || segment == ".." {
                    return Err(DescriptorError::BadPath(rel.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Validate a whole offer.
///
/// A single bad descriptor fails the offer; nothing is written for any
/// file in that case.
///
/// # Errors
///
/// The first [`DescriptorError`] found, in offer order.
pub fn validate_offer(files: &[FileDescriptor]) -> Result<(), DescriptorError> {
    for file in files {
        file.validate()?;
    }
    Ok(())
}

fn has_forbidden_chars(s: &str) -> bool {
    s.chars().any(|c| c == '\0' || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(name: &str) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            size: 10,
            relative_path: None,
        }
    }

    fn nested(name: &str, rel: &str) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            size: 10,
            relative_path: Some(rel.into()),
        }
    }

    #[test]
    fn good_descriptors_pass() {
        assert!(plain("report.pdf").validate().is_ok());
        assert!(nested("a.txt", "docs/a.txt").validate().is_ok());
        assert!(nested("b.txt", "deep/tree/of/dirs/b.txt").validate().is_ok());
    }

    #[test]
    fn bad_names_rejected() {
        for name in ["", "dir/file", "dir\\file", ".", "..", "nul\0byte", "tab\tname"] {
            assert!(plain(name).validate().is_err(), "{name:?}");
        }
    }

    #[test]
    fn escaping_paths_rejected() {
        for rel in [
            "/etc/passwd",
            "../outside",
            "a/../../b",
            "a/./b",
            "",
            "a\\b",
            "a/\0/b",
        ] {
            assert!(nested("f", rel).validate().is_err(), "{rel:?}");
        }
    }

    #[test]
    fn one_bad_descriptor_fails_the_offer() {
        let files = vec![
            nested("ok.txt", "dir/ok.txt"),
            nested("evil.txt", "../evil.txt"),
            plain("fine.txt"),
        ];
        assert!(validate_offer(&files).is_err());
        assert!(validate_offer(&files[..1]).is_ok());
    }
}
