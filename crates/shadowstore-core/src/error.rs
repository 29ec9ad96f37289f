//! Error types for shadowstore operations
//!
//! All store errors are represented by the StoreError enum, which carries
//! enough context (paths, offsets, expected/found values) to diagnose a
//! damaged store without a debugger.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Shadowstore error types with detailed context
#[derive(Debug, Clone)]
pub enum StoreError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Identity exceeds the configured maximum length
    IdentityTooLong {
        /// Byte length of the offending identity
        length: usize,
        /// Maximum allowed byte length
        max: usize,
    },

    /// Operation attempted on a closed component
    Closed {
        /// Which component was closed ("record store", "identity index", ...)
        component: &'static str,
    },

    /// The heap record at an indexed offset does not hold the expected identity
    InconsistentHeap {
        /// Byte offset of the record in the heap file
        offset: u64,
        /// Identity the index claimed lives at that offset
        expected: String,
        /// What was actually found there
        found: String,
    },

    /// The identity index file is missing or unreadable
    MalformedIndex {
        /// Path to the index file or directory
        path: PathBuf,
        /// Description of what was wrong
        reason: String,
    },

    /// The undo journal cannot be parsed
    JournalCorrupted {
        /// Path to the journal file
        path: PathBuf,
        /// Byte offset where parsing failed
        offset: u64,
        /// Description of the corruption
        reason: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            StoreError::IdentityTooLong { length, max } => {
                write!(f, "Identity too long: {} bytes, at most {} allowed", length, max)
            }

            StoreError::Closed { component } => {
                write!(f, "Operation on closed {}", component)
            }

            StoreError::InconsistentHeap { offset, expected, found } => {
                write!(f, "Inconsistent data heap at offset {}: expected identity {:?}, found {:?}",
                       offset, expected, found)
            }

            StoreError::MalformedIndex { path, reason } => {
                write!(f, "Malformed identity index at {}: {}", path.display(), reason)
            }

            StoreError::JournalCorrupted { path, offset, reason } => {
                write!(f, "Undo journal corrupted in {} at offset {}: {}",
                       path.display(), offset, reason)
            }
        }
    }
}

impl Error for StoreError {}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for shadowstore operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::InconsistentHeap {
            offset: 256,
            expected: "user/alice".to_string(),
            found: "user/bob".to_string(),
        };

        let display = format!("{}", err);
        assert!(display.contains("offset 256"));
        assert!(display.contains("user/alice"));
        assert!(display.contains("user/bob"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();

        match store_err {
            StoreError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_identity_too_long_display() {
        let err = StoreError::IdentityTooLong { length: 300, max: 128 };
        let display = format!("{}", err);
        assert!(display.contains("300"));
        assert!(display.contains("128"));
    }
}
