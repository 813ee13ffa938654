//! Error types for the dgit-store engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// All errors that can occur while staging, committing or restoring
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A staged file, commit, or cache artifact does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// A cache artifact exists but failed to decode
    #[error("Corrupt artifact {key}: {reason}")]
    Corrupt {
        /// Artifact key or file name
        key: String,
        /// Decoder error
        reason: String,
    },
    /// File extension is not one of the supported design formats
    #[error("Not a design file: {} (supported: .ai, .psd, .sketch, .fig, .xd, .blend, ...)", .0.display())]
    NotDesignFile(PathBuf),
    /// Unstage requested for a path that is not in the staging area
    #[error("File not in staging area: {}", .0.display())]
    NotStaged(PathBuf),
    /// Commit requested with an empty staging area
    #[error("No files staged for commit")]
    NothingStaged,
    /// Candidate delta did not beat the ratio threshold
    #[error("Strategy {strategy} rejected: ratio {ratio:.3} above threshold {threshold:.3}")]
    StrategyRejected {
        /// Strategy name
        strategy: &'static str,
        /// Achieved compressed/original ratio
        ratio: f64,
        /// Configured maximum ratio
        threshold: f64,
    },
    /// A delta link required for reconstruction is missing
    #[error("Delta chain broken restoring v{version}: missing link for v{missing}")]
    ChainBroken {
        /// Version being restored
        version: u64,
        /// Version whose artifact could not be found
        missing: u64,
    },
    /// Version reference could not be parsed
    #[error("Invalid commit reference: {0}")]
    InvalidReference(String),
    /// Stage pattern is not a valid glob, or lies outside the working tree
    #[error("Invalid pathspec: {0}")]
    InvalidPattern(String),
    /// Hash prefix matches more than one commit
    #[error("Ambiguous commit reference {prefix}: matches {candidates:?}")]
    AmbiguousReference {
        /// Requested prefix
        prefix: String,
        /// Matching hashes
        candidates: Vec<String>,
    },
    /// Repository configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Record or manifest (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Compression codec failure on the write side
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for StoreError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => StoreError::Io(io),
            other => StoreError::Corrupt {
                key: "legacy archive".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Coarse error classification carried in restore reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing file or artifact
    NotFound,
    /// Undecodable artifact
    Corrupt,
    /// Disk read/write failure
    Io,
    /// Broken delta chain
    ChainBroken,
    /// Anything else
    Other,
}

impl StoreError {
    /// Classify this error for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) | StoreError::NotStaged(_) => ErrorKind::NotFound,
            StoreError::Corrupt { .. } => ErrorKind::Corrupt,
            StoreError::Io(_) => ErrorKind::Io,
            StoreError::ChainBroken { .. } => ErrorKind::ChainBroken,
            _ => ErrorKind::Other,
        }
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_broken_names_missing_link() {
        let err = StoreError::ChainBroken {
            version: 7,
            missing: 5,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("v7"));
        assert!(msg.contains("v5"));
        assert_eq!(err.kind(), ErrorKind::ChainBroken);
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = std_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_corrupt_kind() {
        let err = StoreError::corrupt("v3.lz4", "bad frame");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(format!("{}", err).contains("v3.lz4"));
    }

    #[test]
    fn test_not_design_file_message() {
        let err = StoreError::NotDesignFile(PathBuf::from("notes.txt"));
        assert!(format!("{}", err).contains("notes.txt"));
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ChainBroken).unwrap();
        assert_eq!(json, "\"chain_broken\"");
    }
}
