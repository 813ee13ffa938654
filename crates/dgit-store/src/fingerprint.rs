//! Content fingerprinting: BLAKE3 partial-content cache keys and SHA-256 commit hashes

use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Default number of leading bytes sampled for a fingerprint.
pub const DEFAULT_SAMPLE_BYTES: usize = 64 * 1024;

/// Length of the external commit reference.
pub const COMMIT_HASH_LEN: usize = 12;

/// A 32-byte BLAKE3 digest of a file's size, mtime and leading bytes.
/// This is a cache key, not an integrity hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Return the fingerprint as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Size and modification time captured when a file is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    /// Length in bytes
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

impl FileStamp {
    /// Read size and mtime from the filesystem.
    pub fn of(path: &Path) -> StoreResult<Self> {
        let meta = std::fs::metadata(path)?;
        let modified = meta.modified()?;
        Ok(Self {
            size: meta.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }
}

/// Fingerprint a stamp plus an in-memory content sample.
pub fn fingerprint_sample(stamp: &FileStamp, sample: &[u8]) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&stamp.size.to_le_bytes());
    hasher.update(&stamp.modified.timestamp().to_le_bytes());
    hasher.update(&stamp.modified.timestamp_subsec_nanos().to_le_bytes());
    hasher.update(sample);
    Fingerprint(*hasher.finalize().as_bytes())
}

/// Fingerprint a file on disk, reading at most `sample_bytes` of content.
pub fn fingerprint_file(path: &Path, sample_bytes: usize) -> StoreResult<(Fingerprint, FileStamp)> {
    let stamp = FileStamp::of(path)?;
    let mut sample = Vec::with_capacity(sample_bytes.min(stamp.size as usize));
    File::open(path)?
        .take(sample_bytes as u64)
        .read_to_end(&mut sample)?;
    Ok((fingerprint_sample(&stamp, &sample), stamp))
}

/// Content hash of a commit: SHA-256 over the message, the version and each
/// file's path, size and mtime, truncated to 12 hex characters.
/// Callers pass files in a stable order.
pub fn commit_hash<'a, I>(message: &str, version: u64, files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a FileStamp)>,
{
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.update(version.to_string().as_bytes());
    for (path, stamp) in files {
        hasher.update(path.as_bytes());
        hasher.update(stamp.size.to_string().as_bytes());
        hasher.update(stamp.modified.timestamp().to_string().as_bytes());
    }
    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(COMMIT_HASH_LEN);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::io::Write;

    fn stamp(size: u64, secs: i64) -> FileStamp {
        FileStamp {
            size,
            modified: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let s = stamp(11, 1_700_000_000);
        assert_eq!(
            fingerprint_sample(&s, b"hello world"),
            fingerprint_sample(&s, b"hello world")
        );
    }

    #[test]
    fn mtime_changes_fingerprint() {
        let a = fingerprint_sample(&stamp(5, 1), b"hello");
        let b = fingerprint_sample(&stamp(5, 2), b"hello");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_file_samples_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.psd");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![7u8; 200]).unwrap();
        drop(f);

        let (fp, st) = fingerprint_file(&path, 16).unwrap();
        assert_eq!(st.size, 200);
        assert_eq!(fp, fingerprint_sample(&st, &[7u8; 16]));
        assert_eq!(fp.to_hex().len(), 64);
    }

    #[test]
    fn fingerprint_missing_file_is_io() {
        let err = fingerprint_file(Path::new("/nonexistent/a.ai"), 16).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn commit_hash_is_twelve_hex() {
        let s = stamp(10_240, 1_700_000_000);
        let h = commit_hash("init", 1, [("a.ai", &s)]);
        assert_eq!(h.len(), COMMIT_HASH_LEN);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn commit_hash_depends_on_version() {
        let s = stamp(10, 0);
        assert_ne!(
            commit_hash("same", 1, [("a.ai", &s)]),
            commit_hash("same", 2, [("a.ai", &s)])
        );
    }

    proptest! {
        #[test]
        fn prop_commit_hash_stable(msg in ".{0,40}", version in 1u64..10_000) {
            let s = stamp(1, 0);
            prop_assert_eq!(
                commit_hash(&msg, version, [("x.fig", &s)]),
                commit_hash(&msg, version, [("x.fig", &s)])
            );
        }
    }
}
