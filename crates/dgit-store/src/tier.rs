//! Three-tier artifact cache under `.dgit/cache/{hot,warm,cold}`.
//!
//! Each tier is bound to exactly one codec: hot holds segmented LZ4
//! containers, warm Zstd at a balanced level, cold Zstd at the archive level.
//! All writes go to a temporary file in the target directory and are renamed
//! into place.

use crate::compression::{self, Codec, SegmentWriter};
use crate::config::TierConfig;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Cache tier, ordered fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// LZ4, small and recently committed artifacts
    Hot,
    /// Zstd balanced
    Warm,
    /// Zstd archive
    Cold,
}

impl Tier {
    /// All tiers, fastest first.
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Next slower tier, or `None` for cold.
    pub fn demote(self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }

    /// Directory name under `cache/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Tier::Hot => "lz4",
            Tier::Warm => "zstd",
            Tier::Cold => "archive.zstd",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Name of an artifact within a tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactKey {
    /// Full snapshot of a committed version
    Version(u64),
    /// Staging pre-compression, keyed by content fingerprint
    Fingerprint(String),
}

impl ArtifactKey {
    fn stem(&self) -> String {
        match self {
            ArtifactKey::Version(v) => format!("v{}", v),
            ArtifactKey::Fingerprint(fp) => fp.clone(),
        }
    }
}

/// Location of a written artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Tier holding the artifact
    pub tier: Tier,
    /// File name within the tier directory
    pub file_name: String,
    /// Encoded size on disk
    pub size: u64,
}

/// Disk usage of one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUsage {
    /// Number of artifacts
    pub files: u64,
    /// Total encoded bytes
    pub bytes: u64,
}

/// Write `bytes` to `path` through a temporary sibling file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Codec-aware store over the three cache tier directories.
#[derive(Debug, Clone)]
pub struct TierStore {
    cache_dir: PathBuf,
    warm_level: i32,
    cold_level: i32,
}

impl TierStore {
    /// Create a store rooted at `cache_dir` (usually `.dgit/cache`).
    pub fn new(cache_dir: impl Into<PathBuf>, levels: &TierConfig) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            warm_level: levels.warm_level,
            cold_level: levels.cold_level,
        }
    }

    /// Create the tier directories.
    pub fn init(&self) -> StoreResult<()> {
        for tier in Tier::ALL {
            std::fs::create_dir_all(self.cache_dir.join(tier.dir_name()))?;
        }
        Ok(())
    }

    /// Codec bound to a tier.
    pub fn codec(&self, tier: Tier) -> Codec {
        match tier {
            Tier::Hot => Codec::Lz4,
            Tier::Warm => Codec::Zstd {
                level: self.warm_level,
            },
            Tier::Cold => Codec::Zstd {
                level: self.cold_level,
            },
        }
    }

    /// File name of an artifact, e.g. `v3.lz4` or `v3.archive.zstd`.
    pub fn file_name(tier: Tier, key: &ArtifactKey) -> String {
        format!("{}.{}", key.stem(), tier.extension())
    }

    /// Absolute path of an artifact.
    pub fn path(&self, tier: Tier, key: &ArtifactKey) -> PathBuf {
        self.cache_dir
            .join(tier.dir_name())
            .join(Self::file_name(tier, key))
    }

    /// Encode `bytes` with the tier's codec and store them under `key`.
    pub fn put(&self, tier: Tier, key: &ArtifactKey, bytes: &[u8]) -> StoreResult<ArtifactRef> {
        let encoded = compression::compress(bytes, self.codec(tier))?;
        let path = self.path(tier, key);
        write_atomic(&path, &encoded)?;
        debug!(%tier, file = %Self::file_name(tier, key), raw = bytes.len(), encoded = encoded.len(), "Stored artifact");
        Ok(ArtifactRef {
            tier,
            file_name: Self::file_name(tier, key),
            size: encoded.len() as u64,
        })
    }

    /// Stream a hot-tier container segment by segment.
    ///
    /// `fill` appends segments (fresh reads or spliced pre-encoded frames);
    /// the container is only renamed into place once `fill` succeeds.
    pub fn put_segments<F>(&self, key: &ArtifactKey, fill: F) -> StoreResult<ArtifactRef>
    where
        F: FnOnce(&mut SegmentWriter<BufWriter<File>>) -> StoreResult<()>,
    {
        let path = self.path(Tier::Hot, key);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        let mut writer = SegmentWriter::new(BufWriter::new(tmp.reopen()?))?;
        fill(&mut writer)?;
        let (buffered, totals) = writer.finish()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(
            file = %Self::file_name(Tier::Hot, key),
            segments = totals.segments,
            raw = totals.raw_bytes,
            encoded = totals.encoded_bytes,
            "Stored segmented artifact"
        );
        Ok(ArtifactRef {
            tier: Tier::Hot,
            file_name: Self::file_name(Tier::Hot, key),
            size: totals.encoded_bytes,
        })
    }

    /// Read and decode an artifact.
    ///
    /// Returns `NotFound` when the file is absent and `Corrupt` when it does
    /// not decode, so callers can fall through to another tier.
    pub fn get(&self, tier: Tier, key: &ArtifactKey) -> StoreResult<Vec<u8>> {
        let encoded = self.get_encoded(tier, key)?;
        let name = Self::file_name(tier, key);
        let decoded = compression::decompress(&encoded, self.codec(tier), &name)?;
        debug!(%tier, file = %name, bytes = decoded.len(), "Cache hit");
        Ok(decoded)
    }

    /// Read an artifact without decoding it.
    pub fn get_encoded(&self, tier: Tier, key: &ArtifactKey) -> StoreResult<Vec<u8>> {
        let path = self.path(tier, key);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%tier, file = %Self::file_name(tier, key), "Cache miss");
                return Err(StoreError::NotFound(format!(
                    "{}/{}",
                    tier,
                    Self::file_name(tier, key)
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let mut encoded = Vec::new();
        file.read_to_end(&mut encoded)?;
        Ok(encoded)
    }

    /// True if the artifact file exists (it may still be corrupt).
    pub fn exists(&self, tier: Tier, key: &ArtifactKey) -> bool {
        self.path(tier, key).is_file()
    }

    /// Delete an artifact. Returns whether a file was removed.
    pub fn remove(&self, tier: Tier, key: &ArtifactKey) -> StoreResult<bool> {
        match std::fs::remove_file(self.path(tier, key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Files and bytes currently held by each tier.
    pub fn usage(&self) -> StoreResult<Vec<(Tier, TierUsage)>> {
        let mut out = Vec::with_capacity(3);
        for tier in Tier::ALL {
            let mut usage = TierUsage::default();
            let dir = self.cache_dir.join(tier.dir_name());
            if dir.is_dir() {
                for entry in std::fs::read_dir(&dir)? {
                    let meta = entry?.metadata()?;
                    if meta.is_file() {
                        usage.files += 1;
                        usage.bytes += meta.len();
                    }
                }
            }
            out.push((tier, usage));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TierStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TierStore::new(dir.path().join("cache"), &TierConfig::default());
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn file_names_follow_layout() {
        let v = ArtifactKey::Version(3);
        assert_eq!(TierStore::file_name(Tier::Hot, &v), "v3.lz4");
        assert_eq!(TierStore::file_name(Tier::Warm, &v), "v3.zstd");
        assert_eq!(TierStore::file_name(Tier::Cold, &v), "v3.archive.zstd");
        let fp = ArtifactKey::Fingerprint("abcd".to_string());
        assert_eq!(TierStore::file_name(Tier::Hot, &fp), "abcd.lz4");
    }

    #[test]
    fn put_get_every_tier() {
        let (_dir, store) = store();
        let data = b"layered design bytes ".repeat(100);
        for tier in Tier::ALL {
            let key = ArtifactKey::Version(1);
            let r = store.put(tier, &key, &data).unwrap();
            assert_eq!(r.tier, tier);
            assert!(store.exists(tier, &key));
            assert_eq!(store.get(tier, &key).unwrap(), data);
        }
    }

    #[test]
    fn missing_is_not_found_and_garbage_is_corrupt() {
        let (_dir, store) = store();
        let key = ArtifactKey::Version(9);
        assert!(matches!(
            store.get(Tier::Warm, &key).unwrap_err(),
            StoreError::NotFound(_)
        ));

        std::fs::write(store.path(Tier::Warm, &key), b"not zstd at all").unwrap();
        assert!(matches!(
            store.get(Tier::Warm, &key).unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn put_segments_streams_and_splices() {
        let (_dir, store) = store();
        let staged = compression::compress(b"precompressed", Codec::Lz4).unwrap();
        let frames = compression::segment_frames(&staged, "fp").unwrap();
        store
            .put_segments(&ArtifactKey::Version(2), |w| {
                w.append_bytes(b"fresh|")?;
                w.append_encoded(frames[0].frame, frames[0].raw_len)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            store.get(Tier::Hot, &ArtifactKey::Version(2)).unwrap(),
            b"fresh|precompressed"
        );
    }

    #[test]
    fn failed_fill_leaves_nothing_behind() {
        let (_dir, store) = store();
        let key = ArtifactKey::Version(4);
        let res = store.put_segments(&key, |_| Err(StoreError::NothingStaged));
        assert!(res.is_err());
        assert!(!store.exists(Tier::Hot, &key));
        assert_eq!(store.usage().unwrap()[0].1.files, 0);
    }

    #[test]
    fn remove_and_usage() {
        let (_dir, store) = store();
        let key = ArtifactKey::Version(1);
        store.put(Tier::Hot, &key, b"abc").unwrap();
        store.put(Tier::Cold, &key, b"abc").unwrap();
        let usage = store.usage().unwrap();
        assert_eq!(usage[0].1.files, 1);
        assert_eq!(usage[1].1.files, 0);
        assert_eq!(usage[2].1.files, 1);
        assert!(store.remove(Tier::Hot, &key).unwrap());
        assert!(!store.remove(Tier::Hot, &key).unwrap());
    }

    #[test]
    fn demotion_order() {
        assert_eq!(Tier::Hot.demote(), Some(Tier::Warm));
        assert_eq!(Tier::Warm.demote(), Some(Tier::Cold));
        assert_eq!(Tier::Cold.demote(), None);
        assert!(Tier::Hot < Tier::Cold);
    }
}
