//! Storage strategy candidates for the commit pipeline.
//!
//! The engine holds an ordered `Vec<Box<dyn StrategyCandidate>>` and takes
//! the first artifact produced. Delta candidates return
//! [`StoreError::StrategyRejected`] when they do not beat the ratio threshold;
//! [`FastSnapshot`] is terminal and always produces an artifact.

use crate::bundle::{self, Bundle, BundleEntry};
use crate::compression::{segment_frames, DeltaCompressor};
use crate::config::{CommitConfig, SnapshotFormat};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::FileStamp;
use crate::history::{CommitRecord, CompressionArtifact, Strategy};
use crate::legacy::{self, copy_exact};
use crate::metadata::{is_layered, FileMetadata};
use crate::restore::RestoreEngine;
use crate::staging::StagedEntry;
use crate::tier::{write_atomic, ArtifactKey, Tier, TierStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FORMAT_DELTA_MAGIC: &[u8; 4] = b"DGFD";

/// A staged file as seen at commit time.
#[derive(Debug, Clone)]
pub struct CommitFile {
    /// Manifest entry recorded at stage time
    pub entry: StagedEntry,
    /// Size and mtime re-read when the commit started
    pub stamp: FileStamp,
}

impl CommitFile {
    /// Re-stat a staged entry.
    pub fn load(entry: &StagedEntry) -> StoreResult<Self> {
        let stamp = FileStamp::of(&entry.original_path).map_err(|e| match e {
            StoreError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                StoreError::NotFound(entry.normalized_path.clone())
            }
            other => other,
        })?;
        Ok(Self {
            entry: entry.clone(),
            stamp,
        })
    }

    /// Index entry for the bundle.
    pub fn bundle_entry(&self) -> BundleEntry {
        BundleEntry {
            path: self.entry.normalized_path.clone(),
            size: self.stamp.size,
            modified: self.stamp.modified,
        }
    }

    /// True if size and mtime still match the staged values.
    pub fn unchanged_since_staging(&self) -> bool {
        self.stamp == self.entry.stamp()
    }

    fn open(&self) -> StoreResult<impl Read> {
        Ok(BufReader::new(File::open(&self.entry.original_path)?).take(self.stamp.size))
    }

    fn read_all(&self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.stamp.size as usize);
        copy_exact(
            File::open(&self.entry.original_path)?,
            &mut out,
            self.stamp.size,
            &self.entry.normalized_path,
        )?;
        Ok(out)
    }
}

/// Everything a candidate needs to produce version `version`.
pub struct CommitContext<'a> {
    /// Version being committed
    pub version: u64,
    /// Record of `version - 1`, if any
    pub parent: Option<&'a CommitRecord>,
    /// Chain length of the parent (0 without a parent)
    pub parent_chain_length: u32,
    /// Files in normalized-path order
    pub files: &'a [CommitFile],
    /// Repository `.dgit` directory
    pub dgit_dir: &'a Path,
    /// Tier store
    pub store: &'a TierStore,
    /// Commit settings
    pub config: &'a CommitConfig,
    restore: &'a RestoreEngine,
    parent_bundle: OnceCell<Vec<u8>>,
    new_bundle: OnceCell<Vec<u8>>,
}

impl<'a> CommitContext<'a> {
    /// Build a context; bundles are materialized on first use.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u64,
        parent: Option<&'a CommitRecord>,
        parent_chain_length: u32,
        files: &'a [CommitFile],
        dgit_dir: &'a Path,
        store: &'a TierStore,
        config: &'a CommitConfig,
        restore: &'a RestoreEngine,
    ) -> Self {
        Self {
            version,
            parent,
            parent_chain_length,
            files,
            dgit_dir,
            store,
            config,
            restore,
            parent_bundle: OnceCell::new(),
            new_bundle: OnceCell::new(),
        }
    }

    /// Bundle index entries for the new version.
    pub fn bundle_entries(&self) -> Vec<BundleEntry> {
        self.files.iter().map(CommitFile::bundle_entry).collect()
    }

    /// Decoded size of the new version's bundle.
    pub fn bundle_size(&self) -> StoreResult<u64> {
        let header = bundle::encode_header(&self.bundle_entries())?;
        Ok(header.len() as u64 + self.files.iter().map(|f| f.stamp.size).sum::<u64>())
    }

    /// True when a delta against the parent is allowed: a parent exists, its
    /// chain is below the cap, at least one staged path exists in it, and
    /// neither bundle exceeds `max_delta_bytes`. Both bundles are held in
    /// memory while a delta is built.
    pub fn delta_eligible(&self) -> bool {
        let Some(parent) = self.parent else {
            return false;
        };
        if self.parent_chain_length >= self.config.max_chain_length
            || !self
                .files
                .iter()
                .any(|f| parent.files.contains_key(&f.entry.normalized_path))
        {
            return false;
        }
        let limit = self.config.max_delta_bytes;
        let size = self.bundle_size().unwrap_or(u64::MAX);
        if size > limit || parent.artifact.original_size > limit {
            debug!(
                version = self.version,
                size,
                parent_size = parent.artifact.original_size,
                limit,
                "Bundle too large for delta"
            );
            return false;
        }
        true
    }

    fn parent_bundle(&self) -> StoreResult<&[u8]> {
        if let Some(bytes) = self.parent_bundle.get() {
            return Ok(bytes);
        }
        let parent = self
            .parent
            .ok_or_else(|| StoreError::NotFound("parent version".to_string()))?;
        let rebuilt = self.restore.reconstruct(parent.version)?;
        Ok(self.parent_bundle.get_or_init(|| rebuilt.bytes))
    }

    fn new_bundle(&self) -> StoreResult<&[u8]> {
        if let Some(bytes) = self.new_bundle.get() {
            return Ok(bytes);
        }
        let mut out = bundle::encode_header(&self.bundle_entries())?;
        for file in self.files {
            copy_exact(
                File::open(&file.entry.original_path)?,
                &mut out,
                file.stamp.size,
                &file.entry.normalized_path,
            )?;
        }
        Ok(self.new_bundle.get_or_init(|| out))
    }

    fn deltas_dir(&self) -> PathBuf {
        self.dgit_dir.join("objects").join("deltas")
    }
}

/// One way of storing a commit.
pub trait StrategyCandidate: Send + Sync {
    /// Strategy recorded when this candidate wins.
    fn strategy(&self) -> Strategy;

    /// Produce an artifact, `Ok(None)` when not applicable, or
    /// `Err(StrategyRejected)` when the result was not good enough.
    /// `elapsed_ms` is filled in by the engine.
    fn attempt(&self, ctx: &CommitContext<'_>) -> StoreResult<Option<CompressionArtifact>>;
}

/// File name of a delta artifact inside `objects/deltas/`.
pub fn delta_file_name(version: u64, parent: u64, strategy: Strategy) -> String {
    let ext = match strategy {
        Strategy::FormatDelta => "fdelta",
        _ => "zdelta",
    };
    format!("v{}_from_v{}.{}", version, parent, ext)
}

fn ratio(compressed: u64, original: u64) -> f64 {
    compressed as f64 / original.max(1) as f64
}

fn check_ratio(strategy: Strategy, compressed: u64, original: u64, threshold: f64) -> StoreResult<f64> {
    let r = ratio(compressed, original);
    if r > threshold {
        return Err(StoreError::StrategyRejected {
            strategy: strategy.name(),
            ratio: r,
            threshold,
        });
    }
    Ok(r)
}

fn write_delta(
    ctx: &CommitContext<'_>,
    strategy: Strategy,
    parent: u64,
    bytes: &[u8],
    original: u64,
    compression_ratio: f64,
) -> StoreResult<CompressionArtifact> {
    let name = delta_file_name(ctx.version, parent, strategy);
    write_atomic(&ctx.deltas_dir().join(&name), bytes)?;
    Ok(CompressionArtifact {
        strategy,
        output_id: format!("objects/deltas/{}", name),
        original_size: original,
        compressed_size: bytes.len() as u64,
        compression_ratio,
        parent_version: Some(parent),
        tier: None,
        created_at: Utc::now(),
        elapsed_ms: 0.0,
    })
}

/// Zstd delta of the whole bundle against the parent's reconstructed bundle.
#[derive(Debug, Default)]
pub struct BinaryDelta;

impl StrategyCandidate for BinaryDelta {
    fn strategy(&self) -> Strategy {
        Strategy::BinaryDelta
    }

    fn attempt(&self, ctx: &CommitContext<'_>) -> StoreResult<Option<CompressionArtifact>> {
        let Some(parent) = ctx.parent.filter(|_| ctx.delta_eligible()) else {
            return Ok(None);
        };
        let reference = ctx.parent_bundle()?;
        let target = ctx.new_bundle()?;
        let delta = DeltaCompressor::compress_delta(target, reference, ctx.config.delta_level)?;
        let r = check_ratio(
            self.strategy(),
            delta.len() as u64,
            target.len() as u64,
            ctx.config.delta_ratio_threshold,
        )?;
        write_delta(ctx, self.strategy(), parent.version, &delta, target.len() as u64, r).map(Some)
    }
}

/// Per-file encoding inside a format-aware delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FileEncoding {
    /// Zstd delta against the same path in the parent
    Delta,
    /// Plain Zstd
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FormatDeltaFile {
    path: String,
    size: u64,
    modified: DateTime<Utc>,
    encoding: FileEncoding,
    encoded_len: u64,
    metadata: FileMetadata,
}

/// Per-file deltas for commits containing layered formats.
///
/// Layout: `"DGFD" | header_len u32 LE | JSON [file headers] | encoded files`.
#[derive(Debug, Default)]
pub struct FormatDelta;

impl StrategyCandidate for FormatDelta {
    fn strategy(&self) -> Strategy {
        Strategy::FormatDelta
    }

    fn attempt(&self, ctx: &CommitContext<'_>) -> StoreResult<Option<CompressionArtifact>> {
        if !ctx.config.format_aware_delta
            || !ctx.files.iter().any(|f| is_layered(&f.entry.original_path))
        {
            return Ok(None);
        }
        let Some(parent) = ctx.parent.filter(|_| ctx.delta_eligible()) else {
            return Ok(None);
        };
        let parent_bytes = ctx.parent_bundle()?;
        let parent_bundle = Bundle::parse(parent_bytes, &format!("v{}", parent.version))?;

        let mut headers = Vec::with_capacity(ctx.files.len());
        let mut blobs = Vec::new();
        for file in ctx.files {
            let data = file.read_all()?;
            let base = parent_bundle
                .find(&file.entry.normalized_path)
                .map(|(_, payload)| payload)
                .filter(|p| !p.is_empty());
            let (encoding, encoded) = match base {
                Some(reference) => (
                    FileEncoding::Delta,
                    DeltaCompressor::compress_delta(&data, reference, ctx.config.delta_level)?,
                ),
                None => (
                    FileEncoding::Full,
                    zstd::encode_all(data.as_slice(), ctx.config.delta_level)
                        .map_err(|e| StoreError::CompressionFailed(e.to_string()))?,
                ),
            };
            headers.push(FormatDeltaFile {
                path: file.entry.normalized_path.clone(),
                size: file.stamp.size,
                modified: file.stamp.modified,
                encoding,
                encoded_len: encoded.len() as u64,
                metadata: file.entry.metadata.clone(),
            });
            blobs.extend_from_slice(&encoded);
        }

        let header = serde_json::to_vec(&headers)?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| StoreError::Serialization("format delta header exceeds 4 GiB".to_string()))?;
        let mut out = Vec::with_capacity(8 + header.len() + blobs.len());
        out.extend_from_slice(FORMAT_DELTA_MAGIC);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&blobs);

        let original = ctx.bundle_size()?;
        let r = check_ratio(
            self.strategy(),
            out.len() as u64,
            original,
            ctx.config.delta_ratio_threshold,
        )?;
        write_delta(ctx, self.strategy(), parent.version, &out, original, r).map(Some)
    }
}

/// Rebuild a bundle from a format-aware delta and the parent bundle.
pub fn apply_format_delta(data: &[u8], parent_bundle: &[u8], key: &str) -> StoreResult<Vec<u8>> {
    if data.len() < 8 || &data[..4] != FORMAT_DELTA_MAGIC {
        return Err(StoreError::corrupt(key, "missing format delta magic"));
    }
    let header_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let body = 8usize
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| StoreError::corrupt(key, "format delta header truncated"))?;
    let headers: Vec<FormatDeltaFile> =
        serde_json::from_slice(&data[8..body]).map_err(|e| StoreError::corrupt(key, e))?;
    let parent = Bundle::parse(parent_bundle, key)?;

    let entries: Vec<BundleEntry> = headers
        .iter()
        .map(|h| BundleEntry {
            path: h.path.clone(),
            size: h.size,
            modified: h.modified,
        })
        .collect();
    let mut out = bundle::encode_header(&entries)?;
    let mut offset = body;
    for h in &headers {
        let end = usize::try_from(h.encoded_len)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| StoreError::corrupt(key, format!("{} truncated", h.path)))?;
        let encoded = &data[offset..end];
        let decoded = match h.encoding {
            FileEncoding::Delta => {
                let (_, reference) = parent
                    .find(&h.path)
                    .ok_or_else(|| StoreError::corrupt(key, format!("{} missing from parent", h.path)))?;
                DeltaCompressor::decompress_delta(encoded, reference, key)?
            }
            FileEncoding::Full => {
                zstd::decode_all(encoded).map_err(|e| StoreError::corrupt(key, e))?
            }
        };
        if decoded.len() as u64 != h.size {
            return Err(StoreError::corrupt(
                key,
                format!("{} decoded to {} bytes, expected {}", h.path, decoded.len(), h.size),
            ));
        }
        out.extend_from_slice(&decoded);
        offset = end;
    }
    Ok(out)
}

/// Terminal candidate: a full snapshot in the hot tier, or a zip archive.
#[derive(Debug, Default)]
pub struct FastSnapshot;

impl FastSnapshot {
    /// Append a staged file's pre-compressed frame if it is still valid.
    fn splice(
        store: &TierStore,
        file: &CommitFile,
        writer: &mut crate::compression::SegmentWriter<std::io::BufWriter<File>>,
    ) -> StoreResult<bool> {
        if !file.entry.precompressed || !file.unchanged_since_staging() {
            return Ok(false);
        }
        let key = file.entry.cache_key();
        let encoded = match store.get_encoded(Tier::Hot, &key) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let name = TierStore::file_name(Tier::Hot, &key);
        let frames = match segment_frames(&encoded, &name) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(path = %file.entry.normalized_path, error = %e, "Ignoring unreadable pre-compressed copy");
                return Ok(false);
            }
        };
        match frames.as_slice() {
            [only] if only.raw_len == file.stamp.size => {
                writer.append_encoded(only.frame, only.raw_len)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn write_segmented(&self, ctx: &CommitContext<'_>) -> StoreResult<CompressionArtifact> {
        let header = bundle::encode_header(&ctx.bundle_entries())?;
        let mut spliced = 0usize;
        let artifact = ctx
            .store
            .put_segments(&ArtifactKey::Version(ctx.version), |w| {
                w.append_bytes(&header)?;
                for file in ctx.files {
                    if Self::splice(ctx.store, file, w)? {
                        spliced += 1;
                        continue;
                    }
                    let raw = w.append_reader(file.open()?)?;
                    if raw != file.stamp.size {
                        return Err(StoreError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!(
                                "{} shrank during commit: read {} of {} bytes",
                                file.entry.normalized_path, raw, file.stamp.size
                            ),
                        )));
                    }
                }
                Ok(())
            })?;
        let original = ctx.bundle_size()?;
        debug!(version = ctx.version, spliced, files = ctx.files.len(), "Wrote fast snapshot");
        Ok(CompressionArtifact {
            strategy: Strategy::FastSnapshot,
            output_id: format!("cache/hot/{}", artifact.file_name),
            original_size: original,
            compressed_size: artifact.size,
            compression_ratio: ratio(artifact.size, original),
            parent_version: None,
            tier: Some(Tier::Hot),
            created_at: Utc::now(),
            elapsed_ms: 0.0,
        })
    }

    fn write_archive(&self, ctx: &CommitContext<'_>) -> StoreResult<CompressionArtifact> {
        let name = legacy::archive_name(ctx.version);
        let files: Vec<(BundleEntry, PathBuf)> = ctx
            .files
            .iter()
            .map(|f| (f.bundle_entry(), f.entry.original_path.clone()))
            .collect();
        let size = legacy::write_archive(&ctx.dgit_dir.join("objects").join(&name), &files)?;
        let original = ctx.bundle_size()?;
        Ok(CompressionArtifact {
            strategy: Strategy::LegacyArchive,
            output_id: format!("objects/{}", name),
            original_size: original,
            compressed_size: size,
            compression_ratio: ratio(size, original),
            parent_version: None,
            tier: None,
            created_at: Utc::now(),
            elapsed_ms: 0.0,
        })
    }
}

impl StrategyCandidate for FastSnapshot {
    fn strategy(&self) -> Strategy {
        Strategy::FastSnapshot
    }

    fn attempt(&self, ctx: &CommitContext<'_>) -> StoreResult<Option<CompressionArtifact>> {
        match ctx.config.snapshot_format {
            SnapshotFormat::Lz4 => self.write_segmented(ctx).map(Some),
            SnapshotFormat::LegacyArchive => self.write_archive(ctx).map(Some),
        }
    }
}

/// Candidates in priority order for a configuration.
pub fn candidates(config: &CommitConfig) -> Vec<Box<dyn StrategyCandidate>> {
    let mut list: Vec<Box<dyn StrategyCandidate>> = vec![Box::new(BinaryDelta)];
    if config.format_aware_delta {
        list.push(Box::new(FormatDelta));
    }
    list.push(Box::new(FastSnapshot));
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(path: &str, size: u64) -> BundleEntry {
        BundleEntry {
            path: path.to_string(),
            size,
            modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn fd_file(path: &str, size: u64, encoding: FileEncoding, encoded_len: u64) -> FormatDeltaFile {
        FormatDeltaFile {
            path: path.to_string(),
            size,
            modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            encoding,
            encoded_len,
            metadata: FileMetadata::Unavailable {
                reason: "test".to_string(),
            },
        }
    }

    fn encode_fd(files: &[FormatDeltaFile], blobs: &[u8]) -> Vec<u8> {
        let header = serde_json::to_vec(files).unwrap();
        let mut out = FORMAT_DELTA_MAGIC.to_vec();
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(blobs);
        out
    }

    #[test]
    fn delta_file_names() {
        assert_eq!(
            delta_file_name(2, 1, Strategy::BinaryDelta),
            "v2_from_v1.zdelta"
        );
        assert_eq!(
            delta_file_name(7, 6, Strategy::FormatDelta),
            "v7_from_v6.fdelta"
        );
    }

    #[test]
    fn ratio_threshold_is_inclusive() {
        assert!(check_ratio(Strategy::BinaryDelta, 30, 100, 0.3).is_ok());
        let err = check_ratio(Strategy::BinaryDelta, 31, 100, 0.3).unwrap_err();
        assert!(matches!(err, StoreError::StrategyRejected { .. }));
    }

    #[test]
    fn candidate_order() {
        let order: Vec<Strategy> = candidates(&CommitConfig::default())
            .iter()
            .map(|c| c.strategy())
            .collect();
        assert_eq!(
            order,
            vec![
                Strategy::BinaryDelta,
                Strategy::FormatDelta,
                Strategy::FastSnapshot
            ]
        );
        let config = CommitConfig {
            format_aware_delta: false,
            ..CommitConfig::default()
        };
        assert_eq!(candidates(&config).len(), 2);
    }

    #[test]
    fn format_delta_applies_per_file() {
        let old_psd: Vec<u8> = (0..4096u32).map(|i| (i % 97) as u8).collect();
        let mut new_psd = old_psd.clone();
        new_psd[100] = 0xff;
        let parent = bundle::build(&[(entry("art.psd", 4096), old_psd.as_slice())]).unwrap();

        let delta = DeltaCompressor::compress_delta(&new_psd, &old_psd, 3).unwrap();
        let full = zstd::encode_all(&b"brand new"[..], 3).unwrap();
        let mut blobs = delta.clone();
        blobs.extend_from_slice(&full);
        let data = encode_fd(
            &[
                fd_file("art.psd", 4096, FileEncoding::Delta, delta.len() as u64),
                fd_file("new.ai", 9, FileEncoding::Full, full.len() as u64),
            ],
            &blobs,
        );

        let rebuilt = apply_format_delta(&data, &parent, "v2_from_v1.fdelta").unwrap();
        let bundle = Bundle::parse(&rebuilt, "v2").unwrap();
        assert_eq!(bundle.find("art.psd").unwrap().1, new_psd.as_slice());
        assert_eq!(bundle.find("new.ai").unwrap().1, b"brand new");
    }

    #[test]
    fn format_delta_missing_parent_path_is_corrupt() {
        let parent = bundle::build(&[(entry("other.psd", 1), b"x".as_slice())]).unwrap();
        let data = encode_fd(&[fd_file("art.psd", 1, FileEncoding::Delta, 0)], b"");
        assert!(matches!(
            apply_format_delta(&data, &parent, "k").unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }
}
