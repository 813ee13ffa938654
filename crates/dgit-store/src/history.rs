//! Commit records, HEAD and the version counter.
//!
//! One JSON record per version lives at `objects/v<N>.json`. `HEAD` holds the
//! head commit hash and `VERSION` the authoritative version counter; both are
//! rewritten atomically by every successful commit.

use crate::error::{StoreError, StoreResult};
use crate::metadata::FileMetadata;
use crate::tier::{write_atomic, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// How a commit's content is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Full snapshot, segmented LZ4 in the hot tier
    FastSnapshot,
    /// Zstd-dictionary delta of the whole bundle against the parent
    BinaryDelta,
    /// Per-file deltas for layered formats
    FormatDelta,
    /// Full snapshot as `objects/v<N>.zip`
    LegacyArchive,
}

impl Strategy {
    /// True for strategies that need the parent version to reconstruct.
    pub fn is_delta(self) -> bool {
        matches!(self, Strategy::BinaryDelta | Strategy::FormatDelta)
    }

    /// Stable name, as serialized.
    pub fn name(self) -> &'static str {
        match self {
            Strategy::FastSnapshot => "fast-snapshot",
            Strategy::BinaryDelta => "binary-delta",
            Strategy::FormatDelta => "format-delta",
            Strategy::LegacyArchive => "legacy-archive",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The stored form of one commit's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionArtifact {
    /// Strategy that produced the artifact
    pub strategy: Strategy,
    /// Path relative to `.dgit`, e.g. `cache/hot/v1.lz4`
    pub output_id: String,
    /// Bundle size before encoding
    pub original_size: u64,
    /// Encoded size on disk
    pub compressed_size: u64,
    /// `compressed_size / original_size`, lower is better
    pub compression_ratio: f64,
    /// Base version, present iff the strategy is a delta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u64>,
    /// Cache tier holding the preferred copy, if tier-resident
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// When the artifact was written
    pub created_at: DateTime<Utc>,
    /// Time spent producing it
    pub elapsed_ms: f64,
}

/// Per-file entry of a commit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Size at commit
    pub size: u64,
    /// Modification time at commit
    pub modified: DateTime<Utc>,
    /// Extracted metadata or an unavailability marker
    pub metadata: FileMetadata,
}

/// One committed version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Dense, 1-based version number
    pub version: u64,
    /// 12 hex character content hash
    pub hash: String,
    /// Commit message
    pub message: String,
    /// Author name
    pub author: String,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// Number of files
    pub file_count: usize,
    /// Files keyed by normalized path
    pub files: BTreeMap<String, FileEntry>,
    /// Hash of the previous head
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    /// Stored content
    pub artifact: CompressionArtifact,
}

/// Aggregates over every commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStatistics {
    /// Number of commits
    pub total_commits: u64,
    /// Files across all commits
    pub total_files: u64,
    /// Sum of bundle sizes
    pub original_bytes: u64,
    /// Sum of artifact sizes
    pub stored_bytes: u64,
    /// `original_bytes - stored_bytes`, floored at zero
    pub bytes_saved: u64,
    /// Commit count per strategy name
    pub by_strategy: BTreeMap<String, u64>,
    /// Commit count per tier (`objects` for non-tier artifacts)
    pub by_tier: BTreeMap<String, u64>,
    /// Mean artifact production time
    pub average_commit_ms: f64,
}

/// On-disk bytes by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeBreakdown {
    /// Legacy zip snapshots
    pub snapshots: u64,
    /// Binary and format-aware deltas
    pub deltas: u64,
    /// Commit records
    pub records: u64,
    /// Hot tier
    pub hot: u64,
    /// Warm tier
    pub warm: u64,
    /// Cold tier
    pub cold: u64,
    /// Everything above
    pub total: u64,
}

/// Append-only index of commit records.
#[derive(Debug, Clone)]
pub struct VersionHistory {
    dgit_dir: PathBuf,
    objects_dir: PathBuf,
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

impl VersionHistory {
    /// History rooted at a `.dgit` directory.
    pub fn new(dgit_dir: impl Into<PathBuf>) -> Self {
        let dgit_dir = dgit_dir.into();
        Self {
            objects_dir: dgit_dir.join("objects"),
            dgit_dir,
        }
    }

    /// Create `objects/` and `objects/deltas/`.
    pub fn init(&self) -> StoreResult<()> {
        std::fs::create_dir_all(self.objects_dir.join("deltas"))?;
        Ok(())
    }

    /// Path of a version's record.
    pub fn record_path(&self, version: u64) -> PathBuf {
        self.objects_dir.join(format!("v{}.json", version))
    }

    /// Load one record.
    pub fn get(&self, version: u64) -> StoreResult<CommitRecord> {
        match std::fs::read(self.record_path(version)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("commit v{}", version)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new record. Fails if one already exists for the version.
    pub fn write_record(&self, record: &CommitRecord) -> StoreResult<()> {
        let path = self.record_path(record.version);
        if path.exists() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("record for v{} already exists", record.version),
            )));
        }
        write_atomic(&path, &serde_json::to_vec_pretty(record)?)
    }

    /// Delete a record written by a commit that is being rolled back.
    pub(crate) fn remove_record(&self, version: u64) -> StoreResult<()> {
        match std::fs::remove_file(self.record_path(version)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Repoint a record at the tier holding its preferred copy.
    pub fn update_tier(&self, version: u64, tier: Tier) -> StoreResult<()> {
        let mut record = self.get(version)?;
        record.artifact.tier = Some(tier);
        write_atomic(&self.record_path(version), &serde_json::to_vec_pretty(&record)?)?;
        debug!(version, %tier, "Updated record tier");
        Ok(())
    }

    /// Hash of the head commit, if any.
    pub fn head(&self) -> StoreResult<Option<String>> {
        match std::fs::read_to_string(self.dgit_dir.join("HEAD")) {
            Ok(s) => {
                let hash = s.trim();
                Ok((!hash.is_empty()).then(|| hash.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Latest committed version, 0 for an empty repository.
    ///
    /// Reads `VERSION`; repositories without one fall back to the highest
    /// `v<N>.json` present.
    pub fn current_version(&self) -> StoreResult<u64> {
        match std::fs::read_to_string(self.dgit_dir.join("VERSION")) {
            Ok(s) => s.trim().parse::<u64>().map_err(|e| {
                StoreError::corrupt("VERSION", format!("{:?}: {}", s.trim(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.scan_max_version(),
            Err(e) => Err(e.into()),
        }
    }

    fn scan_max_version(&self) -> StoreResult<u64> {
        let mut max = 0;
        let entries = match std::fs::read_dir(&self.objects_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(v) = name
                .strip_prefix('v')
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                max = max.max(v);
            }
        }
        Ok(max)
    }

    /// Advance `VERSION` and `HEAD` to `record`. If `HEAD` cannot be
    /// written the previous counter is restored.
    pub(crate) fn advance(&self, record: &CommitRecord) -> StoreResult<()> {
        let version_path = self.dgit_dir.join("VERSION");
        let previous = std::fs::read(&version_path).ok();
        write_atomic(&version_path, format!("{}\n", record.version).as_bytes())?;
        if let Err(e) = write_atomic(
            &self.dgit_dir.join("HEAD"),
            format!("{}\n", record.hash).as_bytes(),
        ) {
            let restored = match previous {
                Some(bytes) => write_atomic(&version_path, &bytes),
                None => std::fs::remove_file(&version_path).map_err(StoreError::from),
            };
            if let Err(re) = restored {
                warn!(error = %re, "Failed to restore VERSION after HEAD write failure");
            }
            return Err(e);
        }
        Ok(())
    }

    /// All records, newest first. Missing records are skipped with a warning.
    pub fn list(&self) -> StoreResult<Vec<CommitRecord>> {
        let current = self.current_version()?;
        let mut out = Vec::with_capacity(current as usize);
        for version in (1..=current).rev() {
            match self.get(version) {
                Ok(record) => out.push(record),
                Err(StoreError::NotFound(_)) => {
                    warn!(version, "Commit record missing from history");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Unique record whose hash starts with `prefix`.
    pub fn find_by_hash_prefix(&self, prefix: &str) -> StoreResult<CommitRecord> {
        let prefix = prefix.to_ascii_lowercase();
        let mut matches: Vec<CommitRecord> = self
            .list()?
            .into_iter()
            .filter(|r| r.hash.starts_with(&prefix))
            .collect();
        match matches.len() {
            0 => Err(StoreError::NotFound(format!("commit {}", prefix))),
            1 => Ok(matches.remove(0)),
            _ => Err(StoreError::AmbiguousReference {
                prefix,
                candidates: matches.into_iter().map(|r| r.hash).collect(),
            }),
        }
    }

    /// Chain length of `version`: one for a full snapshot, plus one per
    /// consecutive delta walking back to it.
    pub fn chain_length(&self, version: u64) -> StoreResult<u32> {
        let mut length = 1;
        let mut record = self.get(version)?;
        while record.artifact.strategy.is_delta() {
            let parent = record.artifact.parent_version.ok_or_else(|| {
                StoreError::corrupt(
                    format!("v{}.json", record.version),
                    "delta record without parent_version",
                )
            })?;
            if parent >= record.version {
                return Err(StoreError::corrupt(
                    format!("v{}.json", record.version),
                    format!("parent v{} is not older", parent),
                ));
            }
            length += 1;
            record = self.get(parent)?;
        }
        Ok(length)
    }

    /// One-line human summary.
    pub fn summary(&self, record: &CommitRecord) -> String {
        let artifact = &record.artifact;
        let mut summary = format!("[v{}] {}", record.version, record.message);
        if record.file_count > 0 {
            summary.push_str(&format!(" ({} files)", record.file_count));
        }
        let percent = (1.0 - artifact.compression_ratio) * 100.0;
        match artifact.strategy {
            Strategy::FastSnapshot => summary.push_str(&format!(
                " • LZ4: {:.1}% ({:.1}ms)",
                percent, artifact.elapsed_ms
            )),
            Strategy::BinaryDelta => summary.push_str(&format!(
                " • Delta from v{}: {:.1}% saved",
                artifact.parent_version.unwrap_or_default(),
                percent
            )),
            Strategy::FormatDelta => summary.push_str(&format!(
                " • Format delta from v{}: {:.1}% saved",
                artifact.parent_version.unwrap_or_default(),
                percent
            )),
            Strategy::LegacyArchive => {
                summary.push_str(&format!(" • ZIP: {:.1}% compressed", percent))
            }
        }
        if let Some(tier) = artifact.tier {
            summary.push_str(&format!(" ({} cache)", tier));
        }
        let layered: Vec<String> = record
            .files
            .iter()
            .filter_map(|(path, entry)| match &entry.metadata {
                FileMetadata::Design(m) => m.layer_count.filter(|l| *l > 0).map(|l| {
                    let name = path.rsplit('/').next().unwrap_or(path);
                    format!("{}: {} layers", name, l)
                }),
                FileMetadata::Unavailable { .. } => None,
            })
            .collect();
        if !layered.is_empty() && layered.len() <= 3 {
            summary.push_str(" • ");
            summary.push_str(&layered.join(", "));
        }
        summary
    }

    /// Aggregate statistics over every record.
    pub fn statistics(&self) -> StoreResult<HistoryStatistics> {
        let records = self.list()?;
        let mut stats = HistoryStatistics::default();
        let mut elapsed_total = 0.0;
        for record in &records {
            let artifact = &record.artifact;
            stats.total_commits += 1;
            stats.total_files += record.file_count as u64;
            stats.original_bytes += artifact.original_size;
            stats.stored_bytes += artifact.compressed_size;
            *stats
                .by_strategy
                .entry(artifact.strategy.name().to_string())
                .or_default() += 1;
            let tier = artifact
                .tier
                .map(|t| t.to_string())
                .unwrap_or_else(|| "objects".to_string());
            *stats.by_tier.entry(tier).or_default() += 1;
            elapsed_total += artifact.elapsed_ms;
        }
        stats.bytes_saved = stats.original_bytes.saturating_sub(stats.stored_bytes);
        if stats.total_commits > 0 {
            stats.average_commit_ms = elapsed_total / stats.total_commits as f64;
        }
        Ok(stats)
    }

    /// Bytes on disk per category.
    pub fn size_breakdown(&self) -> StoreResult<SizeBreakdown> {
        let mut breakdown = SizeBreakdown::default();
        if self.objects_dir.is_dir() {
            for entry in std::fs::read_dir(&self.objects_dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(".zip") {
                    breakdown.snapshots += meta.len();
                } else if name.ends_with(".json") {
                    breakdown.records += meta.len();
                }
            }
        }
        breakdown.deltas = dir_size(&self.objects_dir.join("deltas"));
        let cache = self.dgit_dir.join("cache");
        breakdown.hot = dir_size(&cache.join(Tier::Hot.dir_name()));
        breakdown.warm = dir_size(&cache.join(Tier::Warm.dir_name()));
        breakdown.cold = dir_size(&cache.join(Tier::Cold.dir_name()));
        breakdown.total = breakdown.snapshots
            + breakdown.deltas
            + breakdown.records
            + breakdown.hot
            + breakdown.warm
            + breakdown.cold;
        Ok(breakdown)
    }
}
