//! Restore planner and executor.
//!
//! A snapshot version is read from the cheapest copy available, in order:
//! hot, warm, legacy zip, cold. A delta version is rebuilt by walking its
//! chain back to the nearest stored base. Corrupt or broken paths fall
//! through to the next one. Files are then selected from the rebuilt bundle
//! by pattern.

use crate::bundle::Bundle;
use crate::compression::{self, DeltaCompressor};
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::history::{CommitRecord, Strategy, VersionHistory};
use crate::legacy;
use crate::strategy::apply_format_delta;
use crate::tier::{ArtifactKey, Tier, TierStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Where a full snapshot is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseSource {
    /// `cache/hot/v<N>.lz4`
    Hot,
    /// `cache/warm/v<N>.zstd`
    Warm,
    /// `objects/v<N>.zip`
    Legacy,
    /// `cache/cold/v<N>.archive.zstd`
    Cold,
}

impl BaseSource {
    const PRIORITY: [BaseSource; 4] = [
        BaseSource::Hot,
        BaseSource::Warm,
        BaseSource::Legacy,
        BaseSource::Cold,
    ];

    fn tier(self) -> Option<Tier> {
        match self {
            BaseSource::Hot => Some(Tier::Hot),
            BaseSource::Warm => Some(Tier::Warm),
            BaseSource::Cold => Some(Tier::Cold),
            BaseSource::Legacy => None,
        }
    }
}

/// Reconstruction path that produced a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreMethod {
    /// Direct hot-tier hit
    HotCache,
    /// Direct warm-tier hit
    WarmCache,
    /// Exact-version zip snapshot
    LegacyArchive,
    /// Base snapshot plus delta steps
    DeltaChain,
    /// Cold-tier archive
    ColdArchive,
}

impl std::fmt::Display for RestoreMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RestoreMethod::HotCache => "hot cache",
            RestoreMethod::WarmCache => "warm cache",
            RestoreMethod::LegacyArchive => "legacy archive",
            RestoreMethod::DeltaChain => "delta chain",
            RestoreMethod::ColdArchive => "cold archive",
        })
    }
}

/// One delta application, oldest first in a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaStep {
    /// Version this step produces
    pub version: u64,
    /// Version it applies to
    pub parent: u64,
    /// Binary or format-aware
    pub strategy: Strategy,
    /// Delta artifact on disk
    pub path: PathBuf,
}

/// A reconstruction path chosen without reading any artifact content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestorePlan {
    /// Target version
    pub version: u64,
    /// Path kind
    pub method: RestoreMethod,
    /// Version of the full snapshot read first
    pub base_version: u64,
    /// Where that snapshot is read from
    pub base_source: BaseSource,
    /// Deltas applied after the base, oldest first
    pub steps: Vec<DeltaStep>,
}

/// A rebuilt bundle and how it was obtained.
#[derive(Debug)]
pub struct Reconstructed {
    /// Bundle bytes
    pub bytes: Vec<u8>,
    /// Path used
    pub method: RestoreMethod,
    /// Tier of the base snapshot, if tier-resident
    pub cache_tier_hit: Option<Tier>,
    /// Encoded bytes read from disk
    pub bytes_read: u64,
}

/// Outcome of a restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// Restored version
    pub version: u64,
    /// Its commit hash
    pub hash: String,
    /// Files written
    pub restored_files: Vec<String>,
    /// Files excluded by the patterns
    pub skipped_files: Vec<String>,
    /// Files that matched but could not be written
    pub failed_files: BTreeMap<String, ErrorKind>,
    /// Reconstruction path used
    pub method: RestoreMethod,
    /// Tier of the base snapshot, if tier-resident
    pub cache_tier_hit: Option<Tier>,
    /// Encoded bytes read from disk
    pub bytes_read: u64,
    /// Destination directory
    pub destination: PathBuf,
    /// Wall time in milliseconds
    pub elapsed_ms: f64,
}

/// How a file path matched a restore pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    /// Pattern equals the path
    Exact,
    /// Pattern's last component equals the file name
    Basename,
    /// Pattern ends in `/` and prefixes the path
    DirectoryPrefix,
    /// Pattern, stripped of slashes, occurs in the path
    Substring,
}

impl MatchKind {
    const ORDER: [MatchKind; 4] = [
        MatchKind::Exact,
        MatchKind::Basename,
        MatchKind::DirectoryPrefix,
        MatchKind::Substring,
    ];

    fn matches(self, path: &str, pattern: &str) -> bool {
        match self {
            MatchKind::Exact => path == pattern,
            MatchKind::Basename => {
                let base = |s: &str| s.trim_end_matches('/').rsplit('/').next().map(str::to_owned);
                base(path) == base(pattern)
            }
            MatchKind::DirectoryPrefix => pattern.ends_with('/') && path.starts_with(pattern),
            MatchKind::Substring => {
                let needle = pattern.trim_matches('/');
                !needle.is_empty() && path.contains(needle)
            }
        }
    }
}

fn normalize_pattern(pattern: &str) -> String {
    let p = pattern.replace('\\', "/");
    p.strip_prefix("./").unwrap_or(&p).to_string()
}

/// First strategy, in priority order, by which any pattern selects `path`.
pub fn match_path(path: &str, patterns: &[String]) -> Option<MatchKind> {
    let patterns: Vec<String> = patterns
        .iter()
        .map(|p| normalize_pattern(p))
        .filter(|p| !p.is_empty())
        .collect();
    MatchKind::ORDER
        .into_iter()
        .find(|kind| patterns.iter().any(|p| kind.matches(path, p)))
}

fn has_patterns(patterns: &[String]) -> bool {
    patterns.iter().any(|p| !normalize_pattern(p).is_empty())
}

/// Destination path for a bundle entry, rejecting escapes from `root`.
fn destination_for(root: &Path, path: &str) -> Option<PathBuf> {
    let relative = Path::new(path);
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| root.join(relative))
}

/// Plans and executes restores over one repository.
#[derive(Debug, Clone)]
pub struct RestoreEngine {
    dgit_dir: PathBuf,
    store: TierStore,
    history: VersionHistory,
}

impl RestoreEngine {
    /// Engine over a repository's `.dgit` directory.
    pub fn new(dgit_dir: impl Into<PathBuf>, store: TierStore, history: VersionHistory) -> Self {
        Self {
            dgit_dir: dgit_dir.into(),
            store,
            history,
        }
    }

    /// Resolve `v<N>`, a decimal version, or a hash prefix of at least four
    /// hex characters. Decimal strings are tried as versions first; one of
    /// four or more digits that names no version is tried as a hash prefix.
    pub fn resolve(&self, reference: &str) -> StoreResult<CommitRecord> {
        let reference = reference.trim();
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        let prefix_like = reference.len() >= 4 && reference.bytes().all(|b| b.is_ascii_hexdigit());
        let number = reference
            .strip_prefix('v')
            .filter(|rest| digits(*rest))
            .or_else(|| digits(reference).then_some(reference));
        if let Some(n) = number {
            let found = match n.parse::<u64>() {
                Ok(version) => self.history.get(version),
                Err(_) => Err(StoreError::InvalidReference(reference.to_string())),
            };
            return match found {
                Err(StoreError::NotFound(_) | StoreError::InvalidReference(_)) if prefix_like => {
                    debug!(reference, "No such version, trying hash prefix");
                    self.history.find_by_hash_prefix(reference)
                }
                other => other,
            };
        }
        if prefix_like {
            return self.history.find_by_hash_prefix(reference);
        }
        Err(StoreError::InvalidReference(reference.to_string()))
    }

    fn source_path(&self, version: u64, source: BaseSource) -> PathBuf {
        match source.tier() {
            Some(tier) => self.store.path(tier, &ArtifactKey::Version(version)),
            None => self
                .dgit_dir
                .join("objects")
                .join(legacy::archive_name(version)),
        }
    }

    fn has_source(&self, version: u64, source: BaseSource) -> bool {
        self.source_path(version, source).is_file()
    }

    fn direct_plan(version: u64, source: BaseSource) -> RestorePlan {
        let method = match source {
            BaseSource::Hot => RestoreMethod::HotCache,
            BaseSource::Warm => RestoreMethod::WarmCache,
            BaseSource::Legacy => RestoreMethod::LegacyArchive,
            BaseSource::Cold => RestoreMethod::ColdArchive,
        };
        RestorePlan {
            version,
            method,
            base_version: version,
            base_source: source,
            steps: Vec::new(),
        }
    }

    /// Walk back from a delta record to the nearest stored base.
    fn chain_plan(&self, record: &CommitRecord) -> StoreResult<RestorePlan> {
        let target = record.version;
        let mut steps = Vec::new();
        let mut current = record.clone();
        loop {
            let parent = current.artifact.parent_version.ok_or_else(|| {
                StoreError::corrupt(
                    format!("v{}.json", current.version),
                    "delta record without parent_version",
                )
            })?;
            if parent >= current.version {
                return Err(StoreError::corrupt(
                    format!("v{}.json", current.version),
                    format!("parent v{} is not older", parent),
                ));
            }
            let path = self.dgit_dir.join(&current.artifact.output_id);
            if !path.is_file() {
                return Err(StoreError::ChainBroken {
                    version: target,
                    missing: current.version,
                });
            }
            steps.push(DeltaStep {
                version: current.version,
                parent,
                strategy: current.artifact.strategy,
                path,
            });

            // Tier files of a delta version are leftovers, never a base.
            let parent_record = self.history.get(parent).ok();
            let parent_is_delta = parent_record
                .as_ref()
                .is_some_and(|r| r.artifact.strategy.is_delta());
            if !parent_is_delta {
                if let Some(source) = BaseSource::PRIORITY
                    .into_iter()
                    .find(|s| self.has_source(parent, *s))
                {
                    steps.reverse();
                    return Ok(RestorePlan {
                        version: target,
                        method: RestoreMethod::DeltaChain,
                        base_version: parent,
                        base_source: source,
                        steps,
                    });
                }
            }

            match parent_record {
                Some(record) if parent_is_delta => current = record,
                _ => {
                    return Err(StoreError::ChainBroken {
                        version: target,
                        missing: parent,
                    })
                }
            }
        }
    }

    /// Every available path for `version`, highest priority first.
    /// Snapshots are read directly from their stored copies; deltas only
    /// through their chain.
    fn plans(&self, version: u64) -> StoreResult<Vec<RestorePlan>> {
        let record = self.history.get(version)?;
        let mut plans = Vec::new();
        let mut chain_error = None;
        if record.artifact.strategy.is_delta() {
            match self.chain_plan(&record) {
                Ok(plan) => plans.push(plan),
                Err(e) => chain_error = Some(e),
            }
        } else {
            plans.extend(
                BaseSource::PRIORITY
                    .into_iter()
                    .filter(|s| self.has_source(version, *s))
                    .map(|s| Self::direct_plan(version, s)),
            );
        }

        if plans.is_empty() {
            return Err(chain_error.unwrap_or_else(|| {
                StoreError::NotFound(format!("no stored artifact for v{}", version))
            }));
        }
        Ok(plans)
    }

    /// The path a restore of `version` would take, without reading content.
    pub fn plan(&self, version: u64) -> StoreResult<RestorePlan> {
        let mut plans = self.plans(version)?;
        Ok(plans.remove(0))
    }

    fn load_base(&self, version: u64, source: BaseSource) -> StoreResult<(Vec<u8>, u64)> {
        match source.tier() {
            Some(tier) => {
                let key = ArtifactKey::Version(version);
                let encoded = self.store.get_encoded(tier, &key)?;
                let name = TierStore::file_name(tier, &key);
                let bytes = compression::decompress(&encoded, self.store.codec(tier), &name)?;
                Ok((bytes, encoded.len() as u64))
            }
            None => {
                let path = self.source_path(version, source);
                let read = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                Ok((legacy::read_archive(&path)?, read))
            }
        }
    }

    /// Load the chain base, trying the remaining sources if one is corrupt.
    fn load_chain_base(&self, plan: &RestorePlan) -> StoreResult<(Vec<u8>, u64, BaseSource)> {
        let mut last = None;
        let start = BaseSource::PRIORITY
            .iter()
            .position(|s| *s == plan.base_source)
            .unwrap_or(0);
        for source in &BaseSource::PRIORITY[start..] {
            if !self.has_source(plan.base_version, *source) {
                continue;
            }
            match self.load_base(plan.base_version, *source) {
                Ok((bytes, read)) => match Bundle::parse(&bytes, "chain base") {
                    Ok(_) => return Ok((bytes, read, *source)),
                    Err(e) => last = Some(e),
                },
                Err(e @ StoreError::Corrupt { .. }) => {
                    warn!(version = plan.base_version, source = ?source, error = %e, "Chain base unreadable, trying next source");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(StoreError::ChainBroken {
            version: plan.version,
            missing: plan.base_version,
        }))
    }

    fn execute(&self, plan: &RestorePlan) -> StoreResult<Reconstructed> {
        let (mut current, mut bytes_read, base_source) = if plan.steps.is_empty() {
            let (bytes, read) = self.load_base(plan.base_version, plan.base_source)?;
            (bytes, read, plan.base_source)
        } else {
            self.load_chain_base(plan)?
        };

        for step in &plan.steps {
            let key = step
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let delta = match std::fs::read(&step.path) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::ChainBroken {
                        version: plan.version,
                        missing: step.version,
                    })
                }
                Err(e) => return Err(e.into()),
            };
            bytes_read += delta.len() as u64;
            let next = match step.strategy {
                Strategy::FormatDelta => apply_format_delta(&delta, &current, &key)?,
                _ => DeltaCompressor::decompress_delta(&delta, &current, &key)?,
            };
            debug!(version = step.version, parent = step.parent, bytes = next.len(), "Applied delta step");
            current = next;
        }

        Bundle::parse(&current, &format!("v{}", plan.version))?;
        Ok(Reconstructed {
            bytes: current,
            method: plan.method,
            cache_tier_hit: base_source.tier(),
            bytes_read,
        })
    }

    /// Rebuild the bundle of `version`, falling through corrupt or broken paths.
    pub fn reconstruct(&self, version: u64) -> StoreResult<Reconstructed> {
        let mut last = None;
        for plan in self.plans(version)? {
            match self.execute(&plan) {
                Ok(rebuilt) => return Ok(rebuilt),
                Err(e @ (StoreError::Corrupt { .. }
                | StoreError::ChainBroken { .. }
                | StoreError::NotFound(_))) => {
                    warn!(version, method = %plan.method, error = %e, "Restore path failed, falling through");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| StoreError::NotFound(format!("no stored artifact for v{}", version))))
    }

    /// Restore the files of `reference` matching `patterns` into `destination`.
    /// An empty pattern list restores every file.
    #[instrument(skip(self, patterns), fields(patterns = patterns.len()))]
    pub fn restore(
        &self,
        reference: &str,
        patterns: &[String],
        destination: &Path,
    ) -> StoreResult<RestoreReport> {
        let start = Instant::now();
        let record = self.resolve(reference)?;
        let rebuilt = self.reconstruct(record.version)?;
        let bundle = Bundle::parse(&rebuilt.bytes, &format!("v{}", record.version))?;

        let select_all = !has_patterns(patterns);
        let mut report = RestoreReport {
            version: record.version,
            hash: record.hash.clone(),
            restored_files: Vec::new(),
            skipped_files: Vec::new(),
            failed_files: BTreeMap::new(),
            method: rebuilt.method,
            cache_tier_hit: rebuilt.cache_tier_hit,
            bytes_read: rebuilt.bytes_read,
            destination: destination.to_path_buf(),
            elapsed_ms: 0.0,
        };

        for (entry, payload) in bundle.files() {
            if !select_all {
                match match_path(&entry.path, patterns) {
                    Some(kind) => debug!(path = %entry.path, ?kind, "Pattern matched"),
                    None => {
                        report.skipped_files.push(entry.path.clone());
                        continue;
                    }
                }
            }
            let Some(target) = destination_for(destination, &entry.path) else {
                warn!(path = %entry.path, "Refusing to restore path outside destination");
                report.failed_files.insert(entry.path.clone(), ErrorKind::Other);
                continue;
            };
            let written = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(&target, payload));
            match written {
                Ok(()) => report.restored_files.push(entry.path.clone()),
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "Failed to restore file");
                    report
                        .failed_files
                        .insert(entry.path.clone(), StoreError::from(e).kind());
                }
            }
        }

        report.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            version = report.version,
            method = %report.method,
            restored = report.restored_files.len(),
            skipped = report.skipped_files.len(),
            failed = report.failed_files.len(),
            "Restore complete"
        );
        Ok(report)
    }
}
