//! Staging area: the file set proposed for the next commit.
//!
//! Staging fingerprints each file, assigns an advisory tier by size, and for
//! hot files writes an LZ4 copy keyed by fingerprint into the hot tier so the
//! commit can splice it instead of recompressing. The manifest lives at
//! `.dgit/staging/staged.json`.

use crate::config::StagingConfig;
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::{fingerprint_file, FileStamp};
use crate::metadata::{is_design_file, FileMetadata, MetadataExtractor};
use crate::tier::{write_atomic, ArtifactKey, Tier, TierStore};
use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the repository directory skipped by tree walks.
pub const REPO_DIR_NAME: &str = ".dgit";

/// One file in the staging manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEntry {
    /// Absolute path at stage time
    pub original_path: PathBuf,
    /// Working-tree-relative path with `/` separators
    pub normalized_path: String,
    /// Size at stage time
    pub size: u64,
    /// Modification time at stage time
    pub modified: DateTime<Utc>,
    /// Hex BLAKE3 fingerprint
    pub fingerprint: String,
    /// Advisory tier from the size policy
    pub assigned_tier: Tier,
    /// An LZ4 copy exists in the hot tier under the fingerprint
    pub precompressed: bool,
    /// Header metadata
    pub metadata: FileMetadata,
    /// When the entry was staged
    pub staged_at: DateTime<Utc>,
}

impl StagedEntry {
    /// Size and mtime captured at stage time.
    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            size: self.size,
            modified: self.modified,
        }
    }

    /// Hot-tier key of the pre-compressed copy.
    pub fn cache_key(&self) -> ArtifactKey {
        ArtifactKey::Fingerprint(self.fingerprint.clone())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, StagedEntry>,
    updated_at: Option<DateTime<Utc>>,
}

/// Result of staging a pattern.
#[derive(Debug, Default)]
pub struct StageOutcome {
    /// Entries added or refreshed
    pub added: Vec<StagedEntry>,
    /// Matched paths that could not be staged, with the reason
    pub failed: Vec<(String, String)>,
}

/// Entry counts per assigned tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagingStats {
    /// Files assigned to hot
    pub hot: usize,
    /// Files assigned to warm
    pub warm: usize,
    /// Files assigned to cold
    pub cold: usize,
    /// Files with a pre-compressed copy
    pub precompressed: usize,
    /// Sum of staged sizes
    pub total_bytes: u64,
}

/// Resolve `path` against `root` and fold `.` and `..` without touching disk.
fn lexical_absolute(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Working-tree-relative form of a path, `/`-separated.
pub fn normalize_path(work_dir: &Path, path: &Path) -> StoreResult<String> {
    let lexical = lexical_absolute(work_dir, path);
    let absolute = std::fs::canonicalize(&lexical).unwrap_or(lexical);
    let relative = absolute.strip_prefix(work_dir).map_err(|_| {
        StoreError::InvalidPattern(format!("{} is outside the working tree", path.display()))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return Err(StoreError::InvalidPattern(format!(
            "{} is the working tree root",
            path.display()
        )));
    }
    Ok(parts.join("/"))
}

fn walk(root: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != REPO_DIR_NAME)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

/// Staged file set plus its persisted manifest.
pub struct StagingArea {
    work_dir: PathBuf,
    manifest_path: PathBuf,
    store: TierStore,
    config: StagingConfig,
    extractor: Arc<dyn MetadataExtractor>,
    entries: BTreeMap<String, StagedEntry>,
}

impl StagingArea {
    /// Open the staging area of a repository and load its manifest.
    pub fn open(
        work_dir: &Path,
        dgit_dir: &Path,
        store: TierStore,
        config: StagingConfig,
        extractor: Arc<dyn MetadataExtractor>,
    ) -> StoreResult<Self> {
        let staging_dir = dgit_dir.join("staging");
        std::fs::create_dir_all(&staging_dir)?;
        let mut area = Self {
            work_dir: std::fs::canonicalize(work_dir)?,
            manifest_path: staging_dir.join("staged.json"),
            store,
            config,
            extractor,
            entries: BTreeMap::new(),
        };
        area.load()?;
        Ok(area)
    }

    /// Reload the manifest, demoting entries whose hot copy has disappeared.
    pub fn load(&mut self) -> StoreResult<()> {
        let manifest: Manifest = match std::fs::read(&self.manifest_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest::default(),
            Err(e) => return Err(e.into()),
        };
        self.entries = manifest.files;

        let mut demoted = 0usize;
        for entry in self.entries.values_mut() {
            if entry.precompressed && !self.store.exists(Tier::Hot, &entry.cache_key()) {
                let from = entry.assigned_tier;
                entry.assigned_tier = from.demote().unwrap_or(Tier::Cold);
                entry.precompressed = false;
                demoted += 1;
                warn!(
                    path = %entry.normalized_path,
                    from = %from,
                    to = %entry.assigned_tier,
                    "Pre-compressed copy missing, demoting staged entry"
                );
            }
        }
        if demoted > 0 {
            self.save()?;
        }
        Ok(())
    }

    /// Persist the manifest atomically.
    pub fn save(&self) -> StoreResult<()> {
        let manifest = Manifest {
            files: self.entries.clone(),
            updated_at: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&self.manifest_path, &bytes)
    }

    /// Tier assigned to a file of `size` bytes.
    pub fn tier_for_size(&self, size: u64) -> Tier {
        if size < self.config.hot_threshold_bytes {
            Tier::Hot
        } else if size < self.config.warm_threshold_bytes {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    /// Stage one file and persist the manifest.
    pub fn stage(&mut self, path: &Path) -> StoreResult<StagedEntry> {
        let entry = self.stage_one(path)?;
        self.save()?;
        Ok(entry)
    }

    fn stage_one(&mut self, path: &Path) -> StoreResult<StagedEntry> {
        if !is_design_file(path) {
            return Err(StoreError::NotDesignFile(path.to_path_buf()));
        }
        let absolute = lexical_absolute(&self.work_dir, path);
        if !absolute.is_file() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        let normalized = normalize_path(&self.work_dir, &absolute)?;
        let (fingerprint, stamp) = fingerprint_file(&absolute, self.config.sample_bytes)?;
        let assigned_tier = self.tier_for_size(stamp.size);
        let metadata = self.extractor.extract(&absolute);

        let mut entry = StagedEntry {
            original_path: absolute,
            normalized_path: normalized.clone(),
            size: stamp.size,
            modified: stamp.modified,
            fingerprint: fingerprint.to_hex(),
            assigned_tier,
            precompressed: false,
            metadata,
            staged_at: Utc::now(),
        };

        if assigned_tier == Tier::Hot {
            match self.precompress(&entry) {
                Ok(written) => {
                    entry.precompressed = true;
                    if written {
                        self.invalidate_copies(&entry);
                    }
                }
                Err(e) => {
                    warn!(path = %normalized, error = %e, "Pre-compression failed, commit will read the file");
                }
            }
        }

        if let Some(previous) = self.entries.insert(normalized.clone(), entry.clone()) {
            if previous.fingerprint != entry.fingerprint {
                self.release(&previous)?;
            }
        }
        debug!(path = %normalized, tier = %assigned_tier, precompressed = entry.precompressed, "Staged file");
        Ok(entry)
    }

    /// Write or reuse the hot-tier LZ4 copy for `entry`.
    /// Returns true when a new copy was written.
    fn precompress(&self, entry: &StagedEntry) -> StoreResult<bool> {
        let key = entry.cache_key();
        if self.store.exists(Tier::Hot, &key) {
            match self.store.get(Tier::Hot, &key) {
                Ok(cached) => {
                    if same_content(&cached, &entry.original_path)? {
                        debug!(path = %entry.normalized_path, "Reusing pre-compressed copy");
                        return Ok(false);
                    }
                    warn!(path = %entry.normalized_path, "Fingerprint collision, rewriting pre-compressed copy");
                }
                Err(e @ StoreError::Corrupt { .. }) => {
                    warn!(path = %entry.normalized_path, error = %e, "Rewriting corrupt pre-compressed copy");
                }
                Err(e) => return Err(e),
            }
        }
        let source = &entry.original_path;
        self.store.put_segments(&key, |w| {
            w.append_reader(BufReader::new(File::open(source)?))?;
            Ok(())
        })?;
        Ok(true)
    }

    /// After `owner` rewrote the copy under its fingerprint, no other entry
    /// may splice it: their bytes are not known to match.
    fn invalidate_copies(&mut self, owner: &StagedEntry) {
        for other in self.entries.values_mut() {
            if other.precompressed
                && other.fingerprint == owner.fingerprint
                && other.normalized_path != owner.normalized_path
            {
                other.precompressed = false;
                debug!(
                    path = %other.normalized_path,
                    by = %owner.normalized_path,
                    "Pre-compressed copy replaced, commit will read the file"
                );
            }
        }
    }

    /// Remove a pre-compressed copy unless another staged entry still uses it.
    fn release(&self, entry: &StagedEntry) -> StoreResult<()> {
        if !entry.precompressed {
            return Ok(());
        }
        let shared = self
            .entries
            .values()
            .any(|e| e.precompressed && e.fingerprint == entry.fingerprint);
        if !shared {
            self.store.remove(Tier::Hot, &entry.cache_key())?;
        }
        Ok(())
    }

    /// Stage every design file matching `pattern`.
    ///
    /// `.` stages the whole working tree. An existing file or directory is
    /// staged directly. Anything else is a glob over working-tree paths.
    /// Non-design files are skipped; it is an error when nothing matched.
    pub fn stage_pattern(&mut self, pattern: &str) -> StoreResult<StageOutcome> {
        let candidates = self.match_pattern(pattern)?;
        if candidates.is_empty() {
            return Err(StoreError::NotFound(format!(
                "no design files match pattern: {}",
                pattern
            )));
        }

        let mut outcome = StageOutcome::default();
        for path in candidates {
            match self.stage_one(&path) {
                Ok(entry) => outcome.added.push(entry),
                Err(e) => outcome.failed.push((path.display().to_string(), e.to_string())),
            }
        }
        self.save()?;
        Ok(outcome)
    }

    fn match_pattern(&self, pattern: &str) -> StoreResult<Vec<PathBuf>> {
        let direct = lexical_absolute(&self.work_dir, Path::new(pattern));
        if pattern == "." || direct.is_dir() {
            let root = if pattern == "." {
                self.work_dir.clone()
            } else {
                direct
            };
            return Ok(walk(&root).filter(|p| is_design_file(p)).collect());
        }
        if direct.is_file() {
            return Ok(vec![direct]);
        }

        let matcher = Glob::new(pattern)
            .map_err(|e| StoreError::InvalidPattern(e.to_string()))?
            .compile_matcher();
        Ok(walk(&self.work_dir)
            .filter(|p| is_design_file(p))
            .filter(|p| {
                p.strip_prefix(&self.work_dir)
                    .is_ok_and(|rel| matcher.is_match(rel))
            })
            .collect())
    }

    /// Remove a path from the staging area.
    pub fn unstage(&mut self, path: &Path) -> StoreResult<()> {
        let normalized = normalize_path(&self.work_dir, path)
            .map_err(|_| StoreError::NotStaged(path.to_path_buf()))?;
        let entry = self
            .entries
            .remove(&normalized)
            .ok_or_else(|| StoreError::NotStaged(path.to_path_buf()))?;
        self.release(&entry)?;
        self.save()?;
        debug!(path = %normalized, "Unstaged file");
        Ok(())
    }

    /// Staged entries ordered by normalized path.
    pub fn list(&self) -> Vec<&StagedEntry> {
        self.entries.values().collect()
    }

    /// True if `path` is staged.
    pub fn contains(&self, path: &Path) -> bool {
        normalize_path(&self.work_dir, path).is_ok_and(|n| self.entries.contains_key(&n))
    }

    /// Number of staged files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and persist the empty manifest.
    /// Pre-compressed copies stay in the hot tier for dedup.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        self.save()
    }

    /// Per-tier counts of the staged set.
    pub fn stats(&self) -> StagingStats {
        let mut stats = StagingStats::default();
        for entry in self.entries.values() {
            match entry.assigned_tier {
                Tier::Hot => stats.hot += 1,
                Tier::Warm => stats.warm += 1,
                Tier::Cold => stats.cold += 1,
            }
            if entry.precompressed {
                stats.precompressed += 1;
            }
            stats.total_bytes += entry.size;
        }
        stats
    }
}

fn same_content(cached: &[u8], path: &Path) -> StoreResult<bool> {
    let mut current = Vec::with_capacity(cached.len());
    File::open(path)?
        .take(cached.len() as u64 + 1)
        .read_to_end(&mut current)?;
    Ok(current == cached)
}
