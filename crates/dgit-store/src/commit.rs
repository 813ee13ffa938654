//! Commit pipeline: staged files in, one durable version out.
//!
//! The engine tries each [`StrategyCandidate`] in order and keeps the first
//! artifact. A version only becomes visible once its record is written and
//! `VERSION`/`HEAD` advance; any failure before that removes what was written.

use crate::background::MigrationHandle;
use crate::config::CommitConfig;
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::commit_hash;
use crate::history::{CommitRecord, FileEntry, Strategy, VersionHistory};
use crate::legacy;
use crate::metadata::MetadataExtractor;
use crate::restore::RestoreEngine;
use crate::staging::StagingArea;
use crate::strategy::{self, CommitContext, CommitFile, StrategyCandidate};
use crate::tier::{ArtifactKey, Tier, TierStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Produces commits from a staging area.
pub struct CompressionEngine {
    dgit_dir: PathBuf,
    store: TierStore,
    history: VersionHistory,
    restore: RestoreEngine,
    config: CommitConfig,
    author: String,
    extractor: Arc<dyn MetadataExtractor>,
    candidates: Vec<Box<dyn StrategyCandidate>>,
    migration: Option<MigrationHandle>,
}

impl CompressionEngine {
    /// Engine for one repository.
    pub fn new(
        dgit_dir: impl Into<PathBuf>,
        store: TierStore,
        history: VersionHistory,
        config: CommitConfig,
        author: impl Into<String>,
        extractor: Arc<dyn MetadataExtractor>,
    ) -> Self {
        let dgit_dir = dgit_dir.into();
        let restore = RestoreEngine::new(dgit_dir.clone(), store.clone(), history.clone());
        let candidates = strategy::candidates(&config);
        Self {
            dgit_dir,
            store,
            history,
            restore,
            config,
            author: author.into(),
            extractor,
            candidates,
            migration: None,
        }
    }

    /// Hand fast snapshots to a migration worker after each commit.
    pub fn with_migration(mut self, handle: MigrationHandle) -> Self {
        self.migration = Some(handle);
        self
    }

    /// Strategies tried, in order.
    pub fn strategies(&self) -> Vec<Strategy> {
        self.candidates.iter().map(|c| c.strategy()).collect()
    }

    fn parent_chain_length(&self, parent: Option<&CommitRecord>) -> u32 {
        let Some(parent) = parent else {
            return 0;
        };
        match self.history.chain_length(parent.version) {
            Ok(length) => length,
            Err(e) => {
                warn!(version = parent.version, error = %e, "Cannot measure delta chain, forcing snapshot");
                self.config.max_chain_length
            }
        }
    }

    fn select(&self, ctx: &CommitContext<'_>) -> StoreResult<crate::history::CompressionArtifact> {
        let last = self.candidates.len().saturating_sub(1);
        for (i, candidate) in self.candidates.iter().enumerate() {
            let started = Instant::now();
            match candidate.attempt(ctx) {
                Ok(Some(mut artifact)) => {
                    artifact.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    return Ok(artifact);
                }
                Ok(None) => {
                    debug!(strategy = %candidate.strategy(), "Strategy not applicable");
                }
                Err(e @ StoreError::StrategyRejected { .. }) => {
                    debug!(error = %e, "Falling back to next strategy");
                }
                Err(e) if i < last => {
                    warn!(strategy = %candidate.strategy(), error = %e, "Strategy failed, falling back");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::CompressionFailed(
            "no storage strategy produced an artifact".to_string(),
        ))
    }

    fn file_entries(&self, files: &[CommitFile]) -> BTreeMap<String, FileEntry> {
        files
            .iter()
            .map(|f| {
                let metadata = if f.unchanged_since_staging() {
                    f.entry.metadata.clone()
                } else {
                    self.extractor.extract(&f.entry.original_path)
                };
                (
                    f.entry.normalized_path.clone(),
                    FileEntry {
                        size: f.stamp.size,
                        modified: f.stamp.modified,
                        metadata,
                    },
                )
            })
            .collect()
    }

    fn discard(&self, record: &CommitRecord) {
        let artifact = self.dgit_dir.join(&record.artifact.output_id);
        if let Err(e) = std::fs::remove_file(&artifact) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %artifact.display(), error = %e, "Failed to remove artifact of aborted commit");
            }
        }
        if let Err(e) = self.history.remove_record(record.version) {
            warn!(version = record.version, error = %e, "Failed to remove record of aborted commit");
        }
    }

    /// Remove anything an interrupted commit left behind for `version`.
    /// Versions above `VERSION` are never visible, so none of it is live.
    fn clear_leftovers(&self, version: u64) -> StoreResult<()> {
        let key = ArtifactKey::Version(version);
        let mut removed = 0usize;
        for tier in Tier::ALL {
            if self.store.remove(tier, &key)? {
                removed += 1;
            }
        }

        let objects = self.dgit_dir.join("objects");
        let mut stale = vec![objects.join(legacy::archive_name(version))];
        let prefix = format!("v{}_from_", version);
        match std::fs::read_dir(objects.join("deltas")) {
            Ok(dir) => {
                for entry in dir {
                    let entry = entry?;
                    if entry.file_name().to_string_lossy().starts_with(&prefix) {
                        stale.push(entry.path());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for path in stale {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.history.remove_record(version)?;

        if removed > 0 {
            warn!(version, removed, "Removed artifacts of an interrupted commit");
        }
        Ok(())
    }

    /// Commit everything staged as the next version.
    #[instrument(skip(self, staging), fields(staged = staging.len()))]
    pub fn commit(&self, staging: &mut StagingArea, message: &str) -> StoreResult<CommitRecord> {
        if staging.is_empty() {
            return Err(StoreError::NothingStaged);
        }
        let version = self.history.current_version()? + 1;
        let parent = match version {
            1 => None,
            _ => match self.history.get(version - 1) {
                Ok(record) => Some(record),
                Err(StoreError::NotFound(_)) => {
                    warn!(version = version - 1, "Parent record missing, committing a full snapshot");
                    None
                }
                Err(e) => return Err(e),
            },
        };
        let parent_chain_length = self.parent_chain_length(parent.as_ref());
        let parent_hash = self.history.head()?;
        self.clear_leftovers(version)?;

        let files = staging
            .list()
            .into_iter()
            .map(CommitFile::load)
            .collect::<StoreResult<Vec<_>>>()?;
        let migration_target = files
            .iter()
            .map(|f| f.entry.assigned_tier)
            .max()
            .unwrap_or(Tier::Hot)
            .max(Tier::Warm);

        let ctx = CommitContext::new(
            version,
            parent.as_ref(),
            parent_chain_length,
            &files,
            &self.dgit_dir,
            &self.store,
            &self.config,
            &self.restore,
        );
        let artifact = self.select(&ctx)?;

        let file_entries = self.file_entries(&files);
        let hash = commit_hash(
            message,
            version,
            files
                .iter()
                .map(|f| (f.entry.normalized_path.as_str(), &f.stamp)),
        );
        let record = CommitRecord {
            version,
            hash,
            message: message.to_string(),
            author: self.author.clone(),
            timestamp: Utc::now(),
            file_count: files.len(),
            files: file_entries,
            parent_hash,
            artifact,
        };

        if let Err(e) = self
            .history
            .write_record(&record)
            .and_then(|_| self.history.advance(&record))
        {
            self.discard(&record);
            return Err(e);
        }

        if let Err(e) = staging.clear() {
            warn!(error = %e, "Commit succeeded but staging area was not cleared");
        }

        if record.artifact.strategy == Strategy::FastSnapshot {
            if let Some(handle) = &self.migration {
                handle.submit(version, migration_target);
            }
        }

        info!(
            version,
            hash = %record.hash,
            strategy = %record.artifact.strategy,
            ratio = record.artifact.compression_ratio,
            elapsed_ms = record.artifact.elapsed_ms,
            "Committed"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StagingConfig, TierConfig};
    use crate::metadata::HeaderSniffer;
    use crate::staging::REPO_DIR_NAME;
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        work: PathBuf,
        dgit: PathBuf,
        store: TierStore,
        history: VersionHistory,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work = std::fs::canonicalize(dir.path()).unwrap();
        let dgit = work.join(REPO_DIR_NAME);
        let store = TierStore::new(dgit.join("cache"), &TierConfig::default());
        store.init().unwrap();
        let history = VersionHistory::new(&dgit);
        history.init().unwrap();
        Fixture {
            _dir: dir,
            work,
            dgit,
            store,
            history,
        }
    }

    fn engine(f: &Fixture, config: CommitConfig) -> CompressionEngine {
        CompressionEngine::new(
            &f.dgit,
            f.store.clone(),
            f.history.clone(),
            config,
            "tester",
            Arc::new(HeaderSniffer),
        )
    }

    fn staging(f: &Fixture) -> StagingArea {
        StagingArea::open(
            &f.work,
            &f.dgit,
            f.store.clone(),
            StagingConfig::default(),
            Arc::new(HeaderSniffer),
        )
        .unwrap()
    }

    #[test]
    fn empty_staging_is_rejected() {
        let f = fixture();
        let err = engine(&f, CommitConfig::default())
            .commit(&mut staging(&f), "nothing")
            .unwrap_err();
        assert!(matches!(err, StoreError::NothingStaged));
        assert_eq!(f.history.current_version().unwrap(), 0);
    }

    #[test]
    fn first_commit_is_fast_snapshot() {
        let f = fixture();
        std::fs::write(f.work.join("a.ai"), vec![7u8; 4096]).unwrap();
        let mut area = staging(&f);
        area.stage(Path::new("a.ai")).unwrap();

        let record = engine(&f, CommitConfig::default())
            .commit(&mut area, "first")
            .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.author, "tester");
        assert_eq!(record.hash.len(), 12);
        assert_eq!(record.parent_hash, None);
        assert_eq!(record.artifact.strategy, Strategy::FastSnapshot);
        assert_eq!(record.artifact.tier, Some(Tier::Hot));
        assert!(f.dgit.join(&record.artifact.output_id).is_file());
        assert!(area.is_empty());
        assert_eq!(f.history.head().unwrap(), Some(record.hash.clone()));
    }

    #[test]
    fn small_edit_commits_as_delta() {
        let f = fixture();
        let mut content: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(f.work.join("a.psd"), &content).unwrap();
        let eng = engine(&f, CommitConfig::default());
        let mut area = staging(&f);
        area.stage(Path::new("a.psd")).unwrap();
        let first = eng.commit(&mut area, "v1").unwrap();

        content[100] ^= 0xff;
        std::fs::write(f.work.join("a.psd"), &content).unwrap();
        area.stage(Path::new("a.psd")).unwrap();
        let second = eng.commit(&mut area, "v2").unwrap();

        assert!(second.artifact.strategy.is_delta());
        assert_eq!(second.artifact.parent_version, Some(1));
        assert_eq!(second.parent_hash, Some(first.hash));
        assert!(second.artifact.compression_ratio <= 0.3);
    }

    #[test]
    fn strategy_order_follows_config() {
        let f = fixture();
        assert_eq!(
            engine(&f, CommitConfig::default()).strategies(),
            vec![Strategy::BinaryDelta, Strategy::FormatDelta, Strategy::FastSnapshot]
        );
        let no_format = CommitConfig {
            format_aware_delta: false,
            ..CommitConfig::default()
        };
        assert_eq!(
            engine(&f, no_format).strategies(),
            vec![Strategy::BinaryDelta, Strategy::FastSnapshot]
        );
    }

    #[test]
    fn leftovers_of_interrupted_commit_are_cleared() {
        let f = fixture();
        let mut content: Vec<u8> = (0..50_000u32).map(|i| (i * 17 % 241) as u8).collect();
        std::fs::write(f.work.join("a.psd"), &content).unwrap();
        let eng = engine(&f, CommitConfig::default());
        let mut area = staging(&f);
        area.stage(Path::new("a.psd")).unwrap();
        eng.commit(&mut area, "v1").unwrap();

        let key = ArtifactKey::Version(2);
        f.store.put(Tier::Hot, &key, b"stale").unwrap();
        f.store.put(Tier::Warm, &key, b"stale").unwrap();
        let stale_delta = f.dgit.join("objects/deltas/v2_from_v1.fdelta");
        let stale_zip = f.dgit.join("objects").join(legacy::archive_name(2));
        std::fs::write(&stale_delta, b"stale").unwrap();
        std::fs::write(&stale_zip, b"stale").unwrap();
        std::fs::write(f.history.record_path(2), b"{}").unwrap();

        content[7] ^= 0x01;
        std::fs::write(f.work.join("a.psd"), &content).unwrap();
        area.stage(Path::new("a.psd")).unwrap();
        let second = eng.commit(&mut area, "v2").unwrap();

        assert_eq!(second.artifact.strategy, Strategy::BinaryDelta);
        assert!(!f.store.exists(Tier::Hot, &key));
        assert!(!f.store.exists(Tier::Warm, &key));
        assert!(!stale_delta.exists());
        assert!(!stale_zip.exists());
        assert!(f.dgit.join(&second.artifact.output_id).is_file());
    }

    #[test]
    fn oversized_bundle_skips_delta() {
        let f = fixture();
        let mut content: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(f.work.join("a.blend"), &content).unwrap();
        let config = CommitConfig {
            max_delta_bytes: 8 * 1024,
            ..CommitConfig::default()
        };
        let eng = engine(&f, config);
        let mut area = staging(&f);
        area.stage(Path::new("a.blend")).unwrap();
        eng.commit(&mut area, "v1").unwrap();

        content[100] ^= 0xff;
        std::fs::write(f.work.join("a.blend"), &content).unwrap();
        area.stage(Path::new("a.blend")).unwrap();
        let second = eng.commit(&mut area, "v2").unwrap();
        assert_eq!(second.artifact.strategy, Strategy::FastSnapshot);
        assert_eq!(second.artifact.parent_version, None);
    }

    #[test]
    fn missing_source_aborts_without_advancing() {
        let f = fixture();
        std::fs::write(f.work.join("a.fig"), b"fig").unwrap();
        let mut area = staging(&f);
        area.stage(Path::new("a.fig")).unwrap();
        std::fs::remove_file(f.work.join("a.fig")).unwrap();

        let err = engine(&f, CommitConfig::default())
            .commit(&mut area, "gone")
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(f.history.current_version().unwrap(), 0);
        assert_eq!(area.len(), 1);
    }
}
