//! Repository façade tying staging, commit, history and restore together.

use crate::background::{MigrationHandle, MigrationStats, MigrationWorker};
use crate::commit::CompressionEngine;
use crate::config::RepoConfig;
use crate::error::{StoreError, StoreResult};
use crate::history::{CommitRecord, VersionHistory};
use crate::metadata::{HeaderSniffer, MetadataExtractor};
use crate::restore::{RestoreEngine, RestorePlan, RestoreReport};
use crate::staging::{StageOutcome, StagedEntry, StagingArea, StagingStats, REPO_DIR_NAME};
use crate::tier::{Tier, TierStore, TierUsage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Config file name inside `.dgit`.
pub const CONFIG_FILE: &str = "config.toml";

/// Snapshot of repository state for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct RepoStatus {
    /// Staged entries ordered by path
    pub staged: Vec<StagedEntry>,
    /// Per-tier counts of the staged set
    pub staging: StagingStats,
    /// Latest commit
    pub head: Option<CommitRecord>,
    /// How the latest commit would be restored
    pub head_plan: Option<RestorePlan>,
    /// Bytes per cache tier
    pub usage: Vec<(Tier, TierUsage)>,
}

/// An opened DGit repository.
pub struct Repository {
    work_dir: PathBuf,
    dgit_dir: PathBuf,
    config: RepoConfig,
    store: TierStore,
    history: VersionHistory,
    restore: RestoreEngine,
    staging: StagingArea,
    engine: CompressionEngine,
    migration: Option<(MigrationHandle, JoinHandle<()>)>,
}

impl Repository {
    /// Create `.dgit` under `work_dir` with a default config.
    pub fn init(work_dir: &Path) -> StoreResult<Self> {
        Self::init_with_config(work_dir, &RepoConfig::default())
    }

    /// Create `.dgit` under `work_dir` and persist `config` into it.
    pub fn init_with_config(work_dir: &Path, config: &RepoConfig) -> StoreResult<Self> {
        config.validate()?;
        let dgit_dir = work_dir.join(REPO_DIR_NAME);
        if dgit_dir.exists() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("repository already exists at {}", dgit_dir.display()),
            )));
        }
        TierStore::new(dgit_dir.join("cache"), &config.tiers).init()?;
        VersionHistory::new(&dgit_dir).init()?;
        std::fs::create_dir_all(dgit_dir.join("staging"))?;
        config.save(&dgit_dir.join(CONFIG_FILE))?;
        info!(path = %dgit_dir.display(), "Initialized repository");
        Self::open(work_dir)
    }

    /// Open the repository whose `.dgit` lives directly under `work_dir`.
    pub fn open(work_dir: &Path) -> StoreResult<Self> {
        Self::open_with(work_dir, Arc::new(HeaderSniffer))
    }

    /// Open with a custom metadata extractor.
    pub fn open_with(work_dir: &Path, extractor: Arc<dyn MetadataExtractor>) -> StoreResult<Self> {
        let work_dir = std::fs::canonicalize(work_dir)?;
        let dgit_dir = work_dir.join(REPO_DIR_NAME);
        if !dgit_dir.is_dir() {
            return Err(StoreError::NotFound(format!(
                "not a dgit repository: {}",
                work_dir.display()
            )));
        }
        let config = RepoConfig::load_or_default(&dgit_dir.join(CONFIG_FILE));
        Self::assemble(work_dir, dgit_dir, config, extractor)
    }

    /// Walk up from `start` to the nearest directory containing `.dgit`.
    pub fn discover(start: &Path) -> StoreResult<Self> {
        let start = std::fs::canonicalize(start)?;
        let root = start
            .ancestors()
            .find(|dir| dir.join(REPO_DIR_NAME).is_dir())
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "not a dgit repository (or any parent): {}",
                    start.display()
                ))
            })?;
        Self::open(root)
    }

    fn assemble(
        work_dir: PathBuf,
        dgit_dir: PathBuf,
        config: RepoConfig,
        extractor: Arc<dyn MetadataExtractor>,
    ) -> StoreResult<Self> {
        let store = TierStore::new(dgit_dir.join("cache"), &config.tiers);
        store.init()?;
        let history = VersionHistory::new(&dgit_dir);
        history.init()?;
        let restore = RestoreEngine::new(&dgit_dir, store.clone(), history.clone());
        let staging = StagingArea::open(
            &work_dir,
            &dgit_dir,
            store.clone(),
            config.staging.clone(),
            extractor.clone(),
        )?;

        let migration = if config.background.enabled && tokio::runtime::Handle::try_current().is_ok() {
            Some(MigrationWorker::start(
                &config.background,
                store.clone(),
                history.clone(),
            ))
        } else {
            debug!("Background migration disabled");
            None
        };

        let mut engine = CompressionEngine::new(
            &dgit_dir,
            store.clone(),
            history.clone(),
            config.commit.clone(),
            config.author.clone(),
            extractor,
        );
        if let Some((handle, _)) = &migration {
            engine = engine.with_migration(handle.clone());
        }

        Ok(Self {
            work_dir,
            dgit_dir,
            config,
            store,
            history,
            restore,
            staging,
            engine,
            migration,
        })
    }

    /// Working tree root.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The `.dgit` directory.
    pub fn dgit_dir(&self) -> &Path {
        &self.dgit_dir
    }

    /// Effective configuration.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Tier store.
    pub fn store(&self) -> &TierStore {
        &self.store
    }

    /// Commit history.
    pub fn history(&self) -> &VersionHistory {
        &self.history
    }

    /// Restore engine.
    pub fn restorer(&self) -> &RestoreEngine {
        &self.restore
    }

    /// Staging area.
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Stage files matching `pattern`.
    pub fn add(&mut self, pattern: &str) -> StoreResult<StageOutcome> {
        self.staging.stage_pattern(pattern)
    }

    /// Unstage one path.
    pub fn rm(&mut self, path: &Path) -> StoreResult<()> {
        self.staging.unstage(path)
    }

    /// Commit the staged set.
    pub fn commit(&mut self, message: &str) -> StoreResult<CommitRecord> {
        self.engine.commit(&mut self.staging, message)
    }

    /// Commits, newest first, optionally limited.
    pub fn log(&self, limit: Option<usize>) -> StoreResult<Vec<CommitRecord>> {
        let mut records = self.history.list()?;
        if let Some(n) = limit {
            records.truncate(n);
        }
        Ok(records)
    }

    /// Staged files, head commit, its restore plan, and tier usage.
    pub fn status(&self) -> StoreResult<RepoStatus> {
        let current = self.history.current_version()?;
        let head = match current {
            0 => None,
            v => match self.history.get(v) {
                Ok(record) => Some(record),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
        };
        let head_plan = match &head {
            Some(record) => self.restore.plan(record.version).ok(),
            None => None,
        };
        Ok(RepoStatus {
            staged: self.staging.list().into_iter().cloned().collect(),
            staging: self.staging.stats(),
            head,
            head_plan,
            usage: self.store.usage()?,
        })
    }

    /// Restore `reference` into `destination`, or into the working tree.
    pub fn restore(
        &self,
        reference: &str,
        patterns: &[String],
        destination: Option<&Path>,
    ) -> StoreResult<RestoreReport> {
        let destination = match destination {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => std::env::current_dir()?.join(dir),
            None => self.work_dir.clone(),
        };
        self.restore.restore(reference, patterns, &destination)
    }

    /// Migration worker statistics, if the worker is running.
    pub fn migration_stats(&self) -> Option<MigrationStats> {
        self.migration.as_ref().map(|(handle, _)| handle.stats())
    }

    /// Let queued migrations finish, then stop the worker.
    pub async fn drain_migrations(&mut self) -> StoreResult<()> {
        if let Some((handle, join)) = self.migration.take() {
            handle.shutdown().await?;
            join.await
                .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }
}
