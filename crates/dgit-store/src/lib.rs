#![warn(missing_docs)]

//! DGit storage engine: versioned history for binary design files.
//!
//! Commit path: Stage (fingerprint, tier, LZ4 copy) → Strategy (binary delta → format delta → snapshot) → Record → HEAD
//! Restore path: Resolve → Plan (snapshot: hot → warm → zip → cold; delta: chain) → Reconstruct → Select → Write
//!
//! Hot snapshots are re-encoded into Zstd tiers by a background worker.

pub mod background;
pub mod bundle;
pub mod commit;
pub mod compression;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod legacy;
pub mod metadata;
pub mod repository;
pub mod restore;
pub mod staging;
pub mod strategy;
pub mod tier;

pub use background::{MigrationHandle, MigrationStats, MigrationTask, MigrationWorker};
pub use commit::CompressionEngine;
pub use compression::{Codec, DeltaCompressor};
pub use config::{
    BackgroundConfig, CommitConfig, RepoConfig, SnapshotFormat, StagingConfig, TierConfig,
};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use fingerprint::{FileStamp, Fingerprint};
pub use history::{
    CommitRecord, CompressionArtifact, FileEntry, HistoryStatistics, SizeBreakdown, Strategy,
    VersionHistory,
};
pub use metadata::{DesignKind, DesignMetadata, FileMetadata, HeaderSniffer, MetadataExtractor};
pub use repository::{RepoStatus, Repository};
pub use restore::{MatchKind, RestoreEngine, RestoreMethod, RestorePlan, RestoreReport};
pub use staging::{StageOutcome, StagedEntry, StagingArea, StagingStats};
pub use strategy::{CommitContext, CommitFile, StrategyCandidate};
pub use tier::{ArtifactKey, Tier, TierStore, TierUsage};
