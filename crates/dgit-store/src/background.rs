//! Background tier migration.
//!
//! After a fast-snapshot commit the engine submits a [`MigrationTask`]
//! without waiting. The worker sleeps for the idle delay, decodes the hot
//! LZ4 snapshot, re-encodes it with Zstd into the warm (or cold) tier and
//! repoints the commit record. The hot copy is never removed. Failures are
//! logged and counted; nothing is reported back to the committer.

use crate::bundle::Bundle;
use crate::compression;
use crate::config::BackgroundConfig;
use crate::error::{StoreError, StoreResult};
use crate::history::VersionHistory;
use crate::tier::{ArtifactKey, Tier, TierStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A work item for the migration worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationTask {
    /// Re-encode the hot snapshot of `version` into `target`.
    Migrate {
        /// Committed version
        version: u64,
        /// Warm or cold
        target: Tier,
    },
    /// Stop after the tasks already queued.
    Shutdown,
}

/// Statistics published by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationStats {
    /// Migrations that completed and updated the record
    pub completed: u64,
    /// Migrations that failed
    pub failed: u64,
    /// Hot bytes read
    pub bytes_before: u64,
    /// Bytes written to the target tier
    pub bytes_after: u64,
}

impl MigrationStats {
    /// Hot size over target size; above 1.0 means the target copy is smaller.
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_after > 0 {
            self.bytes_before as f64 / self.bytes_after as f64
        } else {
            1.0
        }
    }
}

/// Submission side of the worker.
#[derive(Clone)]
pub struct MigrationHandle {
    sender: mpsc::Sender<MigrationTask>,
    stats: watch::Receiver<MigrationStats>,
    dropped: Arc<AtomicU64>,
}

impl MigrationHandle {
    /// Queue a migration without blocking. A full or closed queue drops the
    /// task; the hot copy remains authoritative.
    pub fn submit(&self, version: u64, target: Tier) -> bool {
        match self.sender.try_send(MigrationTask::Migrate { version, target }) {
            Ok(()) => {
                debug!(version, %target, "Queued tier migration");
                true
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(version, error = %e, "Dropped tier migration");
                false
            }
        }
    }

    /// Ask the worker to stop once queued tasks are done.
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.sender
            .send(MigrationTask::Shutdown)
            .await
            .map_err(|_| StoreError::Io(std::io::Error::other("migration worker shut down")))
    }

    /// Snapshot of the worker's statistics.
    pub fn stats(&self) -> MigrationStats {
        self.stats.borrow().clone()
    }

    /// Submissions dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True while the worker accepts tasks.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Migration worker state.
pub struct MigrationWorker {
    store: TierStore,
    history: VersionHistory,
    idle_delay: Duration,
    stats_tx: watch::Sender<MigrationStats>,
    stats: MigrationStats,
}

impl MigrationWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(
        config: &BackgroundConfig,
        store: TierStore,
        history: VersionHistory,
    ) -> (MigrationHandle, JoinHandle<()>) {
        let (task_tx, task_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (stats_tx, stats_rx) = watch::channel(MigrationStats::default());

        let worker = MigrationWorker {
            store,
            history,
            idle_delay: Duration::from_millis(config.idle_delay_ms),
            stats_tx,
            stats: MigrationStats::default(),
        };
        let join = tokio::spawn(worker.run(task_rx));

        (
            MigrationHandle {
                sender: task_tx,
                stats: stats_rx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            join,
        )
    }

    async fn run(mut self, mut rx: mpsc::Receiver<MigrationTask>) {
        while let Some(task) = rx.recv().await {
            match task {
                MigrationTask::Migrate { version, target } => {
                    tokio::time::sleep(self.idle_delay).await;
                    self.migrate(version, target).await;
                }
                MigrationTask::Shutdown => break,
            }
            let _ = self.stats_tx.send(self.stats.clone());
        }
        debug!("Migration worker stopped");
    }

    async fn migrate(&mut self, version: u64, target: Tier) {
        let store = self.store.clone();
        let history = self.history.clone();
        let job = tokio::task::spawn_blocking(move || migrate_version(&store, &history, version, target));
        match job.await {
            Ok(Ok((before, after))) => {
                self.stats.completed += 1;
                self.stats.bytes_before += before;
                self.stats.bytes_after += after;
                info!(version, %target, before, after, "Migrated snapshot");
            }
            Ok(Err(e)) => {
                self.stats.failed += 1;
                warn!(version, %target, error = %e, "Tier migration failed");
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(version, %target, error = %e, "Tier migration task panicked");
            }
        }
    }
}

/// Re-encode the hot snapshot of `version` into `target` and repoint the
/// record. Returns (hot bytes, target bytes).
pub fn migrate_version(
    store: &TierStore,
    history: &VersionHistory,
    version: u64,
    target: Tier,
) -> StoreResult<(u64, u64)> {
    if target == Tier::Hot {
        return Err(StoreError::ConfigInvalid(
            "migration target must be warm or cold".to_string(),
        ));
    }
    let key = ArtifactKey::Version(version);
    let encoded = store.get_encoded(Tier::Hot, &key)?;
    let name = TierStore::file_name(Tier::Hot, &key);
    let raw = compression::decompress(&encoded, store.codec(Tier::Hot), &name)?;
    Bundle::parse(&raw, &name)?;
    let written = store.put(target, &key, &raw)?;
    history.update_tier(version, target)?;
    Ok((encoded.len() as u64, written.size))
}
