//! Common fixtures for repository integration tests.

#![allow(dead_code)]

use dgit_store::{RepoConfig, Repository};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Repository config with background migration switched off.
pub fn quiet_config() -> RepoConfig {
    let mut config = RepoConfig::default();
    config.background.enabled = false;
    config
}

/// Deterministic, moderately compressible bytes.
pub fn patterned(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32)
        .map(|i| (i.wrapping_mul(31).wrapping_add(seed) % 251) as u8)
        .collect()
}

/// A repository in a temporary working tree.
pub struct TestRepo {
    pub dir: TempDir,
    pub repo: Repository,
}

impl TestRepo {
    pub fn new() -> Self {
        Self::with_config(quiet_config())
    }

    pub fn with_config(config: RepoConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_with_config(dir.path(), &config).unwrap();
        Self { dir, repo }
    }

    /// Write a file relative to the working tree, creating parent dirs.
    pub fn write(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.repo.work_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Stage `rel` and commit it with `message`.
    pub fn commit_file(&mut self, rel: &str, bytes: &[u8], message: &str) -> dgit_store::CommitRecord {
        self.write(rel, bytes);
        self.repo.add(rel).unwrap();
        self.repo.commit(message).unwrap()
    }

    pub fn dgit(&self) -> &Path {
        self.repo.dgit_dir()
    }
}

/// Fresh restore destination.
pub fn destination() -> TempDir {
    tempfile::tempdir().unwrap()
}
