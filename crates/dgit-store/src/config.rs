//! Repository configuration (`.dgit/config.toml`).

use crate::error::{StoreError, StoreResult};
use crate::fingerprint::DEFAULT_SAMPLE_BYTES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Author recorded when none is configured.
pub const DEFAULT_AUTHOR: &str = "DGit User";

/// Top-level repository configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Author written into commit records
    pub author: String,
    /// Staging behavior
    pub staging: StagingConfig,
    /// Commit pipeline behavior
    pub commit: CommitConfig,
    /// Codec levels per tier
    pub tiers: TierConfig,
    /// Background migration worker
    pub background: BackgroundConfig,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            author: DEFAULT_AUTHOR.to_string(),
            staging: StagingConfig::default(),
            commit: CommitConfig::default(),
            tiers: TierConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

/// Size thresholds for tier assignment and fingerprint sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Files smaller than this are assigned to the hot tier
    pub hot_threshold_bytes: u64,
    /// Files smaller than this (and not hot) are assigned to the warm tier
    pub warm_threshold_bytes: u64,
    /// Leading bytes hashed into the fingerprint
    pub sample_bytes: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            hot_threshold_bytes: 50 * 1024 * 1024,
            warm_threshold_bytes: 200 * 1024 * 1024,
            sample_bytes: DEFAULT_SAMPLE_BYTES,
        }
    }
}

/// Layout of a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotFormat {
    /// Segmented LZ4 bundle in the hot tier
    Lz4,
    /// Zip archive under `objects/`
    LegacyArchive,
}

/// Strategy selection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Maximum chain length (base snapshot plus deltas)
    pub max_chain_length: u32,
    /// A delta is kept only if compressed/original is at most this
    pub delta_ratio_threshold: f64,
    /// Zstd level for binary and format-aware deltas
    pub delta_level: i32,
    /// Deltas are skipped when the new or parent bundle is larger than this
    pub max_delta_bytes: u64,
    /// Enables the experimental per-file delta for layered formats
    pub format_aware_delta: bool,
    /// Full snapshot layout
    pub snapshot_format: SnapshotFormat,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_chain_length: 5,
            delta_ratio_threshold: 0.3,
            delta_level: 3,
            max_delta_bytes: 1024 * 1024 * 1024,
            format_aware_delta: true,
            snapshot_format: SnapshotFormat::Lz4,
        }
    }
}

/// Zstd levels for the slower tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Warm tier level
    pub warm_level: i32,
    /// Cold tier level
    pub cold_level: i32,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            warm_level: 3,
            cold_level: 19,
        }
    }
}

/// Background migration worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Submit hot-to-warm migrations after fast-snapshot commits
    pub enabled: bool,
    /// Delay before a job starts re-encoding
    pub idle_delay_ms: u64,
    /// Bounded queue capacity; submissions beyond it are dropped
    pub channel_capacity: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_delay_ms: 3000,
            channel_capacity: 64,
        }
    }
}

impl RepoConfig {
    /// Parse a config file, choosing TOML or JSON by extension.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RepoConfig = match ext.to_lowercase().as_str() {
            "toml" => {
                toml::from_str(&contents).map_err(|e| StoreError::ConfigInvalid(e.to_string()))?
            }
            "json" => serde_json::from_str(&contents)
                .map_err(|e| StoreError::ConfigInvalid(e.to_string()))?,
            _ => {
                return Err(StoreError::ConfigInvalid(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring invalid repository config, using defaults");
                Self::default()
            }
        }
    }

    /// Write the config as TOML.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let text =
            toml::to_string_pretty(self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.staging.hot_threshold_bytes > self.staging.warm_threshold_bytes {
            return Err(StoreError::ConfigInvalid(
                "staging.hot_threshold_bytes exceeds staging.warm_threshold_bytes".to_string(),
            ));
        }
        if self.commit.max_chain_length == 0 {
            return Err(StoreError::ConfigInvalid(
                "commit.max_chain_length must be at least 1".to_string(),
            ));
        }
        if !(self.commit.delta_ratio_threshold > 0.0 && self.commit.delta_ratio_threshold <= 1.0) {
            return Err(StoreError::ConfigInvalid(format!(
                "commit.delta_ratio_threshold {} is outside (0, 1]",
                self.commit.delta_ratio_threshold
            )));
        }
        if self.commit.max_delta_bytes == 0 {
            return Err(StoreError::ConfigInvalid(
                "commit.max_delta_bytes must be positive".to_string(),
            ));
        }
        if self.background.channel_capacity == 0 {
            return Err(StoreError::ConfigInvalid(
                "background.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = RepoConfig::default();
        assert_eq!(config.author, "DGit User");
        assert_eq!(config.staging.hot_threshold_bytes, 50 * 1024 * 1024);
        assert_eq!(config.staging.warm_threshold_bytes, 200 * 1024 * 1024);
        assert_eq!(config.staging.sample_bytes, 64 * 1024);
        assert_eq!(config.commit.max_chain_length, 5);
        assert_eq!(config.commit.delta_ratio_threshold, 0.3);
        assert_eq!(config.commit.max_delta_bytes, 1 << 30);
        assert_eq!(config.commit.snapshot_format, SnapshotFormat::Lz4);
        assert_eq!(config.tiers.cold_level, 19);
        assert_eq!(config.background.idle_delay_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml_partial() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
author = "Ada"

[commit]
max_chain_length = 3
snapshot_format = "legacy-archive"
            "#
        )
        .unwrap();

        let config = RepoConfig::from_file(file.path()).unwrap();
        assert_eq!(config.author, "Ada");
        assert_eq!(config.commit.max_chain_length, 3);
        assert_eq!(config.commit.snapshot_format, SnapshotFormat::LegacyArchive);
        assert_eq!(config.commit.delta_ratio_threshold, 0.3);
        assert_eq!(config.tiers.warm_level, 3);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"background": {{"enabled": false, "idle_delay_ms": 10}}}}"#
        )
        .unwrap();

        let config = RepoConfig::from_file(file.path()).unwrap();
        assert!(!config.background.enabled);
        assert_eq!(config.background.idle_delay_ms, 10);
        assert_eq!(config.background.channel_capacity, 64);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = RepoConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, StoreError::ConfigInvalid(_)));
    }

    #[test]
    fn test_invalid_falls_back_to_defaults() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "author = [this is not toml").unwrap();
        assert_eq!(RepoConfig::load_or_default(file.path()), RepoConfig::default());
    }

    #[test]
    fn test_out_of_range_ratio_rejected() {
        let mut config = RepoConfig::default();
        config.commit.delta_ratio_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_delta_limit_rejected() {
        let mut config = RepoConfig::default();
        config.commit.max_delta_bytes = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            StoreError::ConfigInvalid(_)
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = RepoConfig::default();
        config.author = "Grace".to_string();
        config.commit.format_aware_delta = false;
        config.save(&path).unwrap();
        assert_eq!(RepoConfig::from_file(&path).unwrap(), config);
    }
}
