//! Run configuration for the walker and the upload scheduler

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default number of transfers in flight per round
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default per-item deadline (5 minutes)
pub const DEFAULT_ITEM_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Default per-round deadline (10 minutes)
pub const DEFAULT_ROUND_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Default throttle for progress snapshots
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// What a single transfer unit represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// One unit per file
    #[default]
    Files,
    /// One recursive unit per first-level folder
    Folders,
}

impl TransferMode {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Files => "files",
            TransferMode::Folders => "folders",
        }
    }
}

/// Configuration for one inventory + upload run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root directory to inventory
    pub root: PathBuf,

    /// Number of walker threads
    /// 0 means auto-detect (available parallelism - 1, at least 1)
    pub num_workers: usize,

    /// Keep per-file records after scanning
    /// Folder-mode uploads do not need them and can save memory
    pub store_files: bool,

    /// Whether to upload after the scan
    pub upload: bool,

    /// Per-file or per-first-level-folder uploads
    pub mode: TransferMode,

    /// Destination prefix on the remote store
    pub destination: Option<String>,

    /// Maximum transfers in flight per round
    pub concurrency: usize,

    /// Check the destination before transferring and skip units already there
    pub check_exists: bool,

    /// Deadline for one transfer unit in milliseconds
    pub item_timeout_ms: u64,

    /// Deadline for one whole round in milliseconds
    pub round_timeout_ms: u64,

    /// Drop path buffers of settled units as soon as they settle
    pub release_settled: bool,

    /// Minimum interval between progress snapshots in milliseconds
    pub progress_interval_ms: u64,

    /// Inventory database path
    pub db_path: Option<PathBuf>,

    /// Skip units recorded as done in the inventory database
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            num_workers: 0,
            store_files: true,
            upload: false,
            mode: TransferMode::Files,
            destination: None,
            concurrency: DEFAULT_CONCURRENCY,
            check_exists: false,
            item_timeout_ms: DEFAULT_ITEM_TIMEOUT_MS,
            round_timeout_ms: DEFAULT_ROUND_TIMEOUT_MS,
            release_settled: false,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            db_path: None,
            resume: false,
        }
    }
}

impl RunConfig {
    /// Create a new config for the given root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Create a config builder
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::new()
    }

    /// Get the effective number of walker threads
    pub fn effective_workers(&self) -> usize {
        if self.num_workers == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        } else {
            self.num_workers
        }
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    /// Whether per-file records must be kept for the upload phase
    pub fn needs_file_records(&self) -> bool {
        self.store_files || (self.upload && self.mode == TransferMode::Files)
    }

    /// Validate the configuration before any work begins
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRoot);
        }
        if !self.upload {
            return Ok(());
        }
        if self.destination.as_deref().map_or(true, |d| d.trim().is_empty()) {
            return Err(ConfigError::MissingDestination);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.item_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout { name: "item" });
        }
        if self.round_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout { name: "round" });
        }
        if self.round_timeout_ms < self.item_timeout_ms {
            return Err(ConfigError::RoundShorterThanItem {
                round_ms: self.round_timeout_ms,
                item_ms: self.item_timeout_ms,
            });
        }
        Ok(())
    }
}

/// Builder for RunConfig
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root directory
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = root.into();
        self
    }

    /// Set the number of walker threads
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    /// Keep or discard per-file records
    pub fn store_files(mut self, enabled: bool) -> Self {
        self.config.store_files = enabled;
        self
    }

    /// Enable uploads to the given destination
    pub fn upload_to(mut self, destination: impl Into<String>) -> Self {
        self.config.upload = true;
        self.config.destination = Some(destination.into());
        self
    }

    /// Set the transfer mode
    pub fn mode(mut self, mode: TransferMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the number of transfers per round
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Enable or disable the destination existence check
    pub fn check_exists(mut self, enabled: bool) -> Self {
        self.config.check_exists = enabled;
        self
    }

    /// Set the per-item deadline
    pub fn item_timeout(mut self, timeout: Duration) -> Self {
        self.config.item_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-round deadline
    pub fn round_timeout(mut self, timeout: Duration) -> Self {
        self.config.round_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Release settled unit buffers immediately
    pub fn release_settled(mut self, enabled: bool) -> Self {
        self.config.release_settled = enabled;
        self
    }

    /// Set the progress snapshot interval
    pub fn progress_interval_ms(mut self, interval: u64) -> Self {
        self.config.progress_interval_ms = interval;
        self
    }

    /// Set the inventory database path
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    /// Skip units already recorded as done
    pub fn resume(mut self, enabled: bool) -> Self {
        self.config.resume = enabled;
        self
    }

    /// Build the config
    pub fn build(self) -> RunConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert!(config.root.as_os_str().is_empty());
        assert!(!config.upload);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.mode, TransferMode::Files);
        assert_eq!(config.progress_interval_ms, 1000);
    }

    #[test]
    fn test_effective_workers() {
        let config = RunConfig::builder().num_workers(6).build();
        assert_eq!(config.effective_workers(), 6);

        let auto_config = RunConfig::default();
        assert!(auto_config.effective_workers() >= 1);
    }

    #[test]
    fn test_config_builder() {
        let config = RunConfig::builder()
            .root("/data")
            .upload_to("remote:bucket")
            .mode(TransferMode::Folders)
            .concurrency(3)
            .check_exists(true)
            .item_timeout(Duration::from_secs(2))
            .round_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.root, PathBuf::from("/data"));
        assert!(config.upload);
        assert_eq!(config.destination.as_deref(), Some("remote:bucket"));
        assert_eq!(config.mode, TransferMode::Folders);
        assert_eq!(config.item_timeout(), Duration::from_secs(2));
        assert_eq!(config.round_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert_eq!(RunConfig::default().validate(), Err(ConfigError::EmptyRoot));

        let mut config = RunConfig::new("/data");
        config.upload = true;
        assert_eq!(config.validate(), Err(ConfigError::MissingDestination));

        let config = RunConfig::builder().root("/data").upload_to("dst").concurrency(0).build();
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));

        let config = RunConfig::builder()
            .root("/data")
            .upload_to("dst")
            .item_timeout(Duration::from_secs(10))
            .round_timeout(Duration::from_secs(1))
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RoundShorterThanItem { .. })
        ));
    }

    #[test]
    fn test_scan_only_ignores_upload_settings() {
        let config = RunConfig::builder().root("/data").concurrency(0).build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_needs_file_records() {
        let config = RunConfig::builder()
            .root("/data")
            .store_files(false)
            .upload_to("dst")
            .build();
        assert!(config.needs_file_records());

        let config = RunConfig::builder()
            .root("/data")
            .store_files(false)
            .upload_to("dst")
            .mode(TransferMode::Folders)
            .build();
        assert!(!config.needs_file_records());
    }
}
