//! Error types for the inventory walker and the upload scheduler

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error kinds that can occur while probing the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorKind {
    /// Permission denied when accessing a file or directory
    PermissionDenied,
    /// File or directory not found
    NotFound,
    /// I/O error during file operations
    IoError,
    /// Path is not a directory where one was expected
    NotADirectory,
    /// Invalid path encoding
    InvalidPath,
}

/// A recoverable error raised by a filesystem probe.
///
/// Entry and subtree errors never abort a walk; the walker counts them and
/// moves on. Only a failure on the scan root itself is fatal.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message} (path: {path:?})")]
pub struct ScanError {
    /// The kind of error
    pub kind: ScanErrorKind,
    /// The path where the error occurred
    pub path: Option<PathBuf>,
    /// Human-readable error message
    pub message: String,
}

impl ScanError {
    /// Create a new scan error
    pub fn new(kind: ScanErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(path: PathBuf) -> Self {
        Self::new(
            ScanErrorKind::NotFound,
            Some(path.clone()),
            format!("Not found: {:?}", path),
        )
    }

    /// Create a not-a-directory error
    pub fn not_a_directory(path: PathBuf) -> Self {
        Self::new(
            ScanErrorKind::NotADirectory,
            Some(path.clone()),
            format!("Not a directory: {:?}", path),
        )
    }

    /// Attach a path to an error that was created without one
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ScanErrorKind::PermissionDenied,
            std::io::ErrorKind::NotFound => ScanErrorKind::NotFound,
            _ => ScanErrorKind::IoError,
        };
        Self::new(kind, None, err.to_string())
    }
}

impl From<walkdir::Error> for ScanError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf());
        let kind = match err.io_error().map(|e| e.kind()) {
            Some(std::io::ErrorKind::PermissionDenied) => ScanErrorKind::PermissionDenied,
            Some(std::io::ErrorKind::NotFound) => ScanErrorKind::NotFound,
            _ => ScanErrorKind::IoError,
        };
        Self::new(kind, path, err.to_string())
    }
}

/// Why a single transfer unit ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferError {
    /// The transfer capability reported a failure
    #[error("transfer failed: {message}")]
    Failed { message: String },

    /// The unit exceeded its own deadline and was cancelled
    #[error("transfer timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The round containing the unit exceeded its deadline
    #[error("round timed out after {timeout_ms}ms before the transfer settled")]
    RoundTimeout { timeout_ms: u64 },

    /// The task driving the transfer was cancelled or panicked
    #[error("transfer cancelled: {message}")]
    Cancelled { message: String },

    /// Local I/O failed while preparing or performing the transfer
    #[error("i/o error: {message}")]
    Io { message: String },
}

impl TransferError {
    /// Create a capability failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Create a per-item timeout error
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Create a per-round timeout error
    pub fn round_timeout(after: Duration) -> Self {
        Self::RoundTimeout {
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Whether this error came from either deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RoundTimeout { .. })
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Configuration validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("root path is empty")]
    EmptyRoot,

    #[error("upload concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("{name} timeout must be greater than zero")]
    ZeroTimeout { name: &'static str },

    #[error("round timeout ({round_ms}ms) must not be shorter than item timeout ({item_ms}ms)")]
    RoundShorterThanItem { round_ms: u64, item_ms: u64 },

    #[error("upload is enabled but no destination was given")]
    MissingDestination,
}

/// Fatal errors: the run aborts before any work begins
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot scan root: {0}")]
    Root(#[source] ScanError),

    #[error("inventory database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result alias for fatal errors
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(ScanError::from(denied).kind, ScanErrorKind::PermissionDenied);

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(ScanError::from(missing).kind, ScanErrorKind::NotFound);

        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(ScanError::from(other).kind, ScanErrorKind::IoError);
    }

    #[test]
    fn test_with_path_keeps_existing() {
        let err = ScanError::not_found(PathBuf::from("/a")).with_path("/b");
        assert_eq!(err.path, Some(PathBuf::from("/a")));

        let err = ScanError::new(ScanErrorKind::IoError, None, "x").with_path("/b");
        assert_eq!(err.path, Some(PathBuf::from("/b")));
    }

    #[test]
    fn test_transfer_error_timeout_kinds() {
        assert!(TransferError::timeout(Duration::from_secs(1)).is_timeout());
        assert!(TransferError::round_timeout(Duration::from_secs(1)).is_timeout());
        assert!(!TransferError::failed("denied").is_timeout());
    }

    #[test]
    fn test_transfer_error_serialization() {
        let json = serde_json::to_value(TransferError::timeout(Duration::from_millis(1500))).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["timeout_ms"], 1500);
    }
}
