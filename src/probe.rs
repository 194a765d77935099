//! Filesystem probe: directory listing and file size lookups
//!
//! The walker only talks to the filesystem through [`FsProbe`], so tests can
//! substitute an in-memory tree or inject failures.

#[cfg(test)]
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{ScanError, ScanErrorKind};

/// What a directory entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    /// Symlinks, sockets, devices; never followed or recorded
    Other,
}

/// One entry returned by [`FsProbe::list_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Read access to a directory tree
///
/// Both methods fail with a recoverable [`ScanError`]; callers skip the
/// offending entry instead of aborting.
pub trait FsProbe: Send + Sync {
    /// List the immediate children of `path`
    fn list_dir(&self, path: &Path) -> Result<Vec<ProbeEntry>, ScanError>;

    /// Size of the file at `path` in bytes
    fn stat(&self, path: &Path) -> Result<u64, ScanError>;

    /// Pre-flight check that `root` exists and is a directory
    fn check_root(&self, root: &Path) -> Result<(), ScanError> {
        self.list_dir(root).map(|_| ())
    }
}

/// Probe backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FsProbe for LocalFs {
    fn list_dir(&self, path: &Path) -> Result<Vec<ProbeEntry>, ScanError> {
        let walker = WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter();

        let mut entries = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) => {
                    let file_type = entry.file_type();
                    let kind = if file_type.is_dir() {
                        EntryKind::Dir
                    } else if file_type.is_file() {
                        EntryKind::File
                    } else {
                        EntryKind::Other
                    };
                    entries.push(ProbeEntry {
                        name: entry.file_name().to_string_lossy().to_string(),
                        path: entry.into_path(),
                        kind,
                    });
                }
                // Depth 0 means the directory itself could not be opened
                Err(e) if e.depth() == 0 => {
                    return Err(ScanError::from(e).with_path(path));
                }
                Err(e) => {
                    log::debug!("Skipping unreadable entry under {:?}: {}", path, e);
                }
            }
        }
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<u64, ScanError> {
        let metadata = std::fs::metadata(path).map_err(|e| ScanError::from(e).with_path(path))?;
        if !metadata.is_file() {
            return Err(ScanError::new(
                ScanErrorKind::InvalidPath,
                Some(path.to_path_buf()),
                "not a regular file",
            ));
        }
        Ok(metadata.len())
    }

    fn check_root(&self, root: &Path) -> Result<(), ScanError> {
        let metadata = std::fs::metadata(root).map_err(|e| ScanError::from(e).with_path(root))?;
        if !metadata.is_dir() {
            return Err(ScanError::not_a_directory(root.to_path_buf()));
        }
        Ok(())
    }
}

/// In-memory tree used by tests to script listing and stat failures
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryFs {
    dirs: HashMap<PathBuf, Vec<ProbeEntry>>,
    sizes: HashMap<PathBuf, u64>,
    unlistable: Vec<PathBuf>,
    unstatable: Vec<PathBuf>,
}

#[cfg(test)]
impl MemoryFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut fs = Self::default();
        fs.dirs.insert(root.into(), Vec::new());
        fs
    }

    /// Add a directory (parents must already exist)
    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.attach(&path, EntryKind::Dir);
        self.dirs.entry(path).or_default();
        self
    }

    /// Add a file of `size` bytes (parents must already exist)
    pub fn file(mut self, path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        self.attach(&path, EntryKind::File);
        self.sizes.insert(path, size);
        self
    }

    /// Make `list_dir` fail for this directory
    pub fn deny_list(mut self, path: impl Into<PathBuf>) -> Self {
        self.unlistable.push(path.into());
        self
    }

    /// Make `stat` fail for this file
    pub fn deny_stat(mut self, path: impl Into<PathBuf>) -> Self {
        self.unstatable.push(path.into());
        self
    }

    fn attach(&mut self, path: &Path, kind: EntryKind) {
        if let Some(parent) = path.parent() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            self.dirs.entry(parent.to_path_buf()).or_default().push(ProbeEntry {
                name,
                path: path.to_path_buf(),
                kind,
            });
        }
    }
}

#[cfg(test)]
impl FsProbe for MemoryFs {
    fn list_dir(&self, path: &Path) -> Result<Vec<ProbeEntry>, ScanError> {
        if self.unlistable.iter().any(|p| p == path) {
            return Err(ScanError::new(
                ScanErrorKind::PermissionDenied,
                Some(path.to_path_buf()),
                "listing denied",
            ));
        }
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| ScanError::not_found(path.to_path_buf()))
    }

    fn stat(&self, path: &Path) -> Result<u64, ScanError> {
        if self.unstatable.iter().any(|p| p == path) {
            return Err(ScanError::new(
                ScanErrorKind::PermissionDenied,
                Some(path.to_path_buf()),
                "stat denied",
            ));
        }
        self.sizes
            .get(path)
            .copied()
            .ok_or_else(|| ScanError::not_found(path.to_path_buf()))
    }
}
