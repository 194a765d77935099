//! Single-writer accumulator for scan totals, file records and folder rollups
//!
//! Only the coordinator mutates a [`ScanState`]. Walker slots hand it
//! immutable [`SubtreeBatch`] values, so no locking is involved.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::{FileRecord, FolderAggregate, ScanSnapshot, SubtreeBatch};

/// Everything known about the tree after (or during) a walk
#[derive(Debug, Default, Serialize)]
pub struct ScanState {
    /// Scan root
    pub root: PathBuf,
    /// Final component of the root, used as the destination prefix
    pub root_name: String,
    pub total_files: u64,
    pub total_size: u64,
    pub processed_dirs: u64,
    pub skipped_entries: u64,
    pub skipped_subtrees: u64,
    /// First-level folders in discovery order
    pub first_level_folders: Vec<FolderAggregate>,
    /// Per-file records. Files directly in the root are always kept;
    /// nested ones only when `store_files` is on
    pub files: Vec<FileRecord>,
    #[serde(skip)]
    store_files: bool,
    #[serde(skip)]
    folder_index: HashMap<PathBuf, usize>,
}

impl ScanState {
    /// Create an empty state for `root`
    pub fn new(root: impl Into<PathBuf>, store_files: bool) -> Self {
        let root = root.into();
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        Self {
            root,
            root_name,
            store_files,
            ..Default::default()
        }
    }

    pub fn stores_files(&self) -> bool {
        self.store_files
    }

    /// Record a batch of files, keeping or discarding the records
    pub fn add_batch(&mut self, records: Vec<FileRecord>) {
        self.total_files += records.len() as u64;
        self.total_size += records.iter().map(|r| r.size).sum::<u64>();
        if self.store_files {
            self.files.extend(records);
        }
    }

    /// Record the files found directly in the root, always kept
    pub fn add_root_files(&mut self, records: Vec<FileRecord>) {
        self.total_files += records.len() as u64;
        self.total_size += records.iter().map(|r| r.size).sum::<u64>();
        self.files.extend(records);
    }

    /// Merge a delta into the rollup for `path`, creating it if needed
    pub fn add_first_level_folder(&mut self, path: &Path, delta_count: u64, delta_size: u64) {
        match self.folder_index.get(path) {
            Some(&idx) => {
                let folder = &mut self.first_level_folders[idx];
                folder.file_count += delta_count;
                folder.total_size += delta_size;
            }
            None => {
                let mut folder = FolderAggregate::new(path.to_path_buf());
                folder.file_count = delta_count;
                folder.total_size = delta_size;
                self.folder_index
                    .insert(path.to_path_buf(), self.first_level_folders.len());
                self.first_level_folders.push(folder);
            }
        }
    }

    /// Flag a first-level folder whose own listing failed
    pub fn mark_unreadable(&mut self, path: &Path) {
        if let Some(&idx) = self.folder_index.get(path) {
            self.first_level_folders[idx].unreadable = true;
        }
    }

    pub fn increment_processed_dirs(&mut self, n: u64) {
        self.processed_dirs += n;
    }

    /// Apply everything a walker slot returned for one subtree
    pub fn apply_subtree(&mut self, batch: SubtreeBatch) {
        let SubtreeBatch {
            folder,
            files,
            processed_dirs,
            file_count,
            total_size,
            skipped_entries,
            unreadable,
        } = batch;

        match folder {
            Some(folder) => {
                self.add_first_level_folder(&folder, file_count, total_size);
                if unreadable {
                    self.mark_unreadable(&folder);
                }
                self.add_batch(files);
            }
            None => self.add_root_files(files),
        }
        self.increment_processed_dirs(processed_dirs);
        self.skipped_entries += skipped_entries;
        if unreadable {
            self.skipped_subtrees += 1;
        }
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            root_name: self.root_name.clone(),
            total_files: self.total_files,
            total_size: self.total_size,
            processed_dirs: self.processed_dirs,
            folder_count: self.first_level_folders.len(),
            skipped_entries: self.skipped_entries,
            skipped_subtrees: self.skipped_subtrees,
        }
    }

    /// Drop per-file detail; totals and folders are untouched
    pub fn release_file_records(&mut self) {
        self.files = Vec::new();
    }

    /// Order records by path; worker completion order is not meaningful
    pub fn sort_by_path(&mut self) {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
        self.first_level_folders.sort_by(|a, b| a.path.cmp(&b.path));
        self.folder_index = self
            .first_level_folders
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.path.clone(), idx))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, size: u64) -> FileRecord {
        FileRecord::new(PathBuf::from(path), size)
    }

    #[test]
    fn test_root_name() {
        assert_eq!(ScanState::new("/data/photos", true).root_name, "photos");
        assert_eq!(ScanState::new("/", true).root_name, "root");
    }

    #[test]
    fn test_add_batch_updates_totals() {
        let mut state = ScanState::new("/r", true);
        state.add_batch(vec![record("/r/a", 10), record("/r/b", 20)]);
        state.add_batch(vec![record("/r/c", 5)]);

        assert_eq!(state.total_files, 3);
        assert_eq!(state.total_size, 35);
        assert_eq!(state.files.len(), 3);
    }

    #[test]
    fn test_add_batch_discards_when_not_storing() {
        let mut state = ScanState::new("/r", false);
        state.add_batch(vec![record("/r/a", 10), record("/r/b", 20)]);

        assert_eq!(state.total_files, 2);
        assert_eq!(state.total_size, 30);
        assert!(state.files.is_empty());
    }

    #[test]
    fn test_folder_upsert_is_commutative() {
        let deltas = [(2, 30), (1, 5), (4, 100)];

        let mut forward = ScanState::new("/r", true);
        for (count, size) in deltas {
            forward.add_first_level_folder(Path::new("/r/a"), count, size);
        }

        let mut backward = ScanState::new("/r", true);
        for (count, size) in deltas.iter().rev() {
            backward.add_first_level_folder(Path::new("/r/a"), *count, *size);
        }

        assert_eq!(forward.first_level_folders.len(), 1);
        assert_eq!(forward.first_level_folders[0].file_count, 7);
        assert_eq!(forward.first_level_folders[0].total_size, 135);
        assert_eq!(
            forward.first_level_folders[0].file_count,
            backward.first_level_folders[0].file_count
        );
        assert_eq!(
            forward.first_level_folders[0].total_size,
            backward.first_level_folders[0].total_size
        );
    }

    #[test]
    fn test_apply_subtree() {
        let mut state = ScanState::new("/r", true);
        let mut batch = SubtreeBatch {
            folder: Some(PathBuf::from("/r/a")),
            processed_dirs: 3,
            skipped_entries: 1,
            ..Default::default()
        };
        batch.push(record("/r/a/x", 10));
        batch.push(record("/r/a/y/z", 20));
        state.apply_subtree(batch);
        state.apply_subtree(SubtreeBatch::unreadable(PathBuf::from("/r/b")));

        let snap = state.snapshot();
        assert_eq!(snap.total_files, 2);
        assert_eq!(snap.total_size, 30);
        assert_eq!(snap.processed_dirs, 3);
        assert_eq!(snap.folder_count, 2);
        assert_eq!(snap.skipped_entries, 1);
        assert_eq!(snap.skipped_subtrees, 1);
        assert!(!state.first_level_folders[0].unreadable);
        assert!(state.first_level_folders[1].unreadable);
    }

    #[test]
    fn test_release_file_records_keeps_totals() {
        let mut state = ScanState::new("/r", true);
        state.add_batch(vec![record("/r/a/x", 10)]);
        state.add_first_level_folder(Path::new("/r/a"), 1, 10);
        state.release_file_records();

        assert!(state.files.is_empty());
        assert_eq!(state.total_files, 1);
        assert_eq!(state.total_size, 10);
        assert_eq!(state.first_level_folders[0].total_size, 10);
    }

    #[test]
    fn test_root_files_kept_without_storage() {
        let mut state = ScanState::new("/r", false);
        state.apply_subtree(SubtreeBatch {
            folder: None,
            files: vec![record("/r/top", 7)],
            file_count: 1,
            total_size: 7,
            ..Default::default()
        });
        assert_eq!(state.files.len(), 1);
        assert_eq!(state.total_size, 7);
        assert!(state.first_level_folders.is_empty());
    }
}
