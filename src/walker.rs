//! Parallel directory walker
//!
//! The coordinator lists the scan root itself, records the files found there
//! as one batch, and queues every first-level subdirectory. A rayon pool of
//! `workers` threads claims queued subtrees in FIFO order, walks each one to
//! completion and sends back a single [`SubtreeBatch`] over a channel. The
//! coordinator applies batches to the [`ScanState`] as they arrive; it is the
//! only writer.

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use crate::aggregator::ScanState;
use crate::error::{Error, Result, ScanError};
use crate::models::{FileRecord, SubtreeBatch};
use crate::probe::{EntryKind, FsProbe, ProbeEntry};
use crate::progress::{ProgressSink, ProgressSnapshot};

/// Walks a tree with a bounded pool of worker threads
pub struct DirectoryWalker<P> {
    probe: Arc<P>,
    workers: usize,
}

impl<P: FsProbe + 'static> DirectoryWalker<P> {
    /// Create a walker using `workers` threads (at least 1)
    pub fn new(probe: Arc<P>, workers: usize) -> Self {
        Self {
            probe,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Walk `root`, applying every batch to `state`
    ///
    /// Fails only when `root` itself cannot be listed.
    pub fn walk(
        &self,
        root: &Path,
        state: &mut ScanState,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let start = Instant::now();
        let entries = self
            .probe
            .list_dir(root)
            .map_err(|e| Error::Root(e.with_path(root)))?;

        let mut root_batch = SubtreeBatch {
            processed_dirs: 1,
            ..Default::default()
        };
        let mut queue = Vec::new();
        for entry in entries {
            match entry.kind {
                EntryKind::Dir => queue.push(entry.path),
                EntryKind::File => match self.probe.stat(&entry.path) {
                    Ok(size) => root_batch.push(FileRecord::new(entry.path, size)),
                    Err(e) => skip_entry(&mut root_batch, &e),
                },
                EntryKind::Other => {}
            }
        }
        queue.sort();

        log::info!(
            "Walking {:?}: {} root files, {} first-level folders, {} workers",
            root,
            root_batch.file_count,
            queue.len(),
            self.workers
        );

        // Register folders up front so they keep listing order and an
        // unreadable one still shows up with zero totals.
        for dir in &queue {
            state.add_first_level_folder(dir, 0, 0);
        }
        state.apply_subtree(root_batch);
        sink.snapshot(&ProgressSnapshot::scanning(&state.snapshot(), elapsed_ms(start)));

        if queue.is_empty() {
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("walker-{}", i))
            .build()?;

        let (tx, rx) = mpsc::channel::<SubtreeBatch>();
        for dir in queue {
            let tx = tx.clone();
            let probe = Arc::clone(&self.probe);
            pool.spawn_fifo(move || {
                let batch = walk_subtree(probe.as_ref(), dir);
                // The receiver outlives every job; a send error means the
                // coordinator is gone and the batch has nowhere to go.
                let _ = tx.send(batch);
            });
        }
        drop(tx);

        for batch in rx {
            log::debug!(
                "Subtree {:?}: {} files, {} bytes, {} dirs",
                batch.folder,
                batch.file_count,
                batch.total_size,
                batch.processed_dirs
            );
            state.apply_subtree(batch);
            sink.snapshot(&ProgressSnapshot::scanning(&state.snapshot(), elapsed_ms(start)));
        }

        log::info!(
            "Walk finished: {} files, {} bytes, {} dirs in {}ms",
            state.total_files,
            state.total_size,
            state.processed_dirs,
            elapsed_ms(start)
        );
        Ok(())
    }
}

/// Walk one first-level subtree to completion inside a pool thread
///
/// Sibling directory listings and file stats fan out over the same pool,
/// so the thread count stays bounded by the pool size.
fn walk_subtree<P: FsProbe + ?Sized>(probe: &P, top: PathBuf) -> SubtreeBatch {
    let entries = match probe.list_dir(&top) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Skipping unreadable subtree {:?}: {}", top, e);
            return SubtreeBatch::unreadable(top);
        }
    };

    let mut batch = SubtreeBatch {
        folder: Some(top),
        processed_dirs: 1,
        ..Default::default()
    };

    let mut pending = entries;
    while !pending.is_empty() {
        let (dirs, files): (Vec<ProbeEntry>, Vec<ProbeEntry>) = pending
            .into_iter()
            .filter(|e| e.kind != EntryKind::Other)
            .partition(|e| e.kind == EntryKind::Dir);

        let stats: Vec<std::result::Result<FileRecord, ScanError>> = files
            .into_par_iter()
            .map(|e| probe.stat(&e.path).map(|size| FileRecord::new(e.path, size)))
            .collect();
        for stat in stats {
            match stat {
                Ok(record) => batch.push(record),
                Err(e) => skip_entry(&mut batch, &e),
            }
        }

        let listings: Vec<std::result::Result<Vec<ProbeEntry>, ScanError>> = dirs
            .par_iter()
            .map(|d| probe.list_dir(&d.path))
            .collect();
        pending = Vec::new();
        for listing in listings {
            match listing {
                Ok(children) => {
                    batch.processed_dirs += 1;
                    pending.extend(children);
                }
                Err(e) => skip_entry(&mut batch, &e),
            }
        }
    }

    batch
}

fn skip_entry(batch: &mut SubtreeBatch, err: &ScanError) {
    log::debug!("Skipping entry: {}", err);
    batch.skipped_entries += 1;
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{LocalFs, MemoryFs};
    use crate::progress::{NullSink, RecordingSink};
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn three_folder_tree() -> MemoryFs {
        MemoryFs::new("/r")
            .dir("/r/a")
            .file("/r/a/1", 10)
            .file("/r/a/2", 20)
            .dir("/r/b")
            .file("/r/b/1", 30)
            .dir("/r/b/deep")
            .file("/r/b/deep/2", 40)
            .dir("/r/c")
            .file("/r/c/1", 50)
            .file("/r/c/2", 60)
    }

    fn walk(fs: MemoryFs, workers: usize) -> ScanState {
        let walker = DirectoryWalker::new(Arc::new(fs), workers);
        let mut state = ScanState::new("/r", true);
        walker.walk(Path::new("/r"), &mut state, &mut NullSink).unwrap();
        state.sort_by_path();
        state
    }

    #[test]
    fn test_three_folder_totals() {
        let state = walk(three_folder_tree(), 2);

        assert_eq!(state.total_files, 6);
        assert_eq!(state.total_size, 210);

        let folders: Vec<(u64, u64)> = state
            .first_level_folders
            .iter()
            .map(|f| (f.file_count, f.total_size))
            .collect();
        assert_eq!(folders, vec![(2, 30), (2, 70), (2, 110)]);
    }

    #[test]
    fn test_folders_match_nested_records() {
        let state = walk(three_folder_tree(), 3);

        for folder in &state.first_level_folders {
            let nested: Vec<&FileRecord> = state
                .files
                .iter()
                .filter(|f| f.path.starts_with(&folder.path))
                .collect();
            assert_eq!(folder.file_count, nested.len() as u64);
            assert_eq!(folder.total_size, nested.iter().map(|f| f.size).sum::<u64>());
        }
    }

    #[test]
    fn test_root_files_and_processed_dirs() {
        let fs = three_folder_tree().file("/r/top", 5);
        let state = walk(fs, 1);

        assert_eq!(state.total_files, 7);
        assert_eq!(state.total_size, 215);
        // root + a + b + b/deep + c
        assert_eq!(state.processed_dirs, 5);
    }

    #[test]
    fn test_unreadable_subtree_contributes_zero() {
        let fs = three_folder_tree().deny_list("/r/b");
        let state = walk(fs, 2);

        assert_eq!(state.total_files, 4);
        assert_eq!(state.total_size, 140);
        assert_eq!(state.skipped_subtrees, 1);

        let b = &state.first_level_folders[1];
        assert_eq!(b.path, PathBuf::from("/r/b"));
        assert_eq!((b.file_count, b.total_size), (0, 0));
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let fs = three_folder_tree()
            .deny_stat("/r/a/2")
            .deny_list("/r/b/deep");
        let state = walk(fs, 2);

        assert_eq!(state.total_files, 4);
        assert_eq!(state.total_size, 10 + 30 + 50 + 60);
        assert_eq!(state.skipped_entries, 2);
        assert_eq!(state.skipped_subtrees, 0);
    }

    #[test]
    fn test_unlistable_root_is_fatal() {
        let fs = three_folder_tree().deny_list("/r");
        let walker = DirectoryWalker::new(Arc::new(fs), 2);
        let mut state = ScanState::new("/r", true);
        let err = walker.walk(Path::new("/r"), &mut state, &mut NullSink).unwrap_err();
        assert!(matches!(err, Error::Root(_)));
    }

    #[test]
    fn test_snapshots_are_monotonic() {
        let walker = DirectoryWalker::new(Arc::new(three_folder_tree()), 2);
        let mut state = ScanState::new("/r", true);
        let mut sink = RecordingSink::default();
        walker.walk(Path::new("/r"), &mut state, &mut sink).unwrap();

        // one for the root batch, one per subtree
        assert_eq!(sink.snapshots.len(), 4);
        for pair in sink.snapshots.windows(2) {
            assert!(pair[1].total_files >= pair[0].total_files);
            assert!(pair[1].total_size >= pair[0].total_size);
        }
    }

    #[test]
    fn test_walks_real_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/nested")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("top.txt"), vec![0u8; 3]).unwrap();
        fs::write(root.join("a/x"), vec![0u8; 10]).unwrap();
        fs::write(root.join("a/nested/y"), vec![0u8; 20]).unwrap();
        fs::write(root.join("b/z"), vec![0u8; 30]).unwrap();

        let walker = DirectoryWalker::new(Arc::new(LocalFs), 2);
        let mut state = ScanState::new(root, true);
        walker.walk(root, &mut state, &mut NullSink).unwrap();
        state.sort_by_path();

        assert_eq!(state.total_files, 4);
        assert_eq!(state.total_size, 63);
        assert_eq!(state.first_level_folders.len(), 2);
        assert_eq!(state.first_level_folders[0].total_size, 30);
        assert_eq!(state.first_level_folders[1].total_size, 30);
    }

    fn build_tree(layout: &[(u8, u8, u64)]) -> MemoryFs {
        let mut fs = MemoryFs::new("/r");
        let mut seen = std::collections::HashSet::new();
        for (i, (top, sub, size)) in layout.iter().enumerate() {
            let top_dir = format!("/r/d{}", top);
            let sub_dir = format!("{}/s{}", top_dir, sub);
            if seen.insert(top_dir.clone()) {
                fs = fs.dir(top_dir.clone());
            }
            if seen.insert(sub_dir.clone()) {
                fs = fs.dir(sub_dir.clone());
            }
            fs = fs.file(format!("{}/f{}", sub_dir, i), *size);
        }
        fs
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_totals_independent_of_worker_count(
            layout in prop::collection::vec((0u8..6, 0u8..3, 0u64..10_000), 0..60),
            w1 in 1usize..5,
            w2 in 5usize..9,
        ) {
            let a = walk(build_tree(&layout), w1);
            let b = walk(build_tree(&layout), w2);

            prop_assert_eq!(a.total_files, layout.len() as u64);
            prop_assert_eq!(a.total_files, b.total_files);
            prop_assert_eq!(a.total_size, b.total_size);
            prop_assert_eq!(a.processed_dirs, b.processed_dirs);

            let fa: Vec<(PathBuf, u64, u64)> = a.first_level_folders.iter()
                .map(|f| (f.path.clone(), f.file_count, f.total_size)).collect();
            let fb: Vec<(PathBuf, u64, u64)> = b.first_level_folders.iter()
                .map(|f| (f.path.clone(), f.file_count, f.total_size)).collect();
            prop_assert_eq!(fa, fb);
        }
    }
}
