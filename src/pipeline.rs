//! End-to-end run: validate, walk, then optionally upload
//!
//! The scan phase runs on a blocking thread so the rayon pool never shares
//! threads with the async runtime. The upload phase runs on the caller's
//! task. Both phases report to the same [`ProgressSink`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::aggregator::ScanState;
use crate::config::{RunConfig, TransferMode};
use crate::db::{DoneUnit, InventoryDb, PersistingSink};
use crate::error::{Error, Result};
use crate::models::{FileRecord, FolderAggregate, ScanSnapshot, TransferUnit, UnitStatus};
use crate::probe::FsProbe;
use crate::progress::{Phase, ProgressSink, ProgressSnapshot};
use crate::scheduler::{FinalReport, SchedulerOptions, UploadScheduler};
use crate::transfer::{Destination, TransferCapability};
use crate::walker::DirectoryWalker;

/// What a finished run reports
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub scan: ScanSnapshot,
    /// Absent for scan-only runs
    pub upload: Option<FinalReport>,
    /// Units marked done from the inventory database without a transfer
    pub resumed: u64,
}

impl RunSummary {
    /// True when no unit ended in `failed`
    pub fn is_success(&self) -> bool {
        self.upload.as_ref().map_or(true, |u| u.failed == 0)
    }

    /// Count for one status bucket, zero for scan-only runs
    pub fn count(&self, status: UnitStatus) -> u64 {
        self.upload.as_ref().map_or(0, |u| u.count(status))
    }

    /// Failed unit paths in sorted order
    pub fn failed_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .upload
            .iter()
            .flat_map(|u| u.failed_units.iter().map(|f| f.path.as_str()))
            .collect();
        paths.sort_unstable();
        paths
    }
}

/// Summary plus the final aggregator state
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub state: ScanState,
}

/// Walk `config.root` and return the sorted inventory
///
/// Blocking; call from a thread that may block.
pub fn scan<P: FsProbe + 'static>(
    config: &RunConfig,
    probe: Arc<P>,
    sink: &mut dyn ProgressSink,
) -> Result<ScanState> {
    config.validate()?;
    let mut state = ScanState::new(&config.root, config.needs_file_records());
    DirectoryWalker::new(probe, config.effective_workers()).walk(&config.root, &mut state, sink)?;
    state.sort_by_path();
    Ok(state)
}

/// Upload the units of `state` according to `config.mode`
///
/// Units recorded in `done` with the same size and file count are marked
/// done without a transfer. Returns the merged report and the number of
/// such units.
pub async fn upload(
    config: &RunConfig,
    state: &mut ScanState,
    transfer: Arc<dyn TransferCapability>,
    done: &HashMap<PathBuf, DoneUnit>,
    sink: &mut dyn ProgressSink,
) -> (FinalReport, u64) {
    let prefix = config.destination.clone().unwrap_or_default();
    let destination = Destination::new(prefix, state.root.clone(), state.root_name.clone());
    let scheduler = UploadScheduler::new(transfer, destination, SchedulerOptions::from_config(config));

    match config.mode {
        TransferMode::Files => {
            let resumed = mark_resumed(&mut state.files, done);
            (scheduler.run(&mut state.files, sink).await, resumed)
        }
        TransferMode::Folders => {
            let ScanState {
                root,
                files,
                first_level_folders,
                ..
            } = state;

            // Files sitting directly in the root belong to no folder unit
            let mut root_files: Vec<&mut FileRecord> = files
                .iter_mut()
                .filter(|f| f.path.parent() == Some(root.as_path()))
                .collect();
            let mut folders: Vec<&mut FolderAggregate> = Vec::with_capacity(first_level_folders.len());
            for folder in first_level_folders.iter_mut() {
                if folder.unreadable {
                    log::warn!("Not uploading unreadable folder {:?}", folder.path);
                } else {
                    folders.push(folder);
                }
            }

            let mut resumed = mark_resumed(&mut root_files, done);
            resumed += mark_resumed(&mut folders, done);

            let mut progress = ProgressSnapshot {
                phase: Phase::Upload,
                total_files: (root_files.len() + folders.len()) as u64,
                total_size: root_files.iter().map(|f| f.size).sum::<u64>()
                    + folders.iter().map(|f| f.total_size).sum::<u64>(),
                ..Default::default()
            };
            let mut report = scheduler.run_tracked(&mut root_files, &mut progress, sink).await;
            report.merge(scheduler.run_tracked(&mut folders, &mut progress, sink).await);
            (report, resumed)
        }
    }
}

fn mark_resumed<U: TransferUnit>(units: &mut [U], done: &HashMap<PathBuf, DoneUnit>) -> u64 {
    if done.is_empty() {
        return 0;
    }
    let mut resumed = 0;
    let mut changed = 0;
    for unit in units.iter_mut() {
        if unit.status() != UnitStatus::Ready {
            continue;
        }
        match done.get(unit.path()) {
            Some(previous) if previous.matches(&*unit) => {
                let state = unit.state_mut();
                if state.begin() && state.complete() {
                    resumed += 1;
                }
            }
            Some(_) => changed += 1,
            None => {}
        }
    }
    if resumed > 0 || changed > 0 {
        log::info!(
            "Resuming: {} units already uploaded, {} changed since",
            resumed,
            changed
        );
    }
    resumed
}

/// A full run over one probe and an optional transfer capability
pub struct Pipeline<P> {
    config: RunConfig,
    probe: Arc<P>,
    transfer: Option<Arc<dyn TransferCapability>>,
}

impl<P: FsProbe + 'static> Pipeline<P> {
    pub fn new(config: RunConfig, probe: Arc<P>) -> Self {
        Self {
            config,
            probe,
            transfer: None,
        }
    }

    /// Set the capability used by the upload phase
    pub fn with_transfer(mut self, transfer: Arc<dyn TransferCapability>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Run both phases
    ///
    /// Fatal errors (bad config, unreadable root, database open) are returned
    /// before any work begins. Entry, subtree and transfer failures are
    /// counted in the summary instead.
    pub async fn run(self, mut sink: Box<dyn ProgressSink>) -> Result<RunOutcome> {
        let Self {
            config,
            probe,
            transfer,
        } = self;

        config.validate()?;
        let transfer = match (config.upload, transfer) {
            (true, None) => {
                return Err(Error::Runtime(
                    "upload enabled without a transfer capability".to_string(),
                ))
            }
            (true, Some(t)) => Some(t),
            (false, _) => None,
        };
        probe.check_root(&config.root).map_err(Error::Root)?;
        let mut db = match &config.db_path {
            Some(path) => Some(InventoryDb::open(path)?),
            None => None,
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        sink.started(&config);

        let walk_config = config.clone();
        let walk_probe = Arc::clone(&probe);
        let (scanned, mut sink) = tokio::task::spawn_blocking(move || {
            let result = scan(&walk_config, walk_probe, sink.as_mut());
            (result, sink)
        })
        .await
        .map_err(|e| Error::Runtime(format!("scan task failed: {}", e)))?;
        let mut state = scanned?;
        let scan_snapshot = state.snapshot();

        let run_id = match db.as_mut() {
            Some(db) => Some(db.begin_run(&config, &scan_snapshot, started_at)?),
            None => None,
        };

        let mut report = None;
        let mut resumed = 0;
        if let Some(transfer) = transfer {
            let destination = config.destination.clone().unwrap_or_default();
            let done = match (&db, config.resume) {
                (Some(db), true) => db.load_done_units(&destination)?,
                _ => HashMap::new(),
            };

            let (upload_report, n) = match (db.as_mut(), run_id) {
                (Some(db), Some(run_id)) => {
                    let report = {
                        let mut persisting =
                            PersistingSink::new(sink.as_mut(), db, run_id, destination.clone());
                        upload(&config, &mut state, transfer, &done, &mut persisting).await
                    };
                    match db.status_counts(&destination) {
                        Ok(counts) => log::info!(
                            "Inventory for {}: {} done, {} failed",
                            destination,
                            counts.get(&UnitStatus::Done).copied().unwrap_or(0),
                            counts.get(&UnitStatus::Failed).copied().unwrap_or(0)
                        ),
                        Err(e) => log::warn!("Could not read inventory counts: {}", e),
                    }
                    report
                }
                _ => upload(&config, &mut state, transfer, &done, sink.as_mut()).await,
            };
            report = Some(upload_report);
            resumed = n;

            if !config.store_files {
                state.release_file_records();
            }
        }

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            scan: scan_snapshot,
            upload: report,
            resumed,
        };

        sink.snapshot(&ProgressSnapshot {
            phase: Phase::Done,
            total_files: summary.scan.total_files,
            total_size: summary.scan.total_size,
            processed_dirs: summary.scan.processed_dirs,
            done_count: summary.count(UnitStatus::Done),
            failed_count: summary.count(UnitStatus::Failed),
            bytes_transferred: summary.upload.as_ref().map_or(0, |u| u.bytes_transferred),
            elapsed_ms: summary.duration_ms,
            ..Default::default()
        });
        sink.finished(&summary);

        if let (Some(db), Some(run_id)) = (db.as_mut(), run_id) {
            if let Err(e) = db.finish_run(run_id, &summary) {
                log::error!("Failed to record end of run {}: {}", run_id, e);
            }
        }

        Ok(RunOutcome { summary, state })
    }
}
