//! Bounded-concurrency upload scheduler
//!
//! Units are queued once, in order, and dispatched in rounds of at most
//! `concurrency`. Every transfer in a round is bounded by the per-item
//! timeout; the round as a whole is bounded by the per-round timeout. When
//! the round deadline passes, outstanding tasks are aborted and their units
//! fail with [`TransferError::RoundTimeout`]. The coordinator waits for the
//! whole round before starting the next one, so at most `concurrency` units
//! are ever in `transfer`.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
#[cfg(test)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::RunConfig;
use crate::error::TransferError;
use crate::models::{TransferUnit, UnitStatus};
use crate::progress::{Phase, ProgressSink, ProgressSnapshot};
use crate::transfer::{Destination, TransferCapability};

/// Knobs for one scheduler run
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub concurrency: usize,
    pub item_timeout: Duration,
    pub round_timeout: Duration,
    pub check_exists: bool,
    pub release_settled: bool,
}

impl SchedulerOptions {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            item_timeout: config.item_timeout(),
            round_timeout: config.round_timeout(),
            check_exists: config.check_exists,
            release_settled: config.release_settled,
        }
    }
}

/// A unit that ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub path: String,
    pub error: TransferError,
}

/// Outcome of a scheduler run
#[derive(Debug, Clone, Default, Serialize)]
pub struct FinalReport {
    pub ready: u64,
    pub transfer: u64,
    pub done: u64,
    pub failed: u64,
    /// Units found at the destination and not transferred
    pub skipped_existing: u64,
    /// Failed units whose cause was an item or round deadline
    pub timed_out: u64,
    /// Sum of sizes of units that reached `done` in this run
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
    /// Bytes per second
    pub throughput: f64,
    /// Units dispatched per round, in order
    pub round_sizes: Vec<usize>,
    pub failed_units: Vec<FailedUnit>,
}

impl FinalReport {
    /// Count for one status bucket
    pub fn count(&self, status: UnitStatus) -> u64 {
        match status {
            UnitStatus::Ready => self.ready,
            UnitStatus::Transfer => self.transfer,
            UnitStatus::Done => self.done,
            UnitStatus::Failed => self.failed,
        }
    }

    pub fn rounds(&self) -> usize {
        self.round_sizes.len()
    }

    /// Fold the report of a later run over a disjoint unit set into this one
    pub fn merge(&mut self, other: FinalReport) {
        self.ready += other.ready;
        self.transfer += other.transfer;
        self.done += other.done;
        self.failed += other.failed;
        self.skipped_existing += other.skipped_existing;
        self.timed_out += other.timed_out;
        self.bytes_transferred += other.bytes_transferred;
        self.elapsed_ms += other.elapsed_ms;
        self.round_sizes.extend(other.round_sizes);
        self.failed_units.extend(other.failed_units);
        self.throughput = if self.elapsed_ms > 0 {
            self.bytes_transferred as f64 * 1000.0 / self.elapsed_ms as f64
        } else {
            0.0
        };
    }
}

enum Attempt {
    Transferred,
    AlreadyPresent,
}

/// Drives transfer units through a [`TransferCapability`]
pub struct UploadScheduler {
    transfer: Arc<dyn TransferCapability>,
    destination: Destination,
    options: SchedulerOptions,
}

impl UploadScheduler {
    pub fn new(
        transfer: Arc<dyn TransferCapability>,
        destination: Destination,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            transfer,
            destination,
            options,
        }
    }

    /// Transfer every `ready` unit, one round at a time
    pub async fn run<U: TransferUnit>(
        &self,
        units: &mut [U],
        sink: &mut dyn ProgressSink,
    ) -> FinalReport {
        let mut progress = ProgressSnapshot {
            phase: Phase::Upload,
            total_files: units.len() as u64,
            total_size: units.iter().map(|u| u.size()).sum(),
            ..Default::default()
        };
        self.run_tracked(units, &mut progress, sink).await
    }

    /// Like [`run`](Self::run), but snapshots continue from the counters
    /// already in `progress`, which is left holding the final values.
    /// Used when one upload is split over several unit sets.
    pub async fn run_tracked<U: TransferUnit>(
        &self,
        units: &mut [U],
        progress: &mut ProgressSnapshot,
        sink: &mut dyn ProgressSink,
    ) -> FinalReport {
        let start = Instant::now();
        let base = progress.clone();
        let mut report = FinalReport::default();

        let mut queue: VecDeque<usize> = units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.status() == UnitStatus::Ready)
            .map(|(idx, _)| idx)
            .collect();

        log::info!(
            "Uploading {} units, {} per round",
            queue.len(),
            self.options.concurrency
        );

        let width = self.options.concurrency.max(1);
        while !queue.is_empty() {
            let take = width.min(queue.len());
            let round: Vec<usize> = queue.drain(..take).collect();
            self.run_round(units, &round, &mut report, sink).await;
            report.round_sizes.push(round.len());

            progress.rounds_completed += 1;
            progress.done_count = base.done_count + report.done;
            progress.failed_count = base.failed_count + report.failed;
            progress.bytes_transferred = base.bytes_transferred + report.bytes_transferred;
            progress.elapsed_ms = base.elapsed_ms + start.elapsed().as_millis() as u64;
            sink.snapshot(progress);

            // Let other tasks on the runtime make progress between rounds
            tokio::task::yield_now().await;
        }

        // Status buckets cover every unit, including ones settled before this run
        report.done = 0;
        report.failed = 0;
        for unit in units.iter() {
            match unit.status() {
                UnitStatus::Ready => report.ready += 1,
                UnitStatus::Transfer => report.transfer += 1,
                UnitStatus::Done => report.done += 1,
                UnitStatus::Failed => report.failed += 1,
            }
        }

        let elapsed = start.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        progress.elapsed_ms = base.elapsed_ms + report.elapsed_ms;
        report.throughput = if elapsed.as_secs_f64() > 0.0 {
            report.bytes_transferred as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        log::info!(
            "Upload finished: {} done, {} failed, {} bytes in {} rounds ({:.0} B/s)",
            report.done,
            report.failed,
            report.bytes_transferred,
            report.rounds(),
            report.throughput
        );
        report
    }

    async fn run_round<U: TransferUnit>(
        &self,
        units: &mut [U],
        round: &[usize],
        report: &mut FinalReport,
        sink: &mut dyn ProgressSink,
    ) {
        let mut tasks = JoinSet::new();
        let mut in_flight = HashSet::with_capacity(round.len());

        for &idx in round {
            let unit = &mut units[idx];
            if !unit.state_mut().begin() {
                continue;
            }
            let source = unit.path().to_path_buf();
            let dest = self.destination.for_path(&source);
            let transfer = Arc::clone(&self.transfer);
            let check_exists = self.options.check_exists;
            let item_timeout = self.options.item_timeout;
            in_flight.insert(idx);

            tasks.spawn(async move {
                let work = attempt(transfer.as_ref(), &source, &dest, check_exists);
                let outcome = match tokio::time::timeout(item_timeout, work).await {
                    Ok(result) => result,
                    Err(_) => Err(TransferError::timeout(item_timeout)),
                };
                (idx, outcome)
            });
        }

        let deadline = Instant::now() + self.options.round_timeout;
        let mut expired = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((idx, outcome)))) => {
                    in_flight.remove(&idx);
                    self.settle(&mut units[idx], outcome, report, sink);
                }
                Ok(Some(Err(e))) => {
                    log::error!("Transfer task ended abnormally: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    expired = true;
                    break;
                }
            }
        }

        if expired {
            log::warn!(
                "Round deadline of {:?} passed with {} transfers outstanding, cancelling them",
                self.options.round_timeout,
                in_flight.len()
            );
            tasks.abort_all();
        }

        for idx in in_flight {
            let error = if expired {
                TransferError::round_timeout(self.options.round_timeout)
            } else {
                TransferError::Cancelled {
                    message: "transfer task aborted".to_string(),
                }
            };
            self.settle(&mut units[idx], Err(error), report, sink);
        }
    }

    fn settle<U: TransferUnit>(
        &self,
        unit: &mut U,
        outcome: Result<Attempt, TransferError>,
        report: &mut FinalReport,
        sink: &mut dyn ProgressSink,
    ) {
        match outcome {
            Ok(attempt) => {
                if unit.state_mut().complete() {
                    report.done += 1;
                    report.bytes_transferred += unit.size();
                    if matches!(attempt, Attempt::AlreadyPresent) {
                        report.skipped_existing += 1;
                    }
                }
            }
            Err(error) => {
                log::warn!("Transfer failed for {:?}: {}", unit.path(), error);
                let path = unit.path().to_string_lossy().to_string();
                let timed_out = error.is_timeout();
                if unit.state_mut().fail(error.clone()) {
                    report.failed += 1;
                    if timed_out {
                        report.timed_out += 1;
                    }
                    report.failed_units.push(FailedUnit { path, error });
                }
            }
        }

        sink.unit_settled(&*unit);
        if self.options.release_settled {
            unit.release();
        }
    }
}

async fn attempt(
    transfer: &dyn TransferCapability,
    source: &Path,
    dest: &str,
    check_exists: bool,
) -> Result<Attempt, TransferError> {
    if check_exists {
        match transfer.exists(dest).await {
            Ok(true) => return Ok(Attempt::AlreadyPresent),
            Ok(false) => {}
            Err(e) => log::debug!("Existence check failed for {}: {}", dest, e),
        }
    }
    transfer.transfer(source, dest).await?;
    Ok(Attempt::Transferred)
}

/// Paths of every unit currently in `status`
#[cfg(test)]
fn paths_with_status<U: TransferUnit>(units: &[U], status: UnitStatus) -> Vec<PathBuf> {
    units
        .iter()
        .filter(|u| u.status() == status)
        .map(|u| u.path().to_path_buf())
        .collect()
}
