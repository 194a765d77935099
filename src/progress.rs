//! Progress reporting for scan and upload phases
//!
//! The walker and the scheduler push [`ProgressSnapshot`]s into a
//! [`ProgressSink`]. Rendering and throttling are the sink's business;
//! [`JsonLinesReporter`] writes throttled JSON lines to stderr.

use serde::Serialize;
use std::io::Write;
use std::time::Instant;

use crate::config::RunConfig;
use crate::models::{ScanSnapshot, TransferUnit};
use crate::pipeline::RunSummary;

/// Run phase indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Walking the tree
    #[default]
    Scan,
    /// Transferring units
    Upload,
    /// Run completed
    Done,
}

impl Phase {
    /// Get string representation of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scan => "scan",
            Phase::Upload => "upload",
            Phase::Done => "done",
        }
    }
}

/// Point-in-time view handed to a sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub total_files: u64,
    pub total_size: u64,
    pub processed_dirs: u64,
    pub rounds_completed: u64,
    pub done_count: u64,
    pub failed_count: u64,
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
}

impl ProgressSnapshot {
    /// Snapshot of a scan in progress
    pub fn scanning(scan: &ScanSnapshot, elapsed_ms: u64) -> Self {
        Self {
            phase: Phase::Scan,
            total_files: scan.total_files,
            total_size: scan.total_size,
            processed_dirs: scan.processed_dirs,
            elapsed_ms,
            ..Default::default()
        }
    }
}

/// Receiver of progress events
pub trait ProgressSink: Send {
    /// Called once before any work begins
    fn started(&mut self, _config: &RunConfig) {}

    /// Called after every walker batch and every upload round
    fn snapshot(&mut self, snapshot: &ProgressSnapshot);

    /// Called once per unit as soon as it reaches a terminal status,
    /// before its buffers are released
    fn unit_settled(&mut self, _unit: &dyn TransferUnit) {}

    /// Called once with the final summary
    fn finished(&mut self, _summary: &RunSummary) {}
}

/// Sink that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn snapshot(&mut self, _snapshot: &ProgressSnapshot) {}
}

/// Start message sent when the run begins
#[derive(Debug, Clone, Serialize)]
pub struct StartMessage {
    /// Message type identifier
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    pub root: String,
    pub workers: usize,
    pub upload: bool,
    pub mode: &'static str,
    pub concurrency: usize,
}

/// Progress message sent during the run
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    /// Message type identifier ("p" for progress)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    pub phase: Phase,
    /// Files found
    #[serde(rename = "f")]
    pub files: u64,
    /// Bytes found
    #[serde(rename = "s")]
    pub size: u64,
    /// Directories listed
    #[serde(rename = "d")]
    pub dirs: u64,
    /// Upload rounds completed
    #[serde(rename = "r")]
    pub rounds: u64,
    /// Units done
    #[serde(rename = "ok")]
    pub done: u64,
    /// Units failed
    #[serde(rename = "err")]
    pub failed: u64,
    /// Bytes transferred
    #[serde(rename = "b")]
    pub bytes: u64,
    /// Elapsed time in milliseconds
    pub ms: u64,
}

impl ProgressMessage {
    fn from_snapshot(seq: u64, ts: u64, snapshot: &ProgressSnapshot) -> Self {
        Self {
            msg_type: "p",
            seq,
            ts,
            phase: snapshot.phase,
            files: snapshot.total_files,
            size: snapshot.total_size,
            dirs: snapshot.processed_dirs,
            rounds: snapshot.rounds_completed,
            done: snapshot.done_count,
            failed: snapshot.failed_count,
            bytes: snapshot.bytes_transferred,
            ms: snapshot.elapsed_ms,
        }
    }
}

/// Done message sent when the run completes
#[derive(Debug, Clone, Serialize)]
pub struct DoneMessage {
    /// Message type identifier ("done" for completion)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    /// Total number of files found
    #[serde(rename = "tf")]
    pub total_files: u64,
    /// Total bytes found
    #[serde(rename = "tb")]
    pub total_size: u64,
    /// Units per status bucket
    pub ready: u64,
    pub transfer: u64,
    pub done: u64,
    pub failed: u64,
    /// Bytes transferred
    #[serde(rename = "b")]
    pub bytes: u64,
    /// Total run duration in milliseconds
    pub ms: u64,
}

/// Throttled JSON-lines reporter
///
/// Snapshots are written at most once per `interval_ms`; start and done
/// messages are always written.
pub struct ProgressReporter<W: Write + Send = std::io::Stderr> {
    out: W,
    interval_ms: u64,
    last_report: Option<Instant>,
    seq: u64,
    start_time: Instant,
}

/// Reporter writing to stderr
pub type JsonLinesReporter = ProgressReporter<std::io::Stderr>;

impl ProgressReporter<std::io::Stderr> {
    /// Create a reporter writing to stderr
    pub fn stderr(interval_ms: u64) -> Self {
        Self::new(std::io::stderr(), interval_ms)
    }
}

impl<W: Write + Send> ProgressReporter<W> {
    pub fn new(out: W, interval_ms: u64) -> Self {
        Self {
            out,
            interval_ms,
            last_report: None,
            seq: 0,
            start_time: Instant::now(),
        }
    }

    /// Check if enough time has passed since the last report
    pub fn should_report(&self) -> bool {
        match self.last_report {
            None => true,
            Some(last) => last.elapsed().as_millis() as u64 >= self.interval_ms,
        }
    }

    /// Get the next sequence number (monotonically increasing)
    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Get the current timestamp in milliseconds since reporter creation
    fn current_timestamp(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    fn emit<T: Serialize>(&mut self, msg: &T) {
        if let Ok(json) = serde_json::to_string(msg) {
            writeln!(self.out, "{}", json).ok();
            self.out.flush().ok();
        }
    }

    /// Consume the reporter and return the writer
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ProgressSink for ProgressReporter<W> {
    fn started(&mut self, config: &RunConfig) {
        let msg = StartMessage {
            msg_type: "start",
            seq: self.next_seq(),
            ts: self.current_timestamp(),
            root: config.root.to_string_lossy().to_string(),
            workers: config.effective_workers(),
            upload: config.upload,
            mode: config.mode.as_str(),
            concurrency: config.concurrency,
        };
        self.emit(&msg);
    }

    fn snapshot(&mut self, snapshot: &ProgressSnapshot) {
        if !self.should_report() {
            return;
        }
        let msg = ProgressMessage::from_snapshot(self.next_seq(), self.current_timestamp(), snapshot);
        self.emit(&msg);
        self.last_report = Some(Instant::now());
    }

    fn finished(&mut self, summary: &RunSummary) {
        let upload = summary.upload.as_ref();
        let msg = DoneMessage {
            msg_type: "done",
            seq: self.next_seq(),
            ts: self.current_timestamp(),
            total_files: summary.scan.total_files,
            total_size: summary.scan.total_size,
            ready: upload.map_or(0, |u| u.ready),
            transfer: upload.map_or(0, |u| u.transfer),
            done: upload.map_or(0, |u| u.done),
            failed: upload.map_or(0, |u| u.failed),
            bytes: upload.map_or(0, |u| u.bytes_transferred),
            ms: summary.duration_ms,
        };
        self.emit(&msg);
    }
}

/// Sink that keeps everything it sees, for assertions in tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub snapshots: Vec<ProgressSnapshot>,
    pub settled: Vec<(std::path::PathBuf, crate::models::UnitStatus)>,
}

#[cfg(test)]
impl ProgressSink for RecordingSink {
    fn snapshot(&mut self, snapshot: &ProgressSnapshot) {
        self.snapshots.push(snapshot.clone());
    }

    fn unit_settled(&mut self, unit: &dyn TransferUnit) {
        self.settled.push((unit.path().to_path_buf(), unit.status()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(reporter: ProgressReporter<Vec<u8>>) -> Vec<serde_json::Value> {
        String::from_utf8(reporter.into_inner())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Scan).unwrap(), "\"scan\"");
        assert_eq!(serde_json::to_string(&Phase::Upload).unwrap(), "\"upload\"");
        assert_eq!(Phase::Done.as_str(), "done");
    }

    #[test]
    fn test_start_message() {
        let mut reporter = ProgressReporter::new(Vec::new(), 1000);
        let config = RunConfig::builder().root("/data").num_workers(3).build();
        reporter.started(&config);

        let out = lines(reporter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["_t"], "start");
        assert_eq!(out[0]["seq"], 0);
        assert_eq!(out[0]["root"], "/data");
        assert_eq!(out[0]["workers"], 3);
        assert_eq!(out[0]["mode"], "files");
    }

    #[test]
    fn test_snapshots_are_throttled() {
        let mut reporter = ProgressReporter::new(Vec::new(), 60_000);
        let snap = ProgressSnapshot {
            total_files: 5,
            total_size: 50,
            ..Default::default()
        };
        reporter.snapshot(&snap);
        reporter.snapshot(&snap);
        reporter.snapshot(&snap);

        let out = lines(reporter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["_t"], "p");
        assert_eq!(out[0]["f"], 5);
        assert_eq!(out[0]["s"], 50);
        assert_eq!(out[0]["phase"], "scan");
    }

    #[test]
    fn test_snapshots_resume_after_interval() {
        let mut reporter = ProgressReporter::new(Vec::new(), 10);
        let snap = ProgressSnapshot::default();
        reporter.snapshot(&snap);
        std::thread::sleep(std::time::Duration::from_millis(20));
        reporter.snapshot(&snap);

        let out = lines(reporter);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["seq"], 1);
    }

    #[test]
    fn test_scanning_snapshot() {
        let scan = ScanSnapshot {
            total_files: 6,
            total_size: 210,
            processed_dirs: 4,
            ..Default::default()
        };
        let snap = ProgressSnapshot::scanning(&scan, 15);
        assert_eq!(snap.phase, Phase::Scan);
        assert_eq!(snap.total_files, 6);
        assert_eq!(snap.total_size, 210);
        assert_eq!(snap.processed_dirs, 4);
        assert_eq!(snap.elapsed_ms, 15);
        assert_eq!(snap.rounds_completed, 0);
    }
}
