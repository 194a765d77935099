//! Core data models: file records, folder rollups and transfer unit state

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::TransferError;

/// Lifecycle of a transfer unit
///
/// `Ready -> Transfer -> {Done | Failed}`. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Waiting to be dispatched
    #[default]
    Ready,
    /// Dispatched in the current round
    Transfer,
    /// Present at the destination
    Done,
    /// Settled with an error
    Failed,
}

impl UnitStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [UnitStatus; 4] = [
        UnitStatus::Ready,
        UnitStatus::Transfer,
        UnitStatus::Done,
        UnitStatus::Failed,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Ready => "ready",
            UnitStatus::Transfer => "transfer",
            UnitStatus::Done => "done",
            UnitStatus::Failed => "failed",
        }
    }

    /// Parse the string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(UnitStatus::Ready),
            "transfer" => Some(UnitStatus::Transfer),
            "done" => Some(UnitStatus::Done),
            "failed" => Some(UnitStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Failed)
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_advance_to(&self, next: UnitStatus) -> bool {
        matches!(
            (self, next),
            (UnitStatus::Ready, UnitStatus::Transfer)
                | (UnitStatus::Transfer, UnitStatus::Done)
                | (UnitStatus::Transfer, UnitStatus::Failed)
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status plus the error that ended it, if any.
///
/// The status field is private so every change goes through the
/// one-way transitions below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<TransferError>,
}

impl UnitState {
    pub fn status(&self) -> UnitStatus {
        self.status
    }

    pub fn error(&self) -> Option<&TransferError> {
        self.error.as_ref()
    }

    /// ready -> transfer
    pub fn begin(&mut self) -> bool {
        self.advance(UnitStatus::Transfer)
    }

    /// transfer -> done
    pub fn complete(&mut self) -> bool {
        self.advance(UnitStatus::Done)
    }

    /// transfer -> failed, recording the cause
    pub fn fail(&mut self, error: TransferError) -> bool {
        if self.advance(UnitStatus::Failed) {
            self.error = Some(error);
            true
        } else {
            false
        }
    }

    fn advance(&mut self, next: UnitStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            log::debug!("Rejected status transition {} -> {}", self.status, next);
            false
        }
    }
}

/// Something the upload scheduler can dispatch
///
/// The scheduler only sees a path, a size and a state; it does not care
/// whether the unit is a single file or a whole first-level folder.
pub trait TransferUnit: Send {
    /// Local source path (empty once released)
    fn path(&self) -> &Path;
    /// Bytes this unit contributes when done
    fn size(&self) -> u64;
    /// Files covered by this unit
    fn file_count(&self) -> u64 {
        1
    }
    fn state(&self) -> &UnitState;
    fn state_mut(&mut self) -> &mut UnitState;
    /// Drop large buffers once the unit has settled
    fn release(&mut self);

    fn status(&self) -> UnitStatus {
        self.state().status()
    }
}

impl<T: TransferUnit + ?Sized> TransferUnit for &mut T {
    fn path(&self) -> &Path {
        (**self).path()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn file_count(&self) -> u64 {
        (**self).file_count()
    }

    fn state(&self) -> &UnitState {
        (**self).state()
    }

    fn state_mut(&mut self) -> &mut UnitState {
        (**self).state_mut()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// A file found during the walk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Full path to the file
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    #[serde(flatten)]
    pub state: UnitState,
}

impl FileRecord {
    pub fn new(path: PathBuf, size: u64) -> Self {
        Self {
            path,
            size,
            state: UnitState::default(),
        }
    }
}

impl TransferUnit for FileRecord {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn state(&self) -> &UnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UnitState {
        &mut self.state
    }

    fn release(&mut self) {
        self.path = PathBuf::new();
    }
}

/// Rollup of one first-level subtree of the scan root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderAggregate {
    /// Full path to the first-level folder
    pub path: PathBuf,
    /// Files nested anywhere below this folder
    pub file_count: u64,
    /// Sum of their sizes
    pub total_size: u64,
    /// The folder itself could not be listed; totals are incomplete
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreadable: bool,
    #[serde(flatten)]
    pub state: UnitState,
}

impl FolderAggregate {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file_count: 0,
            total_size: 0,
            unreadable: false,
            state: UnitState::default(),
        }
    }
}

impl TransferUnit for FolderAggregate {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.total_size
    }

    fn file_count(&self) -> u64 {
        self.file_count
    }

    fn state(&self) -> &UnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UnitState {
        &mut self.state
    }

    fn release(&mut self) {
        self.path = PathBuf::new();
    }
}

/// The result of walking one first-level subtree, returned by a worker slot
#[derive(Debug, Default)]
pub struct SubtreeBatch {
    /// First-level folder this batch belongs to (`None` for files in the root)
    pub folder: Option<PathBuf>,
    /// Files found in the subtree
    pub files: Vec<FileRecord>,
    /// Directories listed successfully
    pub processed_dirs: u64,
    /// Number of files found
    pub file_count: u64,
    /// Sum of file sizes
    pub total_size: u64,
    /// Entries that could not be listed or stat'ed
    pub skipped_entries: u64,
    /// The subtree's own top directory could not be listed
    pub unreadable: bool,
}

impl SubtreeBatch {
    /// An empty batch for a subtree whose top directory failed to list
    pub fn unreadable(folder: PathBuf) -> Self {
        Self {
            folder: Some(folder),
            unreadable: true,
            ..Default::default()
        }
    }

    /// Append a file and keep the rollup in step
    pub fn push(&mut self, record: FileRecord) {
        self.file_count += 1;
        self.total_size += record.size;
        self.files.push(record);
    }
}

/// Consistent read of the aggregator's totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub root_name: String,
    pub total_files: u64,
    pub total_size: u64,
    pub processed_dirs: u64,
    pub folder_count: usize,
    pub skipped_entries: u64,
    pub skipped_subtrees: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_one_way() {
        use UnitStatus::*;
        assert!(Ready.can_advance_to(Transfer));
        assert!(Transfer.can_advance_to(Done));
        assert!(Transfer.can_advance_to(Failed));

        assert!(!Ready.can_advance_to(Done));
        assert!(!Done.can_advance_to(Ready));
        assert!(!Done.can_advance_to(Transfer));
        assert!(!Failed.can_advance_to(Ready));
        assert!(!Failed.can_advance_to(Done));
        assert!(!Transfer.can_advance_to(Ready));
    }

    #[test]
    fn test_unit_state_rejects_backward_moves() {
        let mut state = UnitState::default();
        assert!(!state.complete());
        assert!(state.begin());
        assert!(state.complete());
        assert_eq!(state.status(), UnitStatus::Done);

        assert!(!state.begin());
        assert!(!state.fail(TransferError::failed("late")));
        assert_eq!(state.status(), UnitStatus::Done);
        assert!(state.error().is_none());
    }

    #[test]
    fn test_fail_records_error() {
        let mut state = UnitState::default();
        state.begin();
        assert!(state.fail(TransferError::failed("denied")));
        assert_eq!(state.status(), UnitStatus::Failed);
        assert_eq!(state.error(), Some(&TransferError::failed("denied")));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in UnitStatus::ALL {
            assert_eq!(UnitStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UnitStatus::parse("new"), None);
    }

    #[test]
    fn test_file_record_serialization() {
        let record = FileRecord::new(PathBuf::from("/data/a.bin"), 42);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["path"], "/data/a.bin");
        assert_eq!(json["size"], 42);
        assert_eq!(json["status"], "ready");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_release_clears_path_only() {
        let mut folder = FolderAggregate::new(PathBuf::from("/data/photos"));
        folder.file_count = 3;
        folder.total_size = 300;
        folder.release();
        assert_eq!(folder.path(), Path::new(""));
        assert_eq!(folder.size(), 300);
    }

    #[test]
    fn test_batch_push_keeps_rollup() {
        let mut batch = SubtreeBatch::default();
        batch.push(FileRecord::new(PathBuf::from("/a"), 10));
        batch.push(FileRecord::new(PathBuf::from("/b"), 20));
        assert_eq!(batch.file_count, 2);
        assert_eq!(batch.total_size, 30);
        assert!(!batch.unreadable);
    }
}
