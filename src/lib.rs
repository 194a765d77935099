//! Parallel directory inventory with bounded-concurrency uploads
//!
//! A rayon pool walks the tree one first-level subtree per job while a
//! single coordinator aggregates the results. The inventory can then be
//! uploaded, per file or per first-level folder, in rounds of at most
//! `concurrency` transfers on a tokio runtime.

pub mod aggregator;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod transfer;
pub mod walker;

pub use aggregator::ScanState;
pub use config::{RunConfig, TransferMode};
pub use db::{DoneUnit, InventoryDb, PersistingSink};
pub use error::{ConfigError, Error, Result, ScanError, ScanErrorKind, TransferError};
pub use models::{
    FileRecord, FolderAggregate, ScanSnapshot, SubtreeBatch, TransferUnit, UnitState, UnitStatus,
};
pub use pipeline::{Pipeline, RunOutcome, RunSummary};
pub use probe::{EntryKind, FsProbe, LocalFs, ProbeEntry};
pub use progress::{
    DoneMessage, JsonLinesReporter, NullSink, Phase, ProgressMessage, ProgressReporter, ProgressSink,
    ProgressSnapshot, StartMessage,
};
pub use scheduler::{FailedUnit, FinalReport, SchedulerOptions, UploadScheduler};
pub use transfer::{CommandTransfer, Destination, LocalDirTransfer, TransferCapability};
pub use walker::DirectoryWalker;
