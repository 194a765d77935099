//! SQLite inventory of runs and per-unit upload outcomes
//!
//! The database is optional. When configured, each run is recorded with its
//! scan totals, and every unit's terminal status is written as it settles.
//! A later run with `resume` skips units already recorded as done for the
//! same destination.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result as SqliteResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::RunConfig;
use crate::models::{ScanSnapshot, TransferUnit, UnitStatus};
use crate::pipeline::RunSummary;
use crate::progress::{Phase, ProgressSink, ProgressSnapshot};

/// One unit row waiting to be written
#[derive(Debug, Clone)]
pub struct UnitRow {
    pub path: String,
    pub size: u64,
    pub file_count: u64,
    pub status: String,
    pub error: Option<String>,
}

/// What an earlier run uploaded for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneUnit {
    pub size: u64,
    pub file_count: u64,
}

impl DoneUnit {
    /// Whether `unit` still has the shape that was uploaded
    pub fn matches(&self, unit: &dyn TransferUnit) -> bool {
        self.size == unit.size() && self.file_count == unit.file_count()
    }
}

/// Inventory database handle
pub struct InventoryDb {
    conn: Connection,
}

impl InventoryDb {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                root TEXT NOT NULL,
                destination TEXT,
                mode TEXT NOT NULL,
                total_files INTEGER NOT NULL,
                total_size INTEGER NOT NULL,
                processed_dirs INTEGER NOT NULL,
                done INTEGER,
                failed INTEGER,
                bytes_transferred INTEGER
            );

            CREATE TABLE IF NOT EXISTS units (
                destination TEXT NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                file_count INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,
                error TEXT,
                run_id INTEGER NOT NULL,
                PRIMARY KEY (destination, path)
            );
            CREATE INDEX IF NOT EXISTS idx_units_status ON units(destination, status);
            ",
        )?;
        Ok(())
    }

    /// Record the start of a run, returning its id
    pub fn begin_run(
        &mut self,
        config: &RunConfig,
        scan: &ScanSnapshot,
        started_at: DateTime<Utc>,
    ) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO runs (started_at, root, destination, mode, total_files, total_size, processed_dirs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                started_at.to_rfc3339(),
                config.root.to_string_lossy().replace('\\', "/"),
                config.destination,
                config.mode.as_str(),
                scan.total_files as i64,
                scan.total_size as i64,
                scan.processed_dirs as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Record the end of a run
    pub fn finish_run(&mut self, run_id: i64, summary: &RunSummary) -> SqliteResult<()> {
        let upload = summary.upload.as_ref();
        self.conn.execute(
            "UPDATE runs SET finished_at = ?1, done = ?2, failed = ?3, bytes_transferred = ?4 WHERE id = ?5",
            params![
                summary.finished_at.to_rfc3339(),
                upload.map(|u| u.done as i64),
                upload.map(|u| u.failed as i64),
                upload.map(|u| u.bytes_transferred as i64),
                run_id,
            ],
        )?;
        Ok(())
    }

    /// Batch insert/update unit outcomes
    pub fn upsert_units(&mut self, run_id: i64, destination: &str, rows: &[UnitRow]) -> SqliteResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO units (destination, path, size, file_count, status, error, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in rows {
                stmt.execute(params![
                    destination,
                    row.path,
                    row.size as i64,
                    row.file_count as i64,
                    row.status,
                    row.error,
                    run_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Units already uploaded to `destination`, with the size and file
    /// count they had at the time
    pub fn load_done_units(&self, destination: &str) -> SqliteResult<HashMap<PathBuf, DoneUnit>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, size, file_count FROM units WHERE destination = ?1 AND status = 'done'",
        )?;
        let rows = stmt.query_map([destination], |row| {
            Ok((
                row.get::<_, String>(0)?,
                DoneUnit {
                    size: row.get::<_, i64>(1)? as u64,
                    file_count: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;

        let mut units = HashMap::new();
        for row in rows {
            let (path, done) = row?;
            units.insert(PathBuf::from(path), done);
        }
        Ok(units)
    }

    /// Get unit counts per status for a destination
    pub fn status_counts(&self, destination: &str) -> SqliteResult<HashMap<UnitStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM units WHERE destination = ?1 GROUP BY status")?;
        let rows = stmt.query_map([destination], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            match UnitStatus::parse(&status) {
                Some(status) => {
                    counts.insert(status, count);
                }
                None => log::warn!("Ignoring unknown unit status {:?} in inventory", status),
            }
        }
        Ok(counts)
    }

    /// Get run count
    pub fn run_count(&self) -> SqliteResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Sink adapter that writes settled units to the database once per round
/// and forwards everything to the wrapped sink
pub struct PersistingSink<'a> {
    inner: &'a mut dyn ProgressSink,
    db: &'a mut InventoryDb,
    run_id: i64,
    destination: String,
    pending: Vec<UnitRow>,
}

impl<'a> PersistingSink<'a> {
    pub fn new(
        inner: &'a mut dyn ProgressSink,
        db: &'a mut InventoryDb,
        run_id: i64,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            db,
            run_id,
            destination: destination.into(),
            pending: Vec::new(),
        }
    }

    /// Write buffered rows; failures are logged, never fatal
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Err(e) = self.db.upsert_units(self.run_id, &self.destination, &self.pending) {
            log::error!("Failed to record {} unit outcomes: {}", self.pending.len(), e);
        }
        self.pending.clear();
    }
}

impl ProgressSink for PersistingSink<'_> {
    fn started(&mut self, config: &RunConfig) {
        self.inner.started(config);
    }

    fn snapshot(&mut self, snapshot: &ProgressSnapshot) {
        if snapshot.phase == Phase::Upload {
            self.flush();
        }
        self.inner.snapshot(snapshot);
    }

    fn unit_settled(&mut self, unit: &dyn TransferUnit) {
        let state = unit.state();
        self.pending.push(UnitRow {
            path: unit.path().to_string_lossy().replace('\\', "/"),
            size: unit.size(),
            file_count: unit.file_count(),
            status: state.status().as_str().to_string(),
            error: state.error().map(|e| e.to_string()),
        });
        self.inner.unit_settled(unit);
    }

    fn finished(&mut self, summary: &RunSummary) {
        self.flush();
        self.inner.finished(summary);
    }
}

impl Drop for PersistingSink<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::models::{FileRecord, FolderAggregate};
    use crate::progress::NullSink;

    fn row(path: &str, status: &str) -> UnitRow {
        UnitRow {
            path: path.to_string(),
            size: 10,
            file_count: 1,
            status: status.to_string(),
            error: None,
        }
    }

    #[test]
    fn test_begin_run() {
        let mut db = InventoryDb::open_in_memory().unwrap();
        let config = RunConfig::builder().root("/data").upload_to("remote:b").build();
        let scan = ScanSnapshot {
            total_files: 3,
            total_size: 30,
            ..Default::default()
        };
        let id = db.begin_run(&config, &scan, Utc::now()).unwrap();
        assert!(id > 0);
        assert_eq!(db.run_count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_and_load_done() {
        let mut db = InventoryDb::open_in_memory().unwrap();
        db.upsert_units(1, "remote:b", &[row("/r/a", "done"), row("/r/b", "failed")])
            .unwrap();
        db.upsert_units(2, "remote:b", &[row("/r/b", "done")]).unwrap();
        db.upsert_units(2, "other", &[row("/r/c", "done")]).unwrap();

        let done = db.load_done_units("remote:b").unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.contains_key(Path::new("/r/a")));
        assert_eq!(
            done.get(Path::new("/r/b")),
            Some(&DoneUnit {
                size: 10,
                file_count: 1
            })
        );

        let counts = db.status_counts("remote:b").unwrap();
        assert_eq!(counts.get(&UnitStatus::Done), Some(&2));
        assert_eq!(counts.get(&UnitStatus::Failed), None);
    }

    #[test]
    fn test_persisting_sink_flushes_per_round() {
        let mut db = InventoryDb::open_in_memory().unwrap();
        let mut inner = NullSink;
        {
            let mut sink = PersistingSink::new(&mut inner, &mut db, 1, "remote:b");
            let mut unit = FileRecord::new(PathBuf::from("/r/x"), 5);
            unit.state.begin();
            unit.state.fail(TransferError::failed("denied"));
            sink.unit_settled(&unit);
            assert_eq!(sink.pending.len(), 1);

            sink.snapshot(&ProgressSnapshot {
                phase: Phase::Upload,
                ..Default::default()
            });
            assert!(sink.pending.is_empty());
        }

        let counts = db.status_counts("remote:b").unwrap();
        assert_eq!(counts.get(&UnitStatus::Failed), Some(&1));
    }

    #[test]
    fn test_done_unit_matches_shape() {
        let mut folder = FolderAggregate::new(PathBuf::from("/r/photos"));
        folder.file_count = 2;
        folder.total_size = 30;
        let done = DoneUnit {
            size: 30,
            file_count: 2,
        };
        assert!(done.matches(&folder));

        // same bytes, different files
        folder.file_count = 3;
        assert!(!done.matches(&folder));

        let file = FileRecord::new(PathBuf::from("/r/a"), 31);
        assert!(!DoneUnit {
            size: 30,
            file_count: 1
        }
        .matches(&file));
    }

    #[test]
    fn test_folder_rows_keep_file_count() {
        let mut db = InventoryDb::open_in_memory().unwrap();
        let mut inner = NullSink;
        {
            let mut sink = PersistingSink::new(&mut inner, &mut db, 1, "remote:b");
            let mut folder = FolderAggregate::new(PathBuf::from("/r/photos"));
            folder.file_count = 4;
            folder.total_size = 400;
            folder.state.begin();
            folder.state.complete();
            sink.unit_settled(&folder);
        }
        let done = db.load_done_units("remote:b").unwrap();
        assert_eq!(
            done.get(Path::new("/r/photos")),
            Some(&DoneUnit {
                size: 400,
                file_count: 4
            })
        );
    }

    #[test]
    fn test_open_file_database() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("inventory.db");
        {
            let mut db = InventoryDb::open(&path).unwrap();
            db.upsert_units(1, "d", &[row("/r/a", "done")]).unwrap();
        }
        let db = InventoryDb::open(&path).unwrap();
        assert_eq!(db.load_done_units("d").unwrap().len(), 1);
    }
}
