//! SQLite persistence for jobs, allocations and tasks.
//!
//! Every mutating call outside [`Store::add_job`] is one committed
//! statement. `add_job` runs inside a single transaction so a failure
//! partway leaves no job row pointing at missing allocations.

mod lock;

pub use lock::LockHolder;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{FromSql, ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FarmError, Result};
use crate::scheduler::job::{Allocation, Job, Status, Task};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    allocation_ids TEXT NOT NULL DEFAULT '[]',
    purpose TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    "type" TEXT NOT NULL,
    environment TEXT NOT NULL DEFAULT '{}',
    parameters TEXT NOT NULL DEFAULT '{}',
    "range" TEXT NOT NULL,
    status TEXT NOT NULL,
    dependencies TEXT NOT NULL DEFAULT '[]',
    allocation_size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id),
    task_ids TEXT NOT NULL DEFAULT '[]',
    computer TEXT,
    status TEXT NOT NULL,
    info TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id),
    allocation_id INTEGER NOT NULL REFERENCES allocations(id),
    frame INTEGER NOT NULL,
    status TEXT NOT NULL,
    computer TEXT
);

CREATE INDEX IF NOT EXISTS idx_allocations_job ON allocations(job_id);
CREATE INDEX IF NOT EXISTS idx_tasks_allocation ON tasks(allocation_id);

CREATE TABLE IF NOT EXISTS coordinator_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    address TEXT NOT NULL,
    heartbeat_time INTEGER NOT NULL
);
"#;

const JOB_COLUMNS: &str = r#"id, name, allocation_ids, purpose, metadata, "type", environment, parameters, "range", status, dependencies, allocation_size"#;
const ALLOCATION_COLUMNS: &str = "id, job_id, task_ids, computer, status, info";
const TASK_COLUMNS: &str = "id, job_id, allocation_id, frame, status, computer";

/// A column of one of the three tables, addressable by the generic
/// [`Store::get`] / [`Store::set`] accessors.
pub trait Column: Copy {
    const TABLE: &'static str;

    fn name(self) -> &'static str;

    fn not_found(id: i64) -> FarmError;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobColumn {
    Name,
    AllocationIds,
    Purpose,
    Metadata,
    Type,
    Environment,
    Parameters,
    Range,
    Status,
    Dependencies,
    AllocationSize,
}

impl Column for JobColumn {
    const TABLE: &'static str = "jobs";

    fn name(self) -> &'static str {
        match self {
            JobColumn::Name => "name",
            JobColumn::AllocationIds => "allocation_ids",
            JobColumn::Purpose => "purpose",
            JobColumn::Metadata => "metadata",
            JobColumn::Type => "type",
            JobColumn::Environment => "environment",
            JobColumn::Parameters => "parameters",
            JobColumn::Range => "range",
            JobColumn::Status => "status",
            JobColumn::Dependencies => "dependencies",
            JobColumn::AllocationSize => "allocation_size",
        }
    }

    fn not_found(id: i64) -> FarmError {
        FarmError::JobNotFound(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationColumn {
    JobId,
    TaskIds,
    Computer,
    Status,
    Info,
}

impl Column for AllocationColumn {
    const TABLE: &'static str = "allocations";

    fn name(self) -> &'static str {
        match self {
            AllocationColumn::JobId => "job_id",
            AllocationColumn::TaskIds => "task_ids",
            AllocationColumn::Computer => "computer",
            AllocationColumn::Status => "status",
            AllocationColumn::Info => "info",
        }
    }

    fn not_found(id: i64) -> FarmError {
        FarmError::AllocationNotFound(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskColumn {
    JobId,
    AllocationId,
    Frame,
    Status,
    Computer,
}

impl Column for TaskColumn {
    const TABLE: &'static str = "tasks";

    fn name(self) -> &'static str {
        match self {
            TaskColumn::JobId => "job_id",
            TaskColumn::AllocationId => "allocation_id",
            TaskColumn::Frame => "frame",
            TaskColumn::Status => "status",
            TaskColumn::Computer => "computer",
        }
    }

    fn not_found(id: i64) -> FarmError {
        FarmError::TaskNotFound(id)
    }
}

/// Handle to the shared database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, path)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self> {
        // Several processes share the file; wait for their writes instead of
        // failing with SQLITE_BUSY.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "Store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FarmError::Internal(format!("store lock poisoned: {e}")))
    }

    /// Insert a job and split it into allocations and tasks.
    ///
    /// The frame list is cut into contiguous chunks of `allocation_size`;
    /// each chunk becomes one allocation with one task per frame.
    pub fn add_job(&self, job: &Job) -> Result<i64> {
        if job.allocation_size == 0 {
            return Err(FarmError::InvalidDescriptor(
                "allocation size must be at least 1".into(),
            ));
        }
        let frames = job.frame_range()?.frames();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"INSERT INTO jobs (id, name, allocation_ids, purpose, metadata, "type", environment,
                                 parameters, "range", status, dependencies, allocation_size)
               VALUES (?1, ?2, '[]', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                job.id,
                job.name,
                job.purpose.as_str(),
                to_json(&job.metadata)?,
                job.kind,
                to_json(&job.environment)?,
                to_json(&job.parameters)?,
                job.range,
                Status::Pending.as_str(),
                to_json(&job.dependencies)?,
                job.allocation_size as i64,
            ],
        )?;

        let mut allocation_ids = Vec::new();
        for chunk in frames.chunks(job.allocation_size) {
            tx.execute(
                "INSERT INTO allocations (job_id, task_ids, computer, status, info)
                 VALUES (?1, '[]', NULL, ?2, NULL)",
                params![job.id, Status::Pending.as_str()],
            )?;
            let allocation_id = tx.last_insert_rowid();

            let mut task_ids = Vec::with_capacity(chunk.len());
            for frame in chunk {
                tx.execute(
                    "INSERT INTO tasks (job_id, allocation_id, frame, status, computer)
                     VALUES (?1, ?2, ?3, ?4, NULL)",
                    params![job.id, allocation_id, frame, Status::Pending.as_str()],
                )?;
                task_ids.push(tx.last_insert_rowid());
            }

            tx.execute(
                "UPDATE allocations SET task_ids = ?1 WHERE id = ?2",
                params![to_json(&task_ids)?, allocation_id],
            )?;
            allocation_ids.push(allocation_id);
        }

        tx.execute(
            "UPDATE jobs SET allocation_ids = ?1 WHERE id = ?2",
            params![to_json(&allocation_ids)?, job.id],
        )?;
        tx.commit()?;

        tracing::info!(
            job_id = job.id,
            name = %job.name,
            frames = frames.len(),
            allocations = allocation_ids.len(),
            "Job added"
        );
        Ok(job.id)
    }

    /// Read one column of one row.
    pub fn get<C: Column, T: FromSql>(&self, column: C, id: i64) -> Result<T> {
        let sql = format!(
            "SELECT \"{}\" FROM {} WHERE id = ?1",
            column.name(),
            C::TABLE
        );
        self.conn()?
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| C::not_found(id))
    }

    /// Write one column of one row.
    pub fn set<C: Column, T: ToSql>(&self, column: C, id: i64, value: T) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET \"{}\" = ?1 WHERE id = ?2",
            C::TABLE,
            column.name()
        );
        let changed = self.conn()?.execute(&sql, params![value, id])?;
        if changed == 0 {
            return Err(C::not_found(id));
        }
        Ok(())
    }

    pub fn set_job_status(&self, id: i64, status: Status) -> Result<()> {
        self.set(JobColumn::Status, id, status.as_str())
    }

    pub fn set_job_metadata(&self, id: i64, metadata: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        self.set(JobColumn::Metadata, id, to_json(metadata)?)
    }

    /// Persist status, computer and info of an allocation in one statement.
    pub fn update_allocation(&self, allocation: &Allocation) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE allocations SET status = ?1, computer = ?2, info = ?3 WHERE id = ?4",
            params![
                allocation.status.as_str(),
                allocation.computer,
                allocation.info,
                allocation.id
            ],
        )?;
        if changed == 0 {
            return Err(FarmError::AllocationNotFound(allocation.id));
        }
        Ok(())
    }

    /// Persist status and computer of a task in one statement.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE tasks SET status = ?1, computer = ?2 WHERE id = ?3",
            params![task.status.as_str(), task.computer, task.id],
        )?;
        if changed == 0 {
            return Err(FarmError::TaskNotFound(task.id));
        }
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        self.conn()?
            .query_row(&sql, params![id], job_from_row)
            .optional()?
            .ok_or(FarmError::JobNotFound(id))
    }

    pub fn get_allocation(&self, id: i64) -> Result<Allocation> {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = ?1");
        self.conn()?
            .query_row(&sql, params![id], allocation_from_row)
            .optional()?
            .ok_or(FarmError::AllocationNotFound(id))
    }

    pub fn get_task(&self, id: i64) -> Result<Task> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        self.conn()?
            .query_row(&sql, params![id], task_from_row)
            .optional()?
            .ok_or(FarmError::TaskNotFound(id))
    }

    /// Jobs whose status is one of `statuses`, ordered by id.
    pub fn jobs_with_status(&self, statuses: &[Status]) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY rowid");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            let job = row?;
            if statuses.contains(&job.status) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn all_jobs(&self) -> Result<Vec<Job>> {
        self.jobs_with_status(&[
            Status::Pending,
            Status::InProgress,
            Status::Done,
            Status::Failed,
        ])
    }

    pub fn allocations_for_job(&self, job_id: i64) -> Result<Vec<Allocation>> {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE job_id = ?1 ORDER BY id");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_id], allocation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tasks_for_allocation(&self, allocation_id: i64) -> Result<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE allocation_id = ?1 ORDER BY id");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![allocation_id], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Read a TEXT column holding JSON.
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a TEXT column holding an enum in its string form.
fn parsed_column<T: FromStr<Err = FarmError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let allocation_size: i64 = row.get(11)?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        allocation_ids: json_column(row, 2)?,
        purpose: parsed_column(row, 3)?,
        metadata: json_column(row, 4)?,
        kind: row.get(5)?,
        environment: json_column(row, 6)?,
        parameters: json_column(row, 7)?,
        range: row.get(8)?,
        status: parsed_column(row, 9)?,
        dependencies: json_column(row, 10)?,
        allocation_size: allocation_size.max(1) as usize,
    })
}

fn allocation_from_row(row: &Row<'_>) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        id: row.get(0)?,
        job_id: row.get(1)?,
        task_ids: json_column(row, 2)?,
        computer: row.get(3)?,
        status: parsed_column(row, 4)?,
        info: row.get(5)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        job_id: row.get(1)?,
        allocation_id: row.get(2)?,
        frame: row.get(3)?,
        status: parsed_column(row, 4)?,
        computer: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::range::FrameRange;

    fn render_job(id: i64, range: &str, size: usize) -> Job {
        Job::new(id, format!("render_{id:03}"), "shell", &FrameRange::parse(range).unwrap())
            .with_allocation_size(size)
    }

    #[test]
    fn add_job_splits_frames_into_allocations() {
        let store = Store::open_in_memory().unwrap();
        let id = store.add_job(&render_job(1, "1-10:1", 4)).unwrap();

        let job = store.get_job(id).unwrap();
        assert_eq!(job.allocation_ids.len(), 3);
        assert_eq!(job.status, Status::Pending);

        let frames: Vec<Vec<i64>> = store
            .allocations_for_job(id)
            .unwrap()
            .iter()
            .map(|a| {
                store
                    .tasks_for_allocation(a.id)
                    .unwrap()
                    .iter()
                    .map(|t| t.frame)
                    .collect()
            })
            .collect();
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10]]);
    }

    #[test]
    fn allocation_task_ids_are_backfilled() {
        let store = Store::open_in_memory().unwrap();
        store.add_job(&render_job(2, "1-3:1", 2)).unwrap();
        for allocation in store.allocations_for_job(2).unwrap() {
            let tasks: Vec<i64> = store
                .tasks_for_allocation(allocation.id)
                .unwrap()
                .iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(allocation.task_ids, tasks);
            assert!(allocation.computer.is_none());
        }
    }

    #[test]
    fn duplicate_job_id_leaves_no_partial_rows() {
        let store = Store::open_in_memory().unwrap();
        store.add_job(&render_job(3, "1-4:1", 2)).unwrap();
        let before = store.allocations_for_job(3).unwrap().len();

        assert!(store.add_job(&render_job(3, "1-100:1", 2)).is_err());
        assert_eq!(store.allocations_for_job(3).unwrap().len(), before);
    }

    #[test]
    fn add_job_rejects_zero_allocation_size() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.add_job(&render_job(4, "1-4:1", 0)),
            Err(FarmError::InvalidDescriptor(_))
        ));
        assert!(matches!(store.get_job(4), Err(FarmError::JobNotFound(4))));
    }

    #[test]
    fn generic_column_accessors() {
        let store = Store::open_in_memory().unwrap();
        store.add_job(&render_job(5, "1-2:1", 1)).unwrap();
        let allocation_id = store.get_job(5).unwrap().allocation_ids[0];

        store
            .set(AllocationColumn::Computer, allocation_id, "render01")
            .unwrap();
        let computer: Option<String> = store.get(AllocationColumn::Computer, allocation_id).unwrap();
        assert_eq!(computer.as_deref(), Some("render01"));

        store.set(JobColumn::Name, 5, "renamed").unwrap();
        let name: String = store.get(JobColumn::Name, 5).unwrap();
        assert_eq!(name, "renamed");

        let range: String = store.get(JobColumn::Range, 5).unwrap();
        assert_eq!(range, "1-2:1");

        assert!(matches!(
            store.set(TaskColumn::Status, 9999, "done"),
            Err(FarmError::TaskNotFound(9999))
        ));
    }

    #[test]
    fn jobs_with_status_filters() {
        let store = Store::open_in_memory().unwrap();
        store.add_job(&render_job(10, "1", 1)).unwrap();
        store.add_job(&render_job(11, "1", 1)).unwrap();
        store.set_job_status(11, Status::Done).unwrap();

        let active = store
            .jobs_with_status(&[Status::Pending, Status::InProgress])
            .unwrap();
        assert_eq!(active.iter().map(|j| j.id).collect::<Vec<_>>(), vec![10]);
        assert_eq!(store.all_jobs().unwrap().len(), 2);
    }

    #[test]
    fn update_task_and_allocation() {
        let store = Store::open_in_memory().unwrap();
        store.add_job(&render_job(12, "1-2:1", 2)).unwrap();
        let mut allocation = store.allocations_for_job(12).unwrap().remove(0);
        allocation.status = Status::Failed;
        allocation.info = Some("license server down".into());
        store.update_allocation(&allocation).unwrap();
        assert_eq!(store.get_allocation(allocation.id).unwrap(), allocation);

        let mut task = store.tasks_for_allocation(allocation.id).unwrap().remove(0);
        task.status = Status::InProgress;
        task.computer = Some("render02".into());
        store.update_task(&task).unwrap();
        assert_eq!(store.get_task(task.id).unwrap(), task);
    }
}
