//! Drop-directory ingestor.
//!
//! Job descriptor files dropped into a directory are admitted as jobs. A
//! file is deleted only once its job is safely in the store; a file that
//! cannot be parsed, or whose job id is already taken, is left where it is
//! and reported once until it changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{FarmError, Result};
use crate::events::{self, EventSender, FarmEvent};
use crate::scheduler::job::DEFAULT_ALLOCATION_SIZE;
use crate::scheduler::{FrameRange, Job, Purpose, Scheduler, Status};
use crate::store::Store;

/// `ID` of a descriptor: a ready job id, or the submitter identity the id
/// is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DescriptorId {
    Number(i64),
    Submitter(String),
}

/// On-disk job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Purpose")]
    pub purpose: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Metadata")]
    pub metadata: Map<String, Value>,
    #[serde(rename = "Range")]
    pub range: String,
    #[serde(rename = "ID")]
    pub id: DescriptorId,
    #[serde(rename = "Environment", default)]
    pub environment: Map<String, Value>,
    #[serde(rename = "Dependencies", default)]
    pub dependencies: Vec<i64>,
    #[serde(rename = "Parameters", default)]
    pub parameters: Map<String, Value>,
    #[serde(rename = "Allocation", default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<usize>,
}

impl JobDescriptor {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| FarmError::InvalidDescriptor(e.to_string()))
    }

    /// Validate and turn the descriptor into a pending job.
    pub fn into_job(self, now: DateTime<Utc>) -> Result<Job> {
        let range = FrameRange::parse(&self.range)?;
        let purpose: Purpose = self.purpose.parse()?;
        let allocation_size = self.allocation.unwrap_or(DEFAULT_ALLOCATION_SIZE);
        if allocation_size == 0 {
            return Err(FarmError::InvalidDescriptor(
                "Allocation must be at least 1".into(),
            ));
        }
        if self.kind.is_empty() {
            return Err(FarmError::InvalidDescriptor("Type must not be empty".into()));
        }

        let created_at = self
            .metadata
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now);

        let id = match &self.id {
            DescriptorId::Number(id) => *id,
            DescriptorId::Submitter(submitter) => Job::derive_id(submitter, &self.name, created_at),
        };

        let mut job = Job::new(id, self.name, self.kind, &range)
            .with_purpose(purpose)
            .with_allocation_size(allocation_size);
        job.metadata
            .insert("created_at".into(), Value::String(created_at.to_rfc3339()));
        if let DescriptorId::Submitter(submitter) = self.id {
            job.metadata
                .insert("contributors".into(), Value::Array(vec![Value::String(submitter)]));
        }
        job.metadata.extend(self.metadata);
        job.environment = self.environment;
        job.parameters = self.parameters;
        job.dependencies = self.dependencies;
        job.status = Status::Pending;
        Ok(job)
    }

    /// Drop this descriptor into `dir` for the ingestor to pick up.
    ///
    /// The file is written under a hidden name and renamed into place, so
    /// a scan never sees it half written. File names sort by submission
    /// time.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let stem: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let file_name = format!("{}-{stem}.json", Utc::now().format("%Y%m%dT%H%M%S%3f"));
        let staging = dir.join(format!(".{file_name}.tmp"));
        let path = dir.join(file_name);

        tokio::fs::write(&staging, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(path)
    }
}

pub struct Ingestor {
    drop_dir: PathBuf,
    interval: Duration,
    store: Store,
    scheduler: Arc<Mutex<Scheduler>>,
    events: EventSender,
    /// Files that failed validation, with the modification time they had.
    rejected: HashMap<PathBuf, SystemTime>,
}

impl Ingestor {
    pub fn new(
        drop_dir: impl Into<PathBuf>,
        interval: Duration,
        store: Store,
        scheduler: Arc<Mutex<Scheduler>>,
        events: EventSender,
    ) -> Self {
        Self {
            drop_dir: drop_dir.into(),
            interval,
            store,
            scheduler,
            events,
            rejected: HashMap::new(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.drop_dir).await?;
        tracing::info!(dir = %self.drop_dir.display(), "Ingestor watching drop directory");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.scan_once().await {
                tracing::warn!(dir = %self.drop_dir.display(), error = %e, "Drop directory scan failed");
            }
        }
    }

    /// Ingest every eligible file currently in the drop directory, in name
    /// order. Returns the ids of admitted jobs.
    pub async fn scan_once(&mut self) -> Result<Vec<i64>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.drop_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        self.rejected.retain(|path, _| files.contains(path));

        let mut admitted = Vec::new();
        for path in files {
            match self.ingest_file(&path).await {
                Ok(Some(job_id)) => admitted.push(job_id),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to admit job, file kept");
                }
            }
        }
        Ok(admitted)
    }

    async fn ingest_file(&mut self, path: &Path) -> Result<Option<i64>> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        if self.rejected.get(path) == Some(&modified) {
            return Ok(None);
        }

        let bytes = tokio::fs::read(path).await?;
        let job = match JobDescriptor::from_slice(&bytes).and_then(|d| d.into_job(Utc::now())) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping invalid job descriptor");
                self.rejected.insert(path.to_path_buf(), modified);
                return Ok(None);
            }
        };

        if self.store.get_job(job.id).is_ok() {
            tracing::warn!(path = %path.display(), job_id = job.id, "Job id already admitted, file kept");
            self.rejected.insert(path.to_path_buf(), modified);
            return Ok(None);
        }

        let job_id = self.store.add_job(&job)?;
        self.scheduler.lock().await.sync_job(job_id)?;
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), job_id, error = %e, "Job admitted but its descriptor could not be removed");
            self.rejected.insert(path.to_path_buf(), modified);
        }

        tracing::info!(job_id, name = %job.name, path = %path.display(), "Job admitted");
        events::publish(
            &self.events,
            FarmEvent::JobAdmitted {
                job_id,
                name: job.name,
            },
        );
        Ok(Some(job_id))
    }
}
