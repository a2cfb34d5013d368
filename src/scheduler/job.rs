use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{FarmError, Result};
use crate::scheduler::range::FrameRange;

/// Lifecycle status shared by jobs, allocations and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "inprogress",
            Status::Done => "done",
            Status::Failed => "failed",
        }
    }

    /// Pending and in-progress records are mirrored into the job tree.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Pending | Status::InProgress)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "inprogress" => Ok(Status::InProgress),
            "done" => Ok(Status::Done),
            "failed" => Ok(Status::Failed),
            other => Err(FarmError::Internal(format!("unknown status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Render,
    Cache,
    Simulation,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Render => "render",
            Purpose::Cache => "cache",
            Purpose::Simulation => "simulation",
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "render" => Ok(Purpose::Render),
            "cache" => Ok(Purpose::Cache),
            "simulation" | "sim" => Ok(Purpose::Simulation),
            other => Err(FarmError::InvalidDescriptor(format!(
                "unknown purpose `{other}`"
            ))),
        }
    }
}

/// What a connected worker is doing, as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Idle,
    Working,
    Stopped,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Idle => "idle",
            ClientStatus::Working => "working",
            ClientStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientStatus {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(ClientStatus::Idle),
            "working" => Ok(ClientStatus::Working),
            "stopped" => Ok(ClientStatus::Stopped),
            other => Err(FarmError::Internal(format!("unknown client status `{other}`"))),
        }
    }
}

pub const DEFAULT_ALLOCATION_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub purpose: Purpose,
    /// Name of the worker-side handler that runs this job's allocations
    #[serde(rename = "type")]
    pub kind: String,
    /// Encoded frame-range spec
    pub range: String,
    pub environment: Map<String, Value>,
    pub parameters: Map<String, Value>,
    pub allocation_size: usize,
    pub dependencies: Vec<i64>,
    pub status: Status,
    pub metadata: Map<String, Value>,
    pub allocation_ids: Vec<i64>,
}

impl Job {
    pub fn new(id: i64, name: impl Into<String>, kind: impl Into<String>, range: &FrameRange) -> Self {
        let mut metadata = Map::new();
        metadata.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        metadata.insert("contributors".into(), Value::Array(Vec::new()));
        Self {
            id,
            name: name.into(),
            purpose: Purpose::Render,
            kind: kind.into(),
            range: range.to_string(),
            environment: Map::new(),
            parameters: Map::new(),
            allocation_size: DEFAULT_ALLOCATION_SIZE,
            dependencies: Vec::new(),
            status: Status::Pending,
            metadata,
            allocation_ids: Vec::new(),
        }
    }

    pub fn with_purpose(mut self, purpose: Purpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn with_allocation_size(mut self, size: usize) -> Self {
        self.allocation_size = size;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Derive a stable job id from who submitted what, and when.
    ///
    /// Takes the first 63 bits of a SHA-256 digest so the id is a positive
    /// SQLite integer.
    pub fn derive_id(submitter: &str, name: &str, timestamp: DateTime<Utc>) -> i64 {
        let mut hasher = Sha256::new();
        hasher.update(submitter.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(timestamp.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(bytes) >> 1) as i64
    }

    pub fn frame_range(&self) -> Result<FrameRange> {
        FrameRange::parse(&self.range)
    }

    pub fn has_failures(&self) -> bool {
        self.metadata
            .get("has_failures")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Record a failed allocation on the job without failing the job.
    pub fn annotate_failure(&mut self, allocation_id: i64, reason: &str) {
        self.metadata
            .insert("has_failures".into(), Value::Bool(true));
        let entry = serde_json::json!({ "allocation": allocation_id, "reason": reason });
        match self.metadata.get_mut("failures") {
            Some(Value::Array(list)) => list.push(entry),
            _ => {
                self.metadata
                    .insert("failures".into(), Value::Array(vec![entry]));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: i64,
    pub job_id: i64,
    pub task_ids: Vec<i64>,
    pub computer: Option<String>,
    pub status: Status,
    /// Failure annotation
    pub info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub job_id: i64,
    pub allocation_id: i64,
    pub frame: i64,
    pub status: Status,
    pub computer: Option<String>,
}
