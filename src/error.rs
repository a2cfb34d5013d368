use thiserror::Error;

use crate::net::handshake::Rejection;
use crate::protocol::DecodeError;

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Allocation not found: {0}")]
    AllocationNotFound(i64),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Invalid frame range: {0}")]
    InvalidRange(String),

    #[error("Invalid job descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Coordinator lock is held by {0}")]
    LockBusy(String),

    #[error("Coordinator lock lost by {0}")]
    LockLost(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(Rejection),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Bad arguments for {function}: {reason}")]
    BadArguments { function: String, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Supervised operation {operation} failed: {reason}")]
    Supervisor { operation: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FarmError {
    /// Stable short name of the variant, used by supervisor suppress-lists.
    pub fn kind(&self) -> &'static str {
        match self {
            FarmError::JobNotFound(_) => "job_not_found",
            FarmError::AllocationNotFound(_) => "allocation_not_found",
            FarmError::TaskNotFound(_) => "task_not_found",
            FarmError::InvalidRange(_) => "invalid_range",
            FarmError::InvalidDescriptor(_) => "invalid_descriptor",
            FarmError::InvalidTransition(_) => "invalid_transition",
            FarmError::LockBusy(_) => "lock_busy",
            FarmError::LockLost(_) => "lock_lost",
            FarmError::HandshakeRejected(_) => "handshake_rejected",
            FarmError::UnknownFunction(_) => "unknown_function",
            FarmError::BadArguments { .. } => "bad_arguments",
            FarmError::Connection(_) => "connection",
            FarmError::Timeout(_) => "timeout",
            FarmError::Cancelled => "cancelled",
            FarmError::Supervisor { .. } => "supervisor",
            FarmError::Decode(_) => "decode",
            FarmError::Database(_) => "database",
            FarmError::Serialization(_) => "serialization",
            FarmError::Io(_) => "io",
            FarmError::WebSocket(_) => "websocket",
            FarmError::Internal(_) => "internal",
        }
    }

    pub fn bad_arguments(function: &str, reason: impl Into<String>) -> Self {
        FarmError::BadArguments {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FarmError>;
