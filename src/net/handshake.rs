//! Connection handshake.
//!
//! A dialer identifies itself with request headers on the upgrade request.
//! The coordinator checks them and refuses the upgrade with a plain status
//! code when they do not pass.

use std::str::FromStr;

use axum::http::{HeaderMap, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::scheduler::ClientStatus;

pub const PASSKEY: &str = "passkey";
pub const NAME: &str = "name";
pub const ROLE: &str = "role";
pub const STATUS: &str = "status";
pub const JOB: &str = "job";
pub const ALLOCATION: &str = "allocation";
pub const TASK: &str = "task";

/// Passkey a peer called `name` presents for `secret`.
pub fn passkey(secret: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("bad passkey")]
    BadPasskey,

    #[error("name `{0}` is already connected")]
    DuplicateName(String),

    #[error("malformed handshake: {0}")]
    Malformed(String),
}

impl Rejection {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Rejection::BadPasskey => StatusCode::FORBIDDEN,
            Rejection::DuplicateName(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Rejection::Malformed(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Map a refused upgrade back to the reason, as seen by the dialer.
    pub fn from_status(status: u16, name: &str) -> Option<Self> {
        match status {
            403 => Some(Rejection::BadPasskey),
            500 => Some(Rejection::DuplicateName(name.to_string())),
            400 => Some(Rejection::Malformed(format!("refused with status {status}"))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    Client,
    Console,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Client => "client",
            PeerKind::Console => "console",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is on the other end of a connection, and for a worker, what it was
/// doing when it last connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub kind: PeerKind,
    pub passkey: String,
    pub status: Option<ClientStatus>,
    pub job: Option<i64>,
    pub allocation: Option<i64>,
    pub task: Option<i64>,
}

impl Identity {
    pub fn client(name: impl Into<String>, secret: &str) -> Self {
        Self::new(name.into(), PeerKind::Client, secret)
    }

    pub fn console(name: impl Into<String>, secret: &str) -> Self {
        Self::new(name.into(), PeerKind::Console, secret)
    }

    fn new(name: String, kind: PeerKind, secret: &str) -> Self {
        Self {
            passkey: passkey(secret, &name),
            name,
            kind,
            status: (kind == PeerKind::Client).then_some(ClientStatus::Idle),
            job: None,
            allocation: None,
            task: None,
        }
    }

    /// Worker state to restore on the coordinator after a reconnect.
    pub fn with_state(
        mut self,
        status: ClientStatus,
        job: Option<i64>,
        allocation: Option<i64>,
        task: Option<i64>,
    ) -> Self {
        self.status = Some(status);
        self.job = job;
        self.allocation = allocation;
        self.task = task;
        self
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, Rejection> {
        let name = header(headers, NAME)?
            .ok_or_else(|| Rejection::Malformed("missing name".into()))?
            .to_string();
        if name.is_empty() {
            return Err(Rejection::Malformed("empty name".into()));
        }
        let passkey = header(headers, PASSKEY)?
            .ok_or(Rejection::BadPasskey)?
            .to_string();

        let status = parsed::<ClientStatus>(headers, STATUS)?;
        let kind = match header(headers, ROLE)? {
            Some("client") => PeerKind::Client,
            Some("console") => PeerKind::Console,
            Some(other) => return Err(Rejection::Malformed(format!("unknown role `{other}`"))),
            None if status.is_some() => PeerKind::Client,
            None => PeerKind::Console,
        };

        Ok(Self {
            name,
            kind,
            passkey,
            status,
            job: parsed(headers, JOB)?,
            allocation: parsed(headers, ALLOCATION)?,
            task: parsed(headers, TASK)?,
        })
    }

    pub fn verify(&self, secret: &str) -> Result<(), Rejection> {
        if self.passkey == passkey(secret, &self.name) {
            Ok(())
        } else {
            Err(Rejection::BadPasskey)
        }
    }

    /// Header pairs a dialer sends for this identity.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (NAME, self.name.clone()),
            (PASSKEY, self.passkey.clone()),
            (ROLE, self.kind.as_str().to_string()),
        ];
        if let Some(status) = self.status {
            headers.push((STATUS, status.as_str().to_string()));
        }
        for (key, value) in [(JOB, self.job), (ALLOCATION, self.allocation), (TASK, self.task)] {
            if let Some(value) = value {
                headers.push((key, value.to_string()));
            }
        }
        headers
    }
}

fn header<'a>(headers: &'a HeaderMap, key: &str) -> Result<Option<&'a str>, Rejection> {
    headers
        .get(key)
        .map(|v| {
            v.to_str()
                .map_err(|_| Rejection::Malformed(format!("header `{key}` is not text")))
        })
        .transpose()
}

fn parsed<T: FromStr>(headers: &HeaderMap, key: &str) -> Result<Option<T>, Rejection> {
    header(headers, key)?
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| Rejection::Malformed(format!("header `{key}` has bad value `{raw}`")))
        })
        .transpose()
}
