//! Error taxonomy: stable protocol codes plus the typed errors each
//! component boundary can produce.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ErrorPayload;

/// Stable codes attached to failures that cross the dispatcher/worker
/// boundary. These are part of the wire contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerErrorCode {
    #[serde(rename = "WORKER_OVERLOADED")]
    Overloaded,
    #[serde(rename = "WORKER_TIMEOUT")]
    Timeout,
    #[serde(rename = "WORKER_VERSION_MISMATCH")]
    VersionMismatch,
    #[serde(rename = "WORKER_DB_NOT_AVAILABLE")]
    DbNotAvailable,
    #[serde(rename = "WORKER_RESPONSE_TOO_LARGE")]
    ResponseTooLarge,
}

impl WorkerErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overloaded => "WORKER_OVERLOADED",
            Self::Timeout => "WORKER_TIMEOUT",
            Self::VersionMismatch => "WORKER_VERSION_MISMATCH",
            Self::DbNotAvailable => "WORKER_DB_NOT_AVAILABLE",
            Self::ResponseTooLarge => "WORKER_RESPONSE_TOO_LARGE",
        }
    }
}

impl std::fmt::Display for WorkerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures the supervisor reports to the dispatcher for a single
/// execute/inspect call.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("runtime worker closed")]
    Closed,

    #[error("worker overloaded: {inflight} requests inflight (limit {limit})")]
    Overloaded { inflight: usize, limit: usize },

    #[error("worker timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("runtime worker restarted: {reason}")]
    Restarted { reason: String },

    /// The handler (or the module load) failed inside the worker. Carries
    /// the serialized error exactly as the worker reported it.
    #[error("{0}")]
    Handler(ErrorPayload),

    #[error("failed to spawn worker `{id}`: {message}")]
    Spawn { id: String, message: String },
}

impl WorkerError {
    /// The protocol code for this failure, if it has one.
    pub fn code(&self) -> Option<WorkerErrorCode> {
        match self {
            Self::Overloaded { .. } => Some(WorkerErrorCode::Overloaded),
            Self::Timeout { .. } => Some(WorkerErrorCode::Timeout),
            Self::Handler(payload) => payload.code,
            _ => None,
        }
    }
}

/// Startup misconfiguration. Always fail-fast: none of these are
/// recoverable at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("maxRequestBytes must be greater than zero")]
    InvalidMaxRequestBytes,

    #[error("dynamic directory {path}: {source}")]
    Dir { path: PathBuf, source: io::Error },

    #[error("worker spec #{index}: id must not be empty")]
    EmptyWorkerId { index: usize },

    #[error("duplicate worker id `{id}`")]
    DuplicateWorkerId { id: String },

    #[error("worker `{id}` references unknown database `{db}`")]
    UnknownDatabase { id: String, db: String },
}

/// Archive installer failures.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("unsupported archive format `{0}` (expected .tar, .tar.gz or .tgz)")]
    UnsupportedFormat(String),

    #[error("archive has no base name")]
    NoBaseName,

    #[error("archive is empty")]
    EmptyArchive,

    #[error("archive entry escapes the module directory: {0}")]
    UnsafeEntry(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
