//! The execution protocol: typed, correlation-id-carrying messages
//! exchanged between the dispatcher and a worker. Every cross-boundary
//! failure travels as a serialized payload with a stable `code`, never as
//! a panic or an unwound error.

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WorkerErrorCode;

/// Correlates a dispatched request with its eventual result. Allocated by
/// the supervisor, unique per worker lifetime.
pub type CorrelationId = u64;

/// A header value as handlers see it: single-valued or repeated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValues {
    /// Flattened view, mostly for tests and logging.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::Single(v) => std::slice::from_ref(v),
            Self::Multi(vs) => vs,
        };
        slice.iter().map(String::as_str)
    }
}

/// Dispatcher → worker: run a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub file_path: PathBuf,
    pub version: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, HeaderValues)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
    pub ip: String,
}

/// Dispatcher → worker: load a handler and report its metadata without
/// executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectPayload {
    pub file_path: PathBuf,
    pub version: String,
}

/// Metadata a handler declares about itself. `db` is sorted and unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerMeta {
    pub db: Vec<String>,
}

impl HandlerMeta {
    pub fn new(mut db: Vec<String>) -> Self {
        db.sort();
        db.dedup();
        Self { db }
    }
}

/// The response a handler produced, captured by the in-worker sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
}

/// A failure serialized across the worker boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<WorkerErrorCode>,
}

impl ErrorPayload {
    pub fn coded(code: WorkerErrorCode, message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
            code: Some(code),
        }
    }

    pub fn uncoded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

/// Worker → dispatcher: outcome of one Execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub id: CorrelationId,
    pub ok: bool,
    pub elapsed_ms: u64,
    pub heap_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<HandlerMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponsePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Worker → dispatcher: outcome of one Inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResult {
    pub id: CorrelationId,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<HandlerMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Worker → dispatcher, unsolicited and periodic. Never sampled on the
/// critical path of a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub heap_used: u64,
    pub rss: u64,
    pub external: u64,
    pub array_buffers: u64,
}

/// Dispatcher → worker message union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    Execute {
        id: CorrelationId,
        #[serde(flatten)]
        payload: ExecutePayload,
    },
    Inspect {
        id: CorrelationId,
        #[serde(flatten)]
        payload: InspectPayload,
    },
}

/// Worker → dispatcher message union. Memory samples interleave freely
/// with results, so routing is by variant before correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Result(ExecuteResult),
    InspectResult(InspectResult),
    MemorySample(MemorySample),
}
