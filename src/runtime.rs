//! The file runtime: composes the path parser, handler resolver, worker
//! pool, and static responder, and produces the route/worker snapshots
//! the meta API reads.
//!
//! Ownership is strictly one-way: the runtime owns the bindings, each
//! binding owns its supervisor, and snapshots are value copies.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::http::Method;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::binding::{self, BindingSet};
use crate::config::FluxionConfig;
use crate::error::{ConfigError, WorkerError};
use crate::protocol::{
    ErrorPayload, ExecutePayload, HandlerMeta, HeaderValues, InspectPayload, ResponsePayload,
};
use crate::request_path;
use crate::resolver::{self, ResolvedHandler, HANDLER_SUFFIX, INDEX_FILE};
use crate::static_files::{self, StaticFileReply};
use crate::supervisor::WorkerSnapshot;
use crate::version::version_of;

/// One request, as the HTTP boundary hands it over. The body has already
/// been buffered (bodies are single-consumer).
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    /// Path component only, still percent-encoded.
    pub path: String,
    /// Path plus query, the `url` handlers observe.
    pub url: String,
    pub headers: Vec<(String, HeaderValues)>,
    pub body: Bytes,
    pub ip: String,
}

/// What the runtime produced for a request.
pub enum ServeOutcome {
    Handler(ResponsePayload),
    Static(StaticFileReply),
    /// No handler, no static file. The boundary emits the 404.
    NotFound,
}

/// Failures the boundary must translate into 5xx responses.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Module import / default-export failure. Clients get a generic 500;
    /// the detail is logged. A new file version retries naturally.
    #[error("handler load failed: {0}")]
    Load(ErrorPayload),

    /// The handler itself failed.
    #[error("handler failed: {0}")]
    Handler(ErrorPayload),

    /// Capacity or lifecycle failure from the supervisor.
    #[error(transparent)]
    Worker(WorkerError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<WorkerError> for RuntimeError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Handler(payload) if payload.name == "HandlerLoadError" => {
                Self::Load(payload)
            }
            WorkerError::Handler(payload) => Self::Handler(payload),
            other => Self::Worker(other),
        }
    }
}

pub struct FileRuntime {
    root: PathBuf,
    declared_dbs: BTreeSet<String>,
    bindings: BindingSet,
    /// `(path, version) → meta`, mirroring worker-side metadata so worker
    /// selection is O(1) after the first execution or inspection.
    meta_cache: Mutex<HashMap<(PathBuf, String), HandlerMeta>>,
    /// Last version dispatched per path, for load/reload logging only.
    seen_versions: Mutex<HashMap<PathBuf, String>>,
}

impl FileRuntime {
    pub async fn new(config: &FluxionConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let root = tokio::fs::canonicalize(&config.dir)
            .await
            .map_err(|source| ConfigError::Dir {
                path: config.dir.clone(),
                source,
            })?;
        let declared_dbs = config.declared_databases();
        let bindings = binding::build(config, &root, &declared_dbs)?;
        info!(
            root = %root.display(),
            workers = bindings.bindings().len(),
            "file runtime ready"
        );
        Ok(Arc::new(Self {
            root,
            declared_dbs,
            bindings,
            meta_cache: Mutex::new(HashMap::new()),
            seen_versions: Mutex::new(HashMap::new()),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve one request: handler dispatch first, static fallback second.
    pub async fn serve(&self, request: IncomingRequest) -> Result<ServeOutcome, RuntimeError> {
        let Some(parsed) = request_path::parse(&request.path) else {
            return Ok(ServeOutcome::NotFound);
        };

        if let Some(resolved) = resolver::resolve_handler(&self.root, &parsed).await? {
            let response = self.dispatch(&resolved, &request).await?;
            return Ok(ServeOutcome::Handler(response));
        }

        if let Some(reply) =
            static_files::serve_static(&self.root, &parsed, &request.method).await?
        {
            return Ok(ServeOutcome::Static(reply));
        }

        Ok(ServeOutcome::NotFound)
    }

    async fn dispatch(
        &self,
        resolved: &ResolvedHandler,
        request: &IncomingRequest,
    ) -> Result<ResponsePayload, RuntimeError> {
        self.log_version_transition(resolved);

        let meta = match self.cached_meta(resolved) {
            Some(meta) => meta,
            None => self.inspect_and_cache(resolved).await?,
        };
        let required: BTreeSet<String> = meta.db.iter().cloned().collect();
        let binding = self.bindings.select(&required);

        let payload = ExecutePayload {
            file_path: resolved.file_path.clone(),
            version: resolved.version.clone(),
            method: request.method.to_string(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: (!request.body.is_empty()).then(|| request.body.clone()),
            ip: request.ip.clone(),
        };

        let result = binding.supervisor.execute(payload).await.map_err(|err| {
            let err = RuntimeError::from(err);
            if let RuntimeError::Load(payload) = &err {
                error!(
                    file = %resolved.file_path.display(),
                    detail = %payload,
                    "handler load failed"
                );
            }
            err
        })?;

        if let Some(meta) = &result.meta {
            self.cache_meta(resolved, meta.clone());
        }
        Ok(result.response.unwrap_or(ResponsePayload {
            status: 200,
            headers: Vec::new(),
            body: None,
        }))
    }

    fn cached_meta(&self, resolved: &ResolvedHandler) -> Option<HandlerMeta> {
        self.meta_cache
            .lock()
            .expect("meta cache lock")
            .get(&(resolved.file_path.clone(), resolved.version.clone()))
            .cloned()
    }

    fn cache_meta(&self, resolved: &ResolvedHandler, meta: HandlerMeta) {
        self.meta_cache
            .lock()
            .expect("meta cache lock")
            .insert((resolved.file_path.clone(), resolved.version.clone()), meta);
    }

    /// First sight of `(path, version)`: ask the inspect worker (the
    /// all-db binding) for metadata and cache it.
    async fn inspect_and_cache(
        &self,
        resolved: &ResolvedHandler,
    ) -> Result<HandlerMeta, RuntimeError> {
        let binding = self.bindings.inspect_binding();
        let meta = binding
            .supervisor
            .inspect(InspectPayload {
                file_path: resolved.file_path.clone(),
                version: resolved.version.clone(),
            })
            .await
            .map_err(|err| {
                let err = RuntimeError::from(err);
                if let RuntimeError::Load(payload) = &err {
                    error!(
                        file = %resolved.file_path.display(),
                        detail = %payload,
                        "handler load failed during inspection"
                    );
                }
                err
            })?;
        self.cache_meta(resolved, meta.clone());
        Ok(meta)
    }

    fn log_version_transition(&self, resolved: &ResolvedHandler) {
        let mut seen = self.seen_versions.lock().expect("version log lock");
        match seen.get(&resolved.file_path) {
            Some(previous) if *previous == resolved.version => {}
            Some(previous) => {
                info!(
                    file = %resolved.file_path.display(),
                    from = %previous,
                    to = %resolved.version,
                    "reloading handler"
                );
                seen.insert(resolved.file_path.clone(), resolved.version.clone());
            }
            None => {
                info!(
                    file = %resolved.file_path.display(),
                    version = %resolved.version,
                    "loading handler"
                );
                seen.insert(resolved.file_path.clone(), resolved.version.clone());
            }
        }
    }

    /// Point-in-time view of every routable file, grouped and sorted by
    /// route. Stable across calls while the directory is quiescent.
    pub async fn route_snapshot(&self) -> io::Result<RouteSnapshot> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_routes(&root))
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }

    /// Per-binding view of status, inflight, restart statistics, limits,
    /// and the latest memory sample.
    pub fn worker_snapshot(&self) -> Vec<WorkerSnapshot> {
        self.bindings
            .bindings()
            .iter()
            .map(|b| b.supervisor.snapshot())
            .collect()
    }

    pub fn declared_databases(&self) -> &BTreeSet<String> {
        &self.declared_dbs
    }

    /// Close every supervisor. Idempotent.
    pub fn close(&self) {
        self.bindings.close_all();
        warn!("file runtime closed");
    }
}

// ===== route snapshot ========================================================

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRouteEntry {
    pub route: String,
    pub file_path: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticRouteEntry {
    pub route: String,
    pub file_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteSnapshot {
    pub handlers: Vec<HandlerRouteEntry>,
    pub static_files: Vec<StaticRouteEntry>,
}

fn walk_routes(root: &Path) -> io::Result<RouteSnapshot> {
    // (route → (priority, entry)); index.mjs is priority 0 and wins
    // against a sibling `<dir>.mjs`.
    let mut handlers: HashMap<String, (u8, HandlerRouteEntry)> = HashMap::new();
    let mut static_files = Vec::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !(entry.file_type().is_dir() && file_name_hidden(entry.file_name()))
    });

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() || file_name_hidden(entry.file_name()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walked entries live under the root");
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let meta = entry.metadata().map_err(io::Error::from)?;

        if rel.extension().and_then(|e| e.to_str()) == Some(HANDLER_SUFFIX) {
            let (route, priority) = handler_route(&rel_str);
            let candidate = HandlerRouteEntry {
                route: route.clone(),
                file_path: rel_str,
                version: version_of(&meta),
            };
            match handlers.get(&route) {
                Some((existing, _)) if *existing <= priority => {}
                _ => {
                    handlers.insert(route, (priority, candidate));
                }
            }
        } else {
            static_files.push(StaticRouteEntry {
                route: format!("/{rel_str}"),
                file_path: rel_str,
                size: meta.len(),
            });
        }
    }

    let mut handlers: Vec<HandlerRouteEntry> =
        handlers.into_values().map(|(_, entry)| entry).collect();
    handlers.sort_by(|a, b| a.route.cmp(&b.route));
    static_files.sort_by(|a, b| a.route.cmp(&b.route));

    Ok(RouteSnapshot {
        handlers,
        static_files,
    })
}

fn file_name_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('_')
}

/// Route projection of a handler file's relative path, with priority 0
/// for `index.mjs` and 1 for named modules.
fn handler_route(rel: &str) -> (String, u8) {
    if rel == INDEX_FILE {
        return ("/".to_string(), 0);
    }
    if let Some(dir) = rel.strip_suffix(&format!("/{INDEX_FILE}")) {
        return (format!("/{dir}"), 0);
    }
    let stem = rel
        .strip_suffix(&format!(".{HANDLER_SUFFIX}"))
        .unwrap_or(rel);
    (format!("/{stem}"), 1)
}
