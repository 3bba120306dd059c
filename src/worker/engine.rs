//! The in-worker execution engine: a QuickJS runtime with a
//! version-keyed module cache, a synthetic request/response surface for
//! handlers, and byte-capped response accumulation.
//!
//! The cache never reloads in place. A version change is reported as
//! `WORKER_VERSION_MISMATCH` and the supervisor rotates the whole isolate;
//! dynamic module systems retain stale closures, so rotation is the only
//! way the previous version's memory is truly freed.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rquickjs::convert::Coerced;
use rquickjs::function::{Func, Opt};
use rquickjs::loader::{FileResolver, ScriptLoader};
use rquickjs::{
    ArrayBuffer, CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Object,
    Persistent, Promise, Runtime, TypedArray, Value,
};

use crate::error::WorkerErrorCode;
use crate::protocol::{
    ErrorPayload, ExecutePayload, ExecuteResult, HandlerMeta, InspectPayload, InspectResult,
    MemorySample, ResponsePayload,
};

const MB: usize = 1024 * 1024;
const LOADED_SLOT: &str = "__fluxionLoaded";
const FAILED_SLOT: &str = "__fluxionFailed";

/// Bootstrap parameters the engine is constructed with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_id: String,
    pub db_set: BTreeSet<String>,
    pub root: PathBuf,
    pub max_heap_size_mb: u64,
    pub stack_size_mb: u64,
    pub max_response_bytes: u64,
}

struct CachedHandler {
    version: String,
    meta: HandlerMeta,
    func: Persistent<Function<'static>>,
}

pub struct HandlerEngine {
    rt: Runtime,
    ctx: Context,
    cache: HashMap<PathBuf, CachedHandler>,
    config: EngineConfig,
}

impl HandlerEngine {
    pub fn new(config: EngineConfig, kill: Arc<AtomicBool>) -> Result<Self, rquickjs::Error> {
        let rt = Runtime::new()?;
        rt.set_memory_limit(config.max_heap_size_mb as usize * MB);
        rt.set_max_stack_size(config.stack_size_mb as usize * MB);
        rt.set_interrupt_handler(Some(Box::new(move || kill.load(Ordering::Relaxed))));

        let resolver = FileResolver::default()
            .with_path(config.root.to_string_lossy().as_ref())
            .with_pattern("{}.mjs");
        let loader = ScriptLoader::default().with_extension("mjs");
        rt.set_loader(resolver, loader);

        let ctx = Context::full(&rt)?;
        Ok(Self {
            rt,
            ctx,
            cache: HashMap::new(),
            config,
        })
    }

    /// Run one handler to completion and serialize the outcome.
    pub fn execute(&mut self, id: u64, payload: ExecutePayload) -> ExecuteResult {
        let started = Instant::now();
        let meta = match self.load(&payload.file_path, &payload.version) {
            Ok(meta) => meta,
            Err(error) => {
                return ExecuteResult {
                    id,
                    ok: false,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    heap_used: self.heap_used(),
                    meta: None,
                    response: None,
                    error: Some(error),
                }
            }
        };

        match self.run_handler(&payload) {
            Ok(response) => ExecuteResult {
                id,
                ok: true,
                elapsed_ms: started.elapsed().as_millis() as u64,
                heap_used: self.heap_used(),
                meta: Some(meta),
                response: Some(response),
                error: None,
            },
            Err(error) => ExecuteResult {
                id,
                ok: false,
                elapsed_ms: started.elapsed().as_millis() as u64,
                heap_used: self.heap_used(),
                meta: Some(meta),
                response: None,
                error: Some(error),
            },
        }
    }

    /// Load a handler and report its metadata without executing it.
    pub fn inspect(&mut self, id: u64, payload: InspectPayload) -> InspectResult {
        match self.load(&payload.file_path, &payload.version) {
            Ok(meta) => InspectResult {
                id,
                ok: true,
                meta: Some(meta),
                error: None,
            },
            Err(error) => InspectResult {
                id,
                ok: false,
                meta: None,
                error: Some(error),
            },
        }
    }

    pub fn memory_sample(&self) -> MemorySample {
        let usage = self.rt.memory_usage();
        MemorySample {
            heap_used: usage.memory_used_size.max(0) as u64,
            rss: usage.malloc_size.max(0) as u64,
            external: usage.str_size.max(0) as u64,
            array_buffers: usage.binary_object_size.max(0) as u64,
        }
    }

    fn heap_used(&self) -> u64 {
        self.rt.memory_usage().memory_used_size.max(0) as u64
    }

    /// Cache lookup / first import of a handler module.
    fn load(&mut self, file_path: &Path, version: &str) -> Result<HandlerMeta, ErrorPayload> {
        if let Some(cached) = self.cache.get(file_path) {
            if cached.version == version {
                return Ok(cached.meta.clone());
            }
            return Err(ErrorPayload::coded(
                WorkerErrorCode::VersionMismatch,
                format!(
                    "handler {} is loaded at version {}, requested {}",
                    file_path.display(),
                    cached.version,
                    version
                ),
            ));
        }

        let cached = self.import_module(file_path)?;
        let meta = cached.meta.clone();
        self.cache.insert(
            file_path.to_path_buf(),
            CachedHandler {
                version: version.to_string(),
                ..cached
            },
        );
        Ok(meta)
    }

    /// Import the module via dynamic `import()` (which goes through the
    /// engine's file loader), then pull the default export apart.
    fn import_module(&self, file_path: &Path) -> Result<CachedHandler, ErrorPayload> {
        let specifier = serde_json::to_string(&file_path.to_string_lossy())
            .unwrap_or_else(|_| format!("{:?}", file_path));
        let script = format!(
            "import({specifier}).then(\
             (m) => {{ globalThis.{LOADED_SLOT} = m; }},\
             (e) => {{ globalThis.{FAILED_SLOT} = e; }});"
        );

        self.ctx
            .with(|ctx| -> Result<(), ErrorPayload> {
                let globals = ctx.globals();
                let _ = globals.remove(LOADED_SLOT);
                let _ = globals.remove(FAILED_SLOT);
                ctx.eval::<(), _>(script.as_bytes())
                    .catch(&ctx)
                    .map_err(|err| ErrorPayload {
                        name: "HandlerLoadError".to_string(),
                        ..caught_to_payload(&ctx, err)
                    })
            })?;

        self.drain_jobs();

        self.ctx.with(|ctx| -> Result<CachedHandler, ErrorPayload> {
            let globals = ctx.globals();
            let failed: Value = globals
                .get(FAILED_SLOT)
                .map_err(|err| internal_load_error(&err))?;
            if !failed.is_undefined() {
                let payload = thrown_to_payload(&ctx, &failed);
                let _ = globals.remove(FAILED_SLOT);
                return Err(payload);
            }

            let namespace: Object = globals
                .get(LOADED_SLOT)
                .map_err(|_| load_error("module namespace unavailable after import"))?;
            let _ = globals.remove(LOADED_SLOT);

            let default: Value = namespace
                .get("default")
                .map_err(|_| load_error("module has no default export"))?;
            self.parse_default_export(&ctx, default)
        })
    }

    fn parse_default_export<'js>(
        &self,
        ctx: &Ctx<'js>,
        default: Value<'js>,
    ) -> Result<CachedHandler, ErrorPayload> {
        let (func, db): (Function, Vec<String>) = if let Some(func) = default.as_function() {
            (func.clone(), Vec::new())
        } else if let Some(obj) = default.as_object() {
            let handler: Value = obj
                .get("handler")
                .map_err(|_| bad_default_export())?;
            let Some(func) = handler.as_function() else {
                return Err(bad_default_export());
            };
            let db_value: Value = obj.get("db").map_err(|_| bad_default_export())?;
            (func.clone(), parse_db_declaration(&db_value)?)
        } else {
            return Err(bad_default_export());
        };

        let meta = HandlerMeta::new(db);
        for name in &meta.db {
            if !self.config.db_set.contains(name) {
                return Err(ErrorPayload::coded(
                    WorkerErrorCode::DbNotAvailable,
                    format!(
                        "handler requires database `{}` but worker `{}` holds [{}]",
                        name,
                        self.config.worker_id,
                        self.config.db_set.iter().cloned().collect::<Vec<_>>().join(", ")
                    ),
                ));
            }
        }

        Ok(CachedHandler {
            version: String::new(),
            meta,
            func: Persistent::save(ctx, func),
        })
    }

    fn run_handler(&self, payload: &ExecutePayload) -> Result<ResponsePayload, ErrorPayload> {
        let cached = self
            .cache
            .get(&payload.file_path)
            .ok_or_else(|| load_error("handler vanished from the module cache"))?;
        let sink = Rc::new(RefCell::new(ResponseSink::new(
            self.config.max_response_bytes,
        )));

        // Stage 1: call the handler, persisting whatever it returned.
        let returned: Persistent<Value<'static>> =
            self.ctx.with(|ctx| -> Result<_, ErrorPayload> {
                let func = cached
                    .func
                    .clone()
                    .restore(&ctx)
                    .map_err(|err| internal_load_error(&err))?;
                let req = build_request_object(&ctx, payload)
                    .map_err(|err| internal_load_error(&err))?;
                let res = build_response_object(&ctx, sink.clone())
                    .map_err(|err| internal_load_error(&err))?;
                let hctx = build_handler_context(&ctx, &self.config)
                    .map_err(|err| internal_load_error(&err))?;

                let value: Value = func
                    .call((req, res, hctx))
                    .catch(&ctx)
                    .map_err(|err| caught_to_payload(&ctx, err))?;
                Ok(Persistent::save(&ctx, value))
            })?;

        // Stage 2: drain microtasks so a returned promise can settle.
        self.drain_jobs();

        // Stage 3: settle the return value and finalize the sink.
        let returned_body = self.ctx.with(|ctx| -> Result<ReturnedBody, ErrorPayload> {
            let value = returned
                .restore(&ctx)
                .map_err(|err| internal_load_error(&err))?;
            let settled = match value.clone().get::<Promise>() {
                Ok(promise) => promise
                    .finish::<Value>()
                    .catch(&ctx)
                    .map_err(|err| caught_to_payload(&ctx, err))?,
                Err(_) => value,
            };
            serialize_return(&ctx, settled)
        })?;

        let sink = sink.borrow();
        if sink.overflowed {
            return Err(ErrorPayload::coded(
                WorkerErrorCode::ResponseTooLarge,
                format!(
                    "worker response too large (limit {} bytes)",
                    self.config.max_response_bytes
                ),
            ));
        }
        Ok(sink.finalize(returned_body))
    }

    fn drain_jobs(&self) {
        loop {
            match self.rt.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                // The failing job was already popped; its error surfaces
                // on the owning promise.
                Err(_) => continue,
            }
        }
    }
}

// ===== synthetic request / response ==========================================

enum ReturnedBody {
    None,
    Text(String),
    Json(String),
}

struct ResponseSink {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    wrote_body: bool,
    limit: u64,
    overflowed: bool,
}

impl ResponseSink {
    fn new(limit: u64) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            wrote_body: false,
            limit,
            overflowed: false,
        }
    }

    fn set_header(&mut self, name: String, value: String) {
        let lowered = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| n.to_ascii_lowercase() != lowered);
        self.headers.push((name, value));
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    fn write(&mut self, chunk: &[u8]) -> bool {
        if self.body.len() as u64 + chunk.len() as u64 > self.limit {
            self.overflowed = true;
            return false;
        }
        self.wrote_body = true;
        self.body.extend_from_slice(chunk);
        true
    }

    /// Merge the handler's return value in: the sink wins whenever it was
    /// written to, a returned string becomes a text body, anything else
    /// becomes JSON.
    fn finalize(&self, returned: ReturnedBody) -> ResponsePayload {
        let mut headers = self.headers.clone();
        let body: Vec<u8> = if self.wrote_body {
            self.body.clone()
        } else {
            match returned {
                ReturnedBody::None => Vec::new(),
                ReturnedBody::Text(text) => {
                    if !self.has_header("content-type") {
                        headers.push((
                            "content-type".to_string(),
                            "text/plain; charset=utf-8".to_string(),
                        ));
                    }
                    text.into_bytes()
                }
                ReturnedBody::Json(json) => {
                    if !self.has_header("content-type") {
                        headers.push((
                            "content-type".to_string(),
                            "application/json".to_string(),
                        ));
                    }
                    json.into_bytes()
                }
            }
        };
        ResponsePayload {
            status: self.status,
            headers,
            body: (!body.is_empty()).then(|| body.into()),
        }
    }
}

fn build_request_object<'js>(
    ctx: &Ctx<'js>,
    payload: &ExecutePayload,
) -> rquickjs::Result<Object<'js>> {
    let req = Object::new(ctx.clone())?;
    req.set("method", payload.method.as_str())?;
    req.set("url", payload.url.as_str())?;
    req.set("ip", payload.ip.as_str())?;

    let headers = Object::new(ctx.clone())?;
    for (name, values) in &payload.headers {
        match values {
            crate::protocol::HeaderValues::Single(v) => headers.set(name.as_str(), v.as_str())?,
            crate::protocol::HeaderValues::Multi(vs) => {
                headers.set(name.as_str(), vs.clone())?
            }
        }
    }
    req.set("headers", headers)?;

    match &payload.body {
        Some(body) => {
            req.set("body", ArrayBuffer::new(ctx.clone(), body.to_vec())?)?;
            req.set(
                "bodyText",
                String::from_utf8_lossy(body).into_owned(),
            )?;
        }
        None => {
            req.set("body", Value::new_null(ctx.clone()))?;
            req.set("bodyText", Value::new_null(ctx.clone()))?;
        }
    }
    Ok(req)
}

fn build_response_object<'js>(
    ctx: &Ctx<'js>,
    sink: Rc<RefCell<ResponseSink>>,
) -> rquickjs::Result<Object<'js>> {
    let res = Object::new(ctx.clone())?;

    let s = sink.clone();
    res.set(
        "status",
        Func::from(move |code: i32| {
            s.borrow_mut().status = u16::try_from(code).unwrap_or(500);
        }),
    )?;

    let s = sink.clone();
    res.set(
        "setHeader",
        Func::from(move |name: Coerced<String>, value: Coerced<String>| {
            s.borrow_mut().set_header(name.0, value.0);
        }),
    )?;

    let s = sink.clone();
    res.set(
        "write",
        Func::from(move |ctx: Ctx<'_>, chunk: Value<'_>| -> rquickjs::Result<()> {
            sink_write(&ctx, &s, chunk)
        }),
    )?;

    let s = sink.clone();
    res.set(
        "end",
        Func::from(
            move |ctx: Ctx<'_>, chunk: Opt<Value<'_>>| -> rquickjs::Result<()> {
                if let Some(chunk) = chunk.0 {
                    sink_write(&ctx, &s, chunk)?;
                }
                // Mark the sink authoritative even for empty bodies.
                s.borrow_mut().wrote_body = true;
                Ok(())
            },
        ),
    )?;

    let s = sink;
    res.set("json", Func::from(make_json_sink(s)))?;

    Ok(res)
}

fn make_json_sink<'js>(
    sink: Rc<RefCell<ResponseSink>>,
) -> impl Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<()> + 'js {
    move |ctx: Ctx<'js>, value: Value<'js>| -> rquickjs::Result<()> {
        let json = ctx
            .json_stringify(value)?
            .map(|s| s.to_string())
            .transpose()?
            .unwrap_or_else(|| "null".to_string());
        {
            let mut sink = sink.borrow_mut();
            if !sink.has_header("content-type") {
                sink.set_header("content-type".to_string(), "application/json".to_string());
            }
        }
        sink_write_bytes(&ctx, &sink, json.as_bytes())
    }
}

fn sink_write(
    ctx: &Ctx<'_>,
    sink: &Rc<RefCell<ResponseSink>>,
    chunk: Value<'_>,
) -> rquickjs::Result<()> {
    if let Ok(buffer) = chunk.clone().get::<ArrayBuffer>() {
        let bytes = buffer.as_bytes().map(<[u8]>::to_vec).unwrap_or_default();
        return sink_write_bytes(ctx, sink, &bytes);
    }
    if let Ok(array) = chunk.clone().get::<TypedArray<u8>>() {
        let bytes = array.as_bytes().map(<[u8]>::to_vec).unwrap_or_default();
        return sink_write_bytes(ctx, sink, &bytes);
    }
    let text: Coerced<String> = chunk.get()?;
    sink_write_bytes(ctx, sink, text.0.as_bytes())
}

fn sink_write_bytes(
    ctx: &Ctx<'_>,
    sink: &Rc<RefCell<ResponseSink>>,
    bytes: &[u8],
) -> rquickjs::Result<()> {
    let (ok, limit) = {
        let mut sink = sink.borrow_mut();
        (sink.write(bytes), sink.limit)
    };
    if ok {
        Ok(())
    } else {
        Err(Exception::throw_message(
            ctx,
            &format!("worker response too large (limit {limit} bytes)"),
        ))
    }
}

fn build_handler_context<'js>(
    ctx: &Ctx<'js>,
    config: &EngineConfig,
) -> rquickjs::Result<Object<'js>> {
    let hctx = Object::new(ctx.clone())?;

    // One slot per database the worker holds; adapters are wired by the
    // embedder, so the slots start empty.
    let db = Object::new(ctx.clone())?;
    for name in &config.db_set {
        db.set(name.as_str(), Value::new_null(ctx.clone()))?;
    }
    hctx.set("db", db)?;

    let db_set = config.db_set.clone();
    hctx.set(
        "hasDb",
        Func::from(move |name: String| db_set.contains(&name)),
    )?;

    let worker = Object::new(ctx.clone())?;
    worker.set("id", config.worker_id.as_str())?;
    worker.set(
        "dbSet",
        config.db_set.iter().cloned().collect::<Vec<String>>(),
    )?;
    hctx.set("worker", worker)?;

    Ok(hctx)
}

fn serialize_return<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> Result<ReturnedBody, ErrorPayload> {
    if value.is_undefined() || value.is_null() {
        return Ok(ReturnedBody::None);
    }
    if let Some(text) = value.as_string() {
        return Ok(ReturnedBody::Text(
            text.to_string().map_err(|err| internal_load_error(&err))?,
        ));
    }
    let json = ctx
        .json_stringify(value)
        .ok()
        .flatten()
        .map(|s| s.to_string())
        .transpose()
        .map_err(|err| internal_load_error(&err))?;
    Ok(match json {
        Some(json) => ReturnedBody::Json(json),
        None => ReturnedBody::None,
    })
}

fn parse_db_declaration(value: &Value<'_>) -> Result<Vec<String>, ErrorPayload> {
    if value.is_undefined() || value.is_null() {
        return Ok(Vec::new());
    }
    if let Some(s) = value.as_string() {
        return Ok(vec![s.to_string().map_err(|err| internal_load_error(&err))?]);
    }
    if let Some(array) = value.as_array() {
        let mut out = Vec::with_capacity(array.len());
        for item in array.iter::<String>() {
            out.push(item.map_err(|_| {
                load_error("db declaration must be a string or an array of strings")
            })?);
        }
        return Ok(out);
    }
    Err(load_error(
        "db declaration must be a string or an array of strings",
    ))
}

// ===== error payload helpers =================================================

fn bad_default_export() -> ErrorPayload {
    load_error("default export must be a function or an object { handler, db? }")
}

fn load_error(message: &str) -> ErrorPayload {
    ErrorPayload::uncoded("HandlerLoadError", message)
}

fn internal_load_error(err: &dyn std::fmt::Display) -> ErrorPayload {
    ErrorPayload::uncoded("HandlerLoadError", err.to_string())
}

/// A value the module-load promise rejected with.
fn thrown_to_payload(ctx: &Ctx<'_>, value: &Value<'_>) -> ErrorPayload {
    if let Some(obj) = value.as_object() {
        let name: String = obj
            .get::<_, Option<Coerced<String>>>("name")
            .ok()
            .flatten()
            .map(|c| c.0)
            .unwrap_or_else(|| "Error".to_string());
        let message: String = obj
            .get::<_, Option<Coerced<String>>>("message")
            .ok()
            .flatten()
            .map(|c| c.0)
            .unwrap_or_else(|| "module import failed".to_string());
        let stack = obj
            .get::<_, Option<String>>("stack")
            .ok()
            .flatten();
        return ErrorPayload {
            name: "HandlerLoadError".to_string(),
            message: format!("{name}: {message}"),
            stack,
            code: None,
        };
    }
    let _ = ctx;
    load_error("module import failed")
}

/// A JS exception caught while calling the handler.
fn caught_to_payload(ctx: &Ctx<'_>, err: CaughtError<'_>) -> ErrorPayload {
    match err {
        CaughtError::Exception(exception) => {
            let message = exception
                .message()
                .unwrap_or_else(|| "handler threw".to_string());
            // Response-cap violations thrown by the sink keep their code
            // even when the handler lets them propagate.
            let code = message
                .contains("worker response too large")
                .then_some(WorkerErrorCode::ResponseTooLarge);
            ErrorPayload {
                name: "HandlerError".to_string(),
                message,
                stack: exception.stack(),
                code,
            }
        }
        CaughtError::Value(value) => {
            let rendered = value
                .clone()
                .get::<Coerced<String>>()
                .map(|c| c.0)
                .unwrap_or_else(|_| "handler threw a non-error value".to_string());
            let _ = ctx;
            ErrorPayload::uncoded("HandlerError", rendered)
        }
        CaughtError::Error(err) => ErrorPayload::uncoded("HandlerError", err.to_string()),
    }
}
