//! Worker supervisor: owns exactly one live engine at a time plus the
//! inflight map, and enforces every runtime cap — admission, timeout,
//! memory limits, restart-on-version-change.
//!
//! All maps live behind one short-lived mutex; nothing is held across an
//! await. Restarts are serialized through an async gate so concurrent
//! triggers collapse into a single rotation.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, info, warn};

use crate::config::ExecutorLimits;
use crate::error::{WorkerError, WorkerErrorCode};
use crate::protocol::{
    CorrelationId, ExecutePayload, ExecuteResult, HandlerMeta, InspectPayload, InspectResult,
    MemorySample, WorkerMessage, WorkerRequest,
};
use crate::worker::{spawn_engine, EngineEvent, EngineHandle, WorkerBootstrap};

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Running,
    Restarting,
    Closed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Closed => "closed",
        }
    }
}

enum Pending {
    Execute(oneshot::Sender<Result<ExecuteResult, WorkerError>>),
    Inspect(oneshot::Sender<Result<InspectResult, WorkerError>>),
}

impl Pending {
    fn fail(self, err: WorkerError) {
        match self {
            Self::Execute(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Inspect(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct SupervisorState {
    phase: Phase,
    engine: Option<EngineHandle>,
    /// Bumped on every spawn and teardown; events from older engines are
    /// dropped by the pump.
    engine_generation: u64,
    restart_epoch: u64,
    inflight: HashMap<CorrelationId, Pending>,
    versions: HashMap<PathBuf, String>,
    last_memory: Option<(MemorySample, SystemTime)>,
    restart_count: u64,
    last_restart_reason: Option<String>,
    last_restart_at: Option<SystemTime>,
}

pub struct Supervisor {
    id: String,
    db_set: BTreeSet<String>,
    is_fallback_all_db: bool,
    root: PathBuf,
    limits: ExecutorLimits,
    next_correlation: AtomicU64,
    state: Mutex<SupervisorState>,
    restart_gate: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(
        id: String,
        db_set: BTreeSet<String>,
        is_fallback_all_db: bool,
        root: PathBuf,
        limits: ExecutorLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            db_set,
            is_fallback_all_db,
            root,
            limits,
            next_correlation: AtomicU64::new(1),
            state: Mutex::new(SupervisorState {
                phase: Phase::Stopped,
                engine: None,
                engine_generation: 0,
                restart_epoch: 0,
                inflight: HashMap::new(),
                versions: HashMap::new(),
                last_memory: None,
                restart_count: 0,
                last_restart_reason: None,
                last_restart_at: None,
            }),
            restart_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn db_set(&self) -> &BTreeSet<String> {
        &self.db_set
    }

    pub fn is_fallback_all_db(&self) -> bool {
        self.is_fallback_all_db
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    pub fn inflight_count(&self) -> usize {
        self.state.lock().expect("supervisor lock").inflight.len()
    }

    /// Execute a handler. Performs exactly one retry when the worker
    /// reports a version mismatch (the file changed between resolve and
    /// the worker's cache lookup): force a rotation, then re-dispatch.
    pub async fn execute(
        self: &Arc<Self>,
        payload: ExecutePayload,
    ) -> Result<ExecuteResult, WorkerError> {
        match self.execute_once(payload.clone()).await {
            Err(WorkerError::Handler(ref failure))
                if failure.code == Some(WorkerErrorCode::VersionMismatch) =>
            {
                warn!(
                    worker = %self.id,
                    file = %payload.file_path.display(),
                    "version raced the worker cache, rotating and retrying once"
                );
                self.restart("handler version changed").await?;
                self.execute_once(payload).await
            }
            other => other,
        }
    }

    /// Admission pre-checks in contract order: closed, then the inflight
    /// cap. The cap is re-checked at dispatch so it stays a hard bound.
    fn admit(&self) -> Result<(), WorkerError> {
        let st = self.state.lock().expect("supervisor lock");
        if st.phase == Phase::Closed {
            return Err(WorkerError::Closed);
        }
        if st.inflight.len() >= self.limits.max_inflight {
            return Err(WorkerError::Overloaded {
                inflight: st.inflight.len(),
                limit: self.limits.max_inflight,
            });
        }
        Ok(())
    }

    async fn execute_once(
        self: &Arc<Self>,
        payload: ExecutePayload,
    ) -> Result<ExecuteResult, WorkerError> {
        self.admit()?;
        self.rotate_if_version_changed(&payload.file_path, &payload.version)
            .await?;

        let (id, rx) = {
            let mut st = self.state.lock().expect("supervisor lock");
            if st.phase == Phase::Closed {
                return Err(WorkerError::Closed);
            }
            if st.inflight.len() >= self.limits.max_inflight {
                return Err(WorkerError::Overloaded {
                    inflight: st.inflight.len(),
                    limit: self.limits.max_inflight,
                });
            }
            self.start_engine_locked(&mut st)?;

            let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            st.inflight.insert(id, Pending::Execute(tx));
            st.versions
                .insert(payload.file_path.clone(), payload.version.clone());

            let sent = st
                .engine
                .as_ref()
                .map(|engine| {
                    engine.send(WorkerRequest::Execute {
                        id,
                        payload: payload.clone(),
                    })
                })
                .unwrap_or(false);
            if !sent {
                st.inflight.remove(&id);
                drop(st);
                self.spawn_restart("worker exited");
                return Err(WorkerError::Restarted {
                    reason: "worker exited".to_string(),
                });
            }
            (id, rx)
        };

        let result = self.await_reply(id, rx).await?;
        match result.error {
            None => Ok(result),
            Some(failure) => Err(WorkerError::Handler(failure)),
        }
    }

    /// Load a handler's metadata without executing it. Shares Execute's
    /// admission (inspects count against `max_inflight`).
    pub async fn inspect(
        self: &Arc<Self>,
        payload: InspectPayload,
    ) -> Result<HandlerMeta, WorkerError> {
        self.admit()?;
        self.rotate_if_version_changed(&payload.file_path, &payload.version)
            .await?;

        let (id, rx) = {
            let mut st = self.state.lock().expect("supervisor lock");
            if st.phase == Phase::Closed {
                return Err(WorkerError::Closed);
            }
            if st.inflight.len() >= self.limits.max_inflight {
                return Err(WorkerError::Overloaded {
                    inflight: st.inflight.len(),
                    limit: self.limits.max_inflight,
                });
            }
            self.start_engine_locked(&mut st)?;

            let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            st.inflight.insert(id, Pending::Inspect(tx));
            st.versions
                .insert(payload.file_path.clone(), payload.version.clone());

            let sent = st
                .engine
                .as_ref()
                .map(|engine| {
                    engine.send(WorkerRequest::Inspect {
                        id,
                        payload: payload.clone(),
                    })
                })
                .unwrap_or(false);
            if !sent {
                st.inflight.remove(&id);
                drop(st);
                self.spawn_restart("worker exited");
                return Err(WorkerError::Restarted {
                    reason: "worker exited".to_string(),
                });
            }
            (id, rx)
        };

        let result = self.await_inspect_reply(id, rx).await?;
        match result.error {
            None => Ok(result.meta.unwrap_or_default()),
            Some(failure) => Err(WorkerError::Handler(failure)),
        }
    }

    async fn await_reply(
        self: &Arc<Self>,
        id: CorrelationId,
        rx: oneshot::Receiver<Result<ExecuteResult, WorkerError>>,
    ) -> Result<ExecuteResult, WorkerError> {
        let timeout = Duration::from_millis(self.limits.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(WorkerError::Restarted {
                reason: "worker torn down".to_string(),
            }),
            Err(_) => self.fail_timed_out(id).await,
        }
    }

    async fn await_inspect_reply(
        self: &Arc<Self>,
        id: CorrelationId,
        rx: oneshot::Receiver<Result<InspectResult, WorkerError>>,
    ) -> Result<InspectResult, WorkerError> {
        let timeout = Duration::from_millis(self.limits.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(WorkerError::Restarted {
                reason: "worker torn down".to_string(),
            }),
            Err(_) => self.fail_timed_out(id).await,
        }
    }

    /// A deadline expired: drop the inflight record and rotate the worker,
    /// which may be stuck. Restart is the only guaranteed cancellation.
    async fn fail_timed_out<T>(self: &Arc<Self>, id: CorrelationId) -> Result<T, WorkerError> {
        {
            let mut st = self.state.lock().expect("supervisor lock");
            st.inflight.remove(&id);
        }
        let _ = self.restart("request timeout").await;
        Err(WorkerError::Timeout {
            timeout_ms: self.limits.request_timeout_ms,
        })
    }

    /// The cache-eviction contract: a known version that differs from the
    /// requested one forces a rotation before dispatch.
    async fn rotate_if_version_changed(
        self: &Arc<Self>,
        file_path: &PathBuf,
        version: &str,
    ) -> Result<(), WorkerError> {
        let changed = {
            let st = self.state.lock().expect("supervisor lock");
            if st.phase == Phase::Closed {
                return Err(WorkerError::Closed);
            }
            st.versions
                .get(file_path)
                .map(|known| known != version)
                .unwrap_or(false)
        };
        if changed {
            self.restart("handler version changed").await?;
        }
        Ok(())
    }

    /// Drop the module cache by rotating the isolate.
    pub async fn clear_cache(self: &Arc<Self>) -> Result<(), WorkerError> {
        self.restart("cache cleared").await
    }

    /// Serialized restart: tears the engine down, rejects every inflight,
    /// clears the version table, spawns a replacement. Callers that raced
    /// an in-progress restart just await it and return.
    pub async fn restart(self: &Arc<Self>, reason: &str) -> Result<(), WorkerError> {
        let entry_epoch = {
            let st = self.state.lock().expect("supervisor lock");
            if st.phase == Phase::Closed {
                return Err(WorkerError::Closed);
            }
            st.restart_epoch
        };

        let _gate = self.restart_gate.lock().await;

        let engine = {
            let mut st = self.state.lock().expect("supervisor lock");
            if st.phase == Phase::Closed {
                return Err(WorkerError::Closed);
            }
            if st.restart_epoch != entry_epoch {
                // Someone restarted while we waited on the gate.
                return Ok(());
            }
            st.restart_epoch += 1;
            st.phase = Phase::Restarting;
            st.engine_generation += 1;
            st.versions.clear();
            st.last_memory = None;
            st.restart_count += 1;
            st.last_restart_reason = Some(reason.to_string());
            st.last_restart_at = Some(SystemTime::now());
            for (_, pending) in st.inflight.drain() {
                pending.fail(WorkerError::Restarted {
                    reason: reason.to_string(),
                });
            }
            st.engine.take()
        };
        if let Some(engine) = engine {
            engine.terminate();
        }
        info!(worker = %self.id, %reason, "restarting worker");

        let mut st = self.state.lock().expect("supervisor lock");
        st.phase = Phase::Stopped;
        self.start_engine_locked(&mut st)
    }

    fn spawn_restart(self: &Arc<Self>, reason: &str) {
        let sup = Arc::clone(self);
        let reason = reason.to_string();
        tokio::spawn(async move {
            let _ = sup.restart(&reason).await;
        });
    }

    /// Spawn the engine if none is live. Called with the state lock held.
    fn start_engine_locked(
        self: &Arc<Self>,
        st: &mut SupervisorState,
    ) -> Result<(), WorkerError> {
        if st.phase == Phase::Running && st.engine.is_some() {
            return Ok(());
        }
        let bootstrap = WorkerBootstrap {
            worker_id: self.id.clone(),
            db_set: self.db_set.clone(),
            root: self.root.clone(),
            limits: self.limits,
        };
        let (engine, events) = spawn_engine(bootstrap).map_err(|err| WorkerError::Spawn {
            id: self.id.clone(),
            message: err.to_string(),
        })?;
        st.engine_generation += 1;
        st.engine = Some(engine);
        st.phase = Phase::Running;
        self.spawn_event_pump(st.engine_generation, events);
        Ok(())
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: UnboundedReceiver<EngineEvent>,
    ) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::Message(WorkerMessage::Result(result)) => {
                        let heap_used = result.heap_used;
                        sup.complete_execute(generation, result);
                        sup.enforce_memory_limits(generation, heap_used).await;
                    }
                    EngineEvent::Message(WorkerMessage::InspectResult(result)) => {
                        sup.complete_inspect(generation, result);
                    }
                    EngineEvent::Message(WorkerMessage::MemorySample(sample)) => {
                        sup.note_memory(generation, sample).await;
                    }
                    EngineEvent::Exited { error } => {
                        sup.on_engine_exit(generation, error).await;
                        break;
                    }
                }
            }
        });
    }

    fn complete_execute(&self, generation: u64, result: ExecuteResult) {
        let mut st = self.state.lock().expect("supervisor lock");
        if st.engine_generation != generation {
            return; // straggler from a rotated engine
        }
        match st.inflight.remove(&result.id) {
            Some(Pending::Execute(tx)) => {
                let _ = tx.send(Ok(result));
            }
            // Unknown ids (post-timeout, post-restart) are dropped.
            Some(other) => drop(other),
            None => {}
        }
    }

    fn complete_inspect(&self, generation: u64, result: InspectResult) {
        let mut st = self.state.lock().expect("supervisor lock");
        if st.engine_generation != generation {
            return;
        }
        match st.inflight.remove(&result.id) {
            Some(Pending::Inspect(tx)) => {
                let _ = tx.send(Ok(result));
            }
            Some(other) => drop(other),
            None => {}
        }
    }

    async fn note_memory(self: &Arc<Self>, generation: u64, sample: MemorySample) {
        {
            let mut st = self.state.lock().expect("supervisor lock");
            if st.engine_generation != generation {
                return;
            }
            st.last_memory = Some((sample, SystemTime::now()));
        }
        self.enforce_memory_limits(generation, sample.heap_used).await;
    }

    async fn enforce_memory_limits(self: &Arc<Self>, generation: u64, heap_used: u64) {
        let reason = {
            let st = self.state.lock().expect("supervisor lock");
            if st.engine_generation != generation || st.phase != Phase::Running {
                return;
            }
            if heap_used >= self.limits.memory_hard_limit_mb * MB {
                Some("memory hard limit")
            } else if heap_used >= self.limits.memory_soft_limit_mb * MB
                && (!self.limits.soft_limit_requires_idle || st.inflight.is_empty())
            {
                Some("memory soft limit")
            } else {
                None
            }
        };
        if let Some(reason) = reason {
            debug!(worker = %self.id, heap_used, %reason, "memory limit crossed");
            let _ = self.restart(reason).await;
        }
    }

    async fn on_engine_exit(self: &Arc<Self>, generation: u64, error: Option<String>) {
        let unexpected = {
            let st = self.state.lock().expect("supervisor lock");
            st.engine_generation == generation && st.phase == Phase::Running
        };
        if unexpected {
            let reason = match error {
                Some(detail) => format!("worker exited: {detail}"),
                None => "worker exited".to_string(),
            };
            let _ = self.restart(&reason).await;
        }
    }

    /// Idempotent: rejects every inflight with "runtime worker closed" and
    /// terminates the engine. Terminal.
    pub fn close(&self) {
        let engine = {
            let mut st = self.state.lock().expect("supervisor lock");
            if st.phase == Phase::Closed {
                return;
            }
            st.phase = Phase::Closed;
            st.engine_generation += 1;
            st.versions.clear();
            for (_, pending) in st.inflight.drain() {
                pending.fail(WorkerError::Closed);
            }
            st.engine.take()
        };
        if let Some(engine) = engine {
            engine.terminate();
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let st = self.state.lock().expect("supervisor lock");
        let mut handlers: Vec<TrackedHandler> = st
            .versions
            .iter()
            .map(|(path, version)| TrackedHandler {
                file_path: path.display().to_string(),
                version: version.clone(),
            })
            .collect();
        handlers.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        WorkerSnapshot {
            id: self.id.clone(),
            status: st.phase.as_str(),
            thread_id: st.engine.as_ref().map(|e| e.engine_seq),
            inflight: st.inflight.len(),
            tracked_handlers: handlers.len(),
            handlers,
            restart_count: st.restart_count,
            last_restart_reason: st.last_restart_reason.clone(),
            last_restart_at: st.last_restart_at.map(epoch_ms),
            limits: self.limits,
            memory: st.last_memory.map(|(sample, at)| MemorySnapshot {
                heap_used: sample.heap_used,
                rss: sample.rss,
                external: sample.external,
                array_buffers: sample.array_buffers,
                sampled_at: epoch_ms(at),
            }),
            db_set: self.db_set.iter().cloned().collect(),
            is_fallback_all_db: self.is_fallback_all_db,
        }
    }
}

fn epoch_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ===== snapshot DTOs =========================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedHandler {
    pub file_path: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub heap_used: u64,
    pub rss: u64,
    pub external: u64,
    pub array_buffers: u64,
    pub sampled_at: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u64>,
    pub inflight: usize,
    pub tracked_handlers: usize,
    pub handlers: Vec<TrackedHandler>,
    pub restart_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<u64>,
    pub limits: ExecutorLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySnapshot>,
    pub db_set: Vec<String>,
    pub is_fallback_all_db: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_handler(root: &Path, rel: &str, source: &str) -> PathBuf {
        let path = root.join(rel);
        std::fs::write(&path, source).unwrap();
        path
    }

    fn payload_for(path: &Path, version: &str) -> ExecutePayload {
        ExecutePayload {
            file_path: path.to_path_buf(),
            version: version.to_string(),
            method: "GET".to_string(),
            url: "/t".to_string(),
            headers: Vec::new(),
            body: None,
            ip: "127.0.0.1".to_string(),
        }
    }

    fn supervisor_with(root: &Path, limits: ExecutorLimits) -> Arc<Supervisor> {
        Supervisor::new(
            "w-test".to_string(),
            BTreeSet::new(),
            true,
            root.to_path_buf(),
            limits,
        )
    }

    #[tokio::test]
    async fn executes_and_tracks_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_handler(dir.path(), "h.mjs", "export default () => 'ok';");
        let sup = supervisor_with(dir.path(), ExecutorLimits::default());

        let result = sup.execute(payload_for(&path, "1:1")).await.unwrap();
        assert!(result.ok);
        let snapshot = sup.snapshot();
        assert_eq!(snapshot.status, "running");
        assert_eq!(snapshot.tracked_handlers, 1);
        sup.close();
    }

    #[tokio::test]
    async fn version_change_restarts_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_handler(dir.path(), "h.mjs", "export default () => 'v1';");
        let sup = supervisor_with(dir.path(), ExecutorLimits::default());

        let first = sup.execute(payload_for(&path, "1:1")).await.unwrap();
        assert_eq!(
            first.response.unwrap().body.as_deref(),
            Some(b"v1".as_slice())
        );

        write_handler(dir.path(), "h.mjs", "export default () => 'v2!';");
        let second = sup.execute(payload_for(&path, "2:2")).await.unwrap();
        assert_eq!(
            second.response.unwrap().body.as_deref(),
            Some(b"v2!".as_slice())
        );
        assert_eq!(sup.snapshot().restart_count, 1);
        sup.close();
    }

    #[tokio::test]
    async fn same_version_does_not_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_handler(dir.path(), "h.mjs", "export default () => 'ok';");
        let sup = supervisor_with(dir.path(), ExecutorLimits::default());

        sup.execute(payload_for(&path, "1:1")).await.unwrap();
        sup.execute(payload_for(&path, "1:1")).await.unwrap();
        assert_eq!(sup.snapshot().restart_count, 0);
        sup.close();
    }

    #[tokio::test]
    async fn stuck_handler_times_out_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_handler(
            dir.path(),
            "h.mjs",
            "export default () => { for (;;) {} };",
        );
        let limits = ExecutorLimits {
            request_timeout_ms: 200,
            ..ExecutorLimits::default()
        };
        let sup = supervisor_with(dir.path(), limits);

        let err = sup.execute(payload_for(&path, "1:1")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Timeout { .. }));
        assert_eq!(sup.snapshot().restart_count, 1);
        sup.close();
    }

    #[tokio::test]
    async fn closed_supervisor_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_handler(dir.path(), "h.mjs", "export default () => 'ok';");
        let sup = supervisor_with(dir.path(), ExecutorLimits::default());

        sup.close();
        sup.close(); // idempotent
        let err = sup.execute(payload_for(&path, "1:1")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Closed));
        assert_eq!(sup.snapshot().status, "closed");
    }

    #[tokio::test]
    async fn clear_cache_rotates_the_isolate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_handler(
            dir.path(),
            "h.mjs",
            "let n = 0; export default () => String(++n);",
        );
        let sup = supervisor_with(dir.path(), ExecutorLimits::default());

        let first = sup.execute(payload_for(&path, "1:1")).await.unwrap();
        assert_eq!(
            first.response.unwrap().body.as_deref(),
            Some(b"1".as_slice())
        );

        sup.clear_cache().await.unwrap();
        // Fresh isolate, fresh module state.
        let second = sup.execute(payload_for(&path, "1:1")).await.unwrap();
        assert_eq!(
            second.response.unwrap().body.as_deref(),
            Some(b"1".as_slice())
        );
        assert_eq!(sup.snapshot().last_restart_reason.as_deref(), Some("cache cleared"));
        sup.close();
    }

    #[tokio::test]
    async fn inspect_reports_meta_without_executing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_handler(
            dir.path(),
            "h.mjs",
            "export default { handler: () => 'x', db: [] };",
        );
        let sup = supervisor_with(dir.path(), ExecutorLimits::default());

        let meta = sup
            .inspect(InspectPayload {
                file_path: path,
                version: "1:1".to_string(),
            })
            .await
            .unwrap();
        assert!(meta.db.is_empty());
        sup.close();
    }
}
