//! Engine host: spawns the worker thread, pumps commands in and events
//! out. The dispatcher never blocks on the engine; everything crosses as
//! messages.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::config::ExecutorLimits;
use crate::protocol::{WorkerMessage, WorkerRequest};
use crate::worker::engine::{EngineConfig, HandlerEngine};

static ENGINE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Everything a fresh engine needs to boot.
#[derive(Debug, Clone)]
pub struct WorkerBootstrap {
    pub worker_id: String,
    pub db_set: BTreeSet<String>,
    pub root: PathBuf,
    pub limits: ExecutorLimits,
}

/// Events the host thread emits toward the supervisor.
#[derive(Debug)]
pub enum EngineEvent {
    Message(WorkerMessage),
    /// The thread is gone. `error` is set when boot failed.
    Exited { error: Option<String> },
}

/// Main-side handle to one engine thread.
pub struct EngineHandle {
    /// Process-wide monotonic engine number (the snapshot `threadId`).
    pub engine_seq: u64,
    cmd_tx: mpsc::Sender<WorkerRequest>,
    kill: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Post a request to the engine. `false` means the thread is gone.
    pub fn send(&self, request: WorkerRequest) -> bool {
        self.cmd_tx.send(request).is_ok()
    }

    /// Ask the engine to die. The interrupt handler aborts any script in
    /// progress; the thread exits as soon as it observes the flag or the
    /// closed channel.
    pub fn terminate(&self) {
        self.kill.store(true, Ordering::Relaxed);
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawn an engine thread. Returns the handle plus the event stream the
/// supervisor's pump consumes.
pub fn spawn_engine(
    bootstrap: WorkerBootstrap,
) -> io::Result<(EngineHandle, UnboundedReceiver<EngineEvent>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (event_tx, event_rx) = unbounded_channel();
    let kill = Arc::new(AtomicBool::new(false));
    let engine_seq = ENGINE_SEQ.fetch_add(1, Ordering::Relaxed) + 1;

    let thread_kill = Arc::clone(&kill);
    std::thread::Builder::new()
        .name(format!("fluxion-engine-{}", bootstrap.worker_id))
        .spawn(move || host_loop(bootstrap, cmd_rx, event_tx, thread_kill))?;

    Ok((
        EngineHandle {
            engine_seq,
            cmd_tx,
            kill,
        },
        event_rx,
    ))
}

fn host_loop(
    bootstrap: WorkerBootstrap,
    cmd_rx: mpsc::Receiver<WorkerRequest>,
    event_tx: UnboundedSender<EngineEvent>,
    kill: Arc<AtomicBool>,
) {
    let config = EngineConfig {
        worker_id: bootstrap.worker_id.clone(),
        db_set: bootstrap.db_set,
        root: bootstrap.root,
        max_heap_size_mb: bootstrap.limits.max_heap_size_mb,
        stack_size_mb: bootstrap.limits.stack_size_mb,
        max_response_bytes: bootstrap.limits.max_response_bytes,
    };
    let mut engine = match HandlerEngine::new(config, Arc::clone(&kill)) {
        Ok(engine) => engine,
        Err(err) => {
            let _ = event_tx.send(EngineEvent::Exited {
                error: Some(format!("engine boot failed: {err}")),
            });
            return;
        }
    };

    let sample_interval = Duration::from_millis(bootstrap.limits.memory_sample_interval_ms.max(1));
    let mut next_sample = Instant::now() + sample_interval;

    loop {
        if kill.load(Ordering::Relaxed) {
            break;
        }
        let wait = next_sample.saturating_duration_since(Instant::now());
        match cmd_rx.recv_timeout(wait) {
            Ok(request) => {
                let message = match request {
                    WorkerRequest::Execute { id, payload } => {
                        WorkerMessage::Result(engine.execute(id, payload))
                    }
                    WorkerRequest::Inspect { id, payload } => {
                        WorkerMessage::InspectResult(engine.inspect(id, payload))
                    }
                };
                if event_tx.send(EngineEvent::Message(message)).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let sample = engine.memory_sample();
                if event_tx
                    .send(EngineEvent::Message(WorkerMessage::MemorySample(sample)))
                    .is_err()
                {
                    break;
                }
                next_sample = Instant::now() + sample_interval;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = %bootstrap.worker_id, "engine thread exiting");
    let _ = event_tx.send(EngineEvent::Exited { error: None });
}
