//! Handler workers: a worker is a dedicated OS thread owning one QuickJS
//! runtime. The thread plus its engine form the isolate — tearing the
//! thread down frees the entire engine heap, which is what makes the
//! version-rotation contract airtight.

pub mod engine;
pub mod host;

pub use host::{spawn_engine, EngineEvent, EngineHandle, WorkerBootstrap};
