//! Worker bindings: turn the configured strategy into a set of
//! supervised workers, and route a handler's declared capability set to
//! the minimal satisfying worker.
//!
//! An all-capability fallback binding always exists, so selection can
//! never come up empty.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::config::{ExecutorLimits, FluxionConfig, WorkerSpec, WorkerStrategy};
use crate::error::ConfigError;
use crate::supervisor::Supervisor;

/// Id given to the synthesized all-db fallback worker. De-conflicted with
/// a numeric suffix if a user spec already claimed it.
pub const FALLBACK_WORKER_ID: &str = "fluxion-worker-all";

/// One runtime worker with its capability set.
pub struct WorkerBinding {
    pub supervisor: Arc<Supervisor>,
}

impl WorkerBinding {
    pub fn id(&self) -> &str {
        self.supervisor.id()
    }

    pub fn db_set(&self) -> &BTreeSet<String> {
        self.supervisor.db_set()
    }

    pub fn is_fallback_all_db(&self) -> bool {
        self.supervisor.is_fallback_all_db()
    }
}

/// The full worker pool plus the binding used for Inspect traffic.
pub struct BindingSet {
    bindings: Vec<WorkerBinding>,
    inspect_index: usize,
}

/// Build the pool from the configured strategy. Validation here is
/// fail-fast: empty ids, duplicate ids, and unknown database names all
/// refuse startup.
pub fn build(
    config: &FluxionConfig,
    root: &Path,
    declared: &BTreeSet<String>,
) -> Result<BindingSet, ConfigError> {
    let base_limits = config.limits();
    let mut bindings = Vec::new();

    match &config.worker_strategy {
        WorkerStrategy::Named(_) => {
            bindings.push(make_binding(
                FALLBACK_WORKER_ID.to_string(),
                declared.clone(),
                true,
                root,
                base_limits,
            ));
        }
        WorkerStrategy::Custom(specs) => {
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            for (index, spec) in specs.iter().enumerate() {
                validate_spec(index, spec, declared, &seen)?;
                seen.insert(spec.id.as_str());
            }
            let mut has_all_db = false;
            for spec in specs {
                let db_set: BTreeSet<String> = spec.db.iter().cloned().collect();
                let covers_all = db_set == *declared;
                has_all_db |= covers_all;
                bindings.push(make_binding(
                    spec.id.clone(),
                    db_set,
                    false,
                    root,
                    base_limits.with_overrides(&spec.overrides),
                ));
            }
            if !has_all_db {
                let id = deconflict_fallback_id(&seen);
                bindings.push(make_binding(id, declared.clone(), true, root, base_limits));
            }
        }
    }

    let inspect_index = bindings
        .iter()
        .position(|b| b.is_fallback_all_db())
        .or_else(|| bindings.iter().position(|b| b.db_set() == declared))
        .unwrap_or(0);

    Ok(BindingSet {
        bindings,
        inspect_index,
    })
}

fn validate_spec(
    index: usize,
    spec: &WorkerSpec,
    declared: &BTreeSet<String>,
    seen: &BTreeSet<&str>,
) -> Result<(), ConfigError> {
    if spec.id.trim().is_empty() {
        return Err(ConfigError::EmptyWorkerId { index });
    }
    if seen.contains(spec.id.as_str()) {
        return Err(ConfigError::DuplicateWorkerId {
            id: spec.id.clone(),
        });
    }
    for db in &spec.db {
        if !declared.contains(db) {
            return Err(ConfigError::UnknownDatabase {
                id: spec.id.clone(),
                db: db.clone(),
            });
        }
    }
    Ok(())
}

fn deconflict_fallback_id(seen: &BTreeSet<&str>) -> String {
    if !seen.contains(FALLBACK_WORKER_ID) {
        return FALLBACK_WORKER_ID.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{FALLBACK_WORKER_ID}-{n}");
        if !seen.contains(candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

fn make_binding(
    id: String,
    db_set: BTreeSet<String>,
    is_fallback_all_db: bool,
    root: &Path,
    limits: ExecutorLimits,
) -> WorkerBinding {
    WorkerBinding {
        supervisor: Supervisor::new(id, db_set, is_fallback_all_db, root.to_path_buf(), limits),
    }
}

impl BindingSet {
    pub fn bindings(&self) -> &[WorkerBinding] {
        &self.bindings
    }

    /// The binding Inspect traffic goes to: the fallback all-db worker,
    /// or the first worker whose set covers every declared database.
    pub fn inspect_binding(&self) -> &WorkerBinding {
        &self.bindings[self.inspect_index]
    }

    /// Pick the worker for a handler requiring `required`: among the
    /// bindings whose capability set is a superset, the one with the
    /// smallest set, then the fewest inflight, then the smallest id.
    pub fn select(&self, required: &BTreeSet<String>) -> &WorkerBinding {
        self.bindings
            .iter()
            .filter(|b| required.is_subset(b.db_set()))
            .min_by(|a, b| {
                (a.db_set().len(), a.supervisor.inflight_count(), a.id()).cmp(&(
                    b.db_set().len(),
                    b.supervisor.inflight_count(),
                    b.id(),
                ))
            })
            .expect("the all-db fallback binding always satisfies any requirement")
    }

    pub fn close_all(&self) {
        for binding in &self.bindings {
            binding.supervisor.close();
        }
    }
}
