//! Process-wide configuration, resolved once at startup. Everything here
//! is a plain value: the runtime receives it by reference and keeps no
//! global state.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MB: u64 = 1024 * 1024;

/// Per-worker overrides a spec entry (or the global `workerOptions`) may
/// carry. Unset fields fall back to the defaults in [`ExecutorLimits`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorOptions {
    pub max_heap_size_mb: Option<u64>,
    pub stack_size_mb: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_inflight: Option<usize>,
    pub memory_soft_limit_mb: Option<u64>,
    pub memory_hard_limit_mb: Option<u64>,
    pub soft_limit_requires_idle: Option<bool>,
    pub memory_sample_interval_ms: Option<u64>,
    pub max_response_bytes: Option<u64>,
}

/// Fully resolved executor limits for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorLimits {
    /// Engine heap cap enforced at spawn.
    pub max_heap_size_mb: u64,
    pub stack_size_mb: u64,
    pub request_timeout_ms: u64,
    pub max_inflight: usize,
    pub memory_soft_limit_mb: u64,
    pub memory_hard_limit_mb: u64,
    /// When true, a soft-limit breach restarts only with zero inflight.
    pub soft_limit_requires_idle: bool,
    pub memory_sample_interval_ms: u64,
    pub max_response_bytes: u64,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            max_heap_size_mb: 160,
            stack_size_mb: 4,
            request_timeout_ms: 3_000,
            max_inflight: 64,
            memory_soft_limit_mb: 96,
            memory_hard_limit_mb: 128,
            soft_limit_requires_idle: true,
            memory_sample_interval_ms: 5_000,
            max_response_bytes: 16 * MB,
        }
    }
}

impl ExecutorLimits {
    pub fn with_overrides(mut self, opts: &ExecutorOptions) -> Self {
        if let Some(v) = opts.max_heap_size_mb {
            self.max_heap_size_mb = v;
        }
        if let Some(v) = opts.stack_size_mb {
            self.stack_size_mb = v;
        }
        if let Some(v) = opts.request_timeout_ms {
            self.request_timeout_ms = v;
        }
        if let Some(v) = opts.max_inflight {
            self.max_inflight = v;
        }
        if let Some(v) = opts.memory_soft_limit_mb {
            self.memory_soft_limit_mb = v;
        }
        if let Some(v) = opts.memory_hard_limit_mb {
            self.memory_hard_limit_mb = v;
        }
        if let Some(v) = opts.soft_limit_requires_idle {
            self.soft_limit_requires_idle = v;
        }
        if let Some(v) = opts.memory_sample_interval_ms {
            self.memory_sample_interval_ms = v;
        }
        if let Some(v) = opts.max_response_bytes {
            self.max_response_bytes = v;
        }
        self
    }
}

/// One entry of a custom worker strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    pub id: String,
    #[serde(default)]
    pub db: Vec<String>,
    #[serde(flatten)]
    pub overrides: ExecutorOptions,
}

/// `"all"` keeps a single worker holding every declared database; a
/// custom list pins capability sets per worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerStrategy {
    Named(NamedStrategy),
    Custom(Vec<WorkerSpec>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedStrategy {
    All,
}

impl Default for WorkerStrategy {
    fn default() -> Self {
        Self::Named(NamedStrategy::All)
    }
}

impl WorkerStrategy {
    pub fn all() -> Self {
        Self::default()
    }
}

/// Top-level configuration handed to the file runtime and the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxionConfig {
    /// The dynamic directory. Everything the server does is defined by
    /// this tree.
    pub dir: PathBuf,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub worker_strategy: WorkerStrategy,
    #[serde(default)]
    pub worker_options: ExecutorOptions,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_request_bytes() -> u64 {
    MB
}

impl FluxionConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            host: default_host(),
            port: default_port(),
            max_request_bytes: default_max_request_bytes(),
            databases: Vec::new(),
            worker_strategy: WorkerStrategy::default(),
            worker_options: ExecutorOptions::default(),
        }
    }

    pub fn declared_databases(&self) -> BTreeSet<String> {
        self.databases.iter().cloned().collect()
    }

    pub fn limits(&self) -> ExecutorLimits {
        ExecutorLimits::default().with_overrides(&self.worker_options)
    }

    /// Fail-fast checks that do not need the filesystem. Worker-spec
    /// validation happens in `binding::build`, which owns those rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_bytes == 0 {
            return Err(ConfigError::InvalidMaxRequestBytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_all_and_custom() {
        let all: WorkerStrategy = serde_json::from_str("\"all\"").unwrap();
        assert!(matches!(all, WorkerStrategy::Named(NamedStrategy::All)));

        let custom: WorkerStrategy =
            serde_json::from_str(r#"[{"id": "w1", "db": ["db1"], "maxInflight": 8}]"#).unwrap();
        match custom {
            WorkerStrategy::Custom(specs) => {
                assert_eq!(specs.len(), 1);
                assert_eq!(specs[0].id, "w1");
                assert_eq!(specs[0].overrides.max_inflight, Some(8));
            }
            _ => panic!("expected custom strategy"),
        }
    }

    #[test]
    fn overrides_apply_over_defaults() {
        let opts = ExecutorOptions {
            request_timeout_ms: Some(250),
            ..Default::default()
        };
        let limits = ExecutorLimits::default().with_overrides(&opts);
        assert_eq!(limits.request_timeout_ms, 250);
        assert_eq!(limits.max_inflight, 64);
    }

    #[test]
    fn zero_max_request_bytes_is_rejected() {
        let mut config = FluxionConfig::new("/tmp/x");
        config.max_request_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_accepts_camel_case_json() {
        let config: FluxionConfig = serde_json::from_str(
            r#"{"dir": "/srv/app", "maxRequestBytes": 8, "databases": ["db1", "db2"],
                "workerStrategy": [{"id": "w1", "db": ["db1"]}]}"#,
        )
        .unwrap();
        assert_eq!(config.max_request_bytes, 8);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.declared_databases().len(), 2);
    }
}
