/*!
 * Configuration types. Unlike a duck-typed options bag, invalid
 * configurations are rejected by [`PoolOptions::build`] at construction
 * time rather than discovered later against a key allowlist.
 */
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PoolError;

/// How many workers the pool keeps warm at all times.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinWorkers {
    Fixed(usize),
    /// Keep `max_workers` workers warm at all times.
    Max,
}

impl Default for MinWorkers {
    fn default() -> Self {
        MinWorkers::Fixed(0)
    }
}

/// What a worker endpoint actually is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// A dedicated OS thread inside this process.
    Thread,
    /// A freshly spawned OS process, re-executing the current binary.
    Process,
}

/// Default-constructible knobs for a [`crate::pool::Pool`].
///
/// `serde::Deserialize` is derived so a host application can load pool
/// sizing from a config file/env layer instead of hardcoding it; the
/// callback fields (`on_create_worker` & co.) are necessarily set in code
/// after deserializing the rest.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct PoolOptions {
    pub min_workers: MinWorkers,
    pub max_workers: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub worker_kind: WorkerKindOrDefault,
    #[serde(with = "humantime_millis", default = "default_terminate_timeout")]
    pub worker_terminate_timeout: Duration,
    pub worker_exe: Option<PathBuf>,
    #[serde(default)]
    pub worker_args: Vec<String>,
    #[serde(default)]
    pub worker_env: Vec<(String, String)>,
    #[serde(default = "default_debug_port_start")]
    pub debug_port_start: u16,

    #[serde(skip)]
    pub on_create_worker: Option<Arc<dyn Fn() + Send + Sync>>,
    #[serde(skip)]
    pub on_created_worker: Option<Arc<dyn Fn() + Send + Sync>>,
    #[serde(skip)]
    pub on_terminate_worker: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// `serde(default)`-friendly wrapper so `WorkerKind` can be left unset in a
/// config file and still resolve to `Thread`.
#[derive(Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerKindOrDefault(Option<WorkerKind>);

impl From<WorkerKind> for WorkerKindOrDefault {
    fn from(k: WorkerKind) -> Self {
        WorkerKindOrDefault(Some(k))
    }
}

fn default_terminate_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_debug_port_start() -> u16 {
    43210
}

mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Resolved, validated pool configuration. Produced by [`PoolOptions::build`].
#[derive(Clone)]
pub struct ResolvedPoolOptions {
    pub min_workers: usize,
    pub max_workers: usize,
    pub max_queue_size: Option<usize>,
    pub worker_kind: WorkerKind,
    pub worker_terminate_timeout: Duration,
    pub worker_exe: Option<PathBuf>,
    pub worker_args: Vec<String>,
    pub worker_env: Vec<(String, String)>,
    pub debug_port_start: u16,
    pub on_create_worker: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_created_worker: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_terminate_worker: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl PoolOptions {
    pub fn build(self) -> Result<ResolvedPoolOptions, PoolError> {
        let default_max = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);

        let max_workers = self.max_workers.unwrap_or(default_max);
        if max_workers == 0 {
            return Err(PoolError::Configuration(
                "max_workers must be at least 1".into(),
            ));
        }

        let min_workers = match self.min_workers {
            MinWorkers::Max => max_workers,
            MinWorkers::Fixed(n) => n,
        };

        let max_workers = max_workers.max(min_workers);

        if let Some(q) = self.max_queue_size {
            if q == 0 {
                return Err(PoolError::Configuration(
                    "max_queue_size must be at least 1 when set".into(),
                ));
            }
        }

        Ok(ResolvedPoolOptions {
            min_workers,
            max_workers,
            max_queue_size: self.max_queue_size,
            worker_kind: self.worker_kind.0.unwrap_or(WorkerKind::Thread),
            worker_terminate_timeout: self.worker_terminate_timeout,
            worker_exe: self.worker_exe,
            worker_args: self.worker_args,
            worker_env: self.worker_env,
            debug_port_start: self.debug_port_start,
            on_create_worker: self.on_create_worker,
            on_created_worker: self.on_created_worker,
            on_terminate_worker: self.on_terminate_worker,
        })
    }
}

/// Per-call options for [`crate::pool::Pool::exec`].
#[derive(Clone, Default)]
pub struct ExecOptions {
    /// Invoked for every event the worker emits while this task runs.
    pub on_event: Option<Arc<dyn Fn(Value) + Send + Sync>>,
}

/// Options passed to the worker-side `register` call.
#[derive(Clone, Default)]
pub struct RegisterOptions {
    pub abort_listener_timeout: Option<Duration>,
}

impl RegisterOptions {
    pub fn abort_listener_timeout(&self) -> Duration {
        self.abort_listener_timeout
            .unwrap_or(Duration::from_millis(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_max_workers() {
        let opts = PoolOptions {
            max_workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(opts.build(), Err(PoolError::Configuration(_))));
    }

    #[test]
    fn rejects_zero_max_queue_size() {
        let opts = PoolOptions {
            max_queue_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(opts.build(), Err(PoolError::Configuration(_))));
    }

    #[test]
    fn min_workers_max_tracks_max_workers() {
        let opts = PoolOptions {
            min_workers: MinWorkers::Max,
            max_workers: Some(4),
            ..Default::default()
        }
        .build()
        .expect("valid config");
        assert_eq!(opts.min_workers, 4);
        assert_eq!(opts.max_workers, 4);
    }

    #[test]
    fn max_workers_grows_to_cover_min_workers() {
        let opts = PoolOptions {
            min_workers: MinWorkers::Fixed(3),
            max_workers: Some(1),
            ..Default::default()
        }
        .build()
        .expect("valid config");
        assert_eq!(opts.max_workers, 3);
    }

    #[test]
    fn worker_kind_defaults_to_thread() {
        let opts = PoolOptions::default().build().expect("valid config");
        assert_eq!(opts.worker_kind, WorkerKind::Thread);
    }
}
