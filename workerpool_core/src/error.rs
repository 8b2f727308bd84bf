/*!
 * Error taxonomy for the worker pool.
 *
 * Errors are split along the same line as the rest of the crate: `PoolError`
 * covers mistakes the caller can only make against the `Pool` itself
 * (bad configuration, a full queue, talking to a terminated pool), while
 * `WorkerError` covers everything that can go wrong with one in-flight task
 * or one worker endpoint. A `WorkerError` is always also a valid `PoolError`
 * via `#[from]`, since `Pool::exec` surfaces whatever its worker reports.
 */
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// An error that crossed the wire from a worker.
///
/// Mirrors the convention of copying every enumerable property of the
/// original error/exception into `properties` so nothing the user attached
/// to it is lost in transit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for SerializedError {}

/// Errors surfaced by an individual task or worker.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// The registered method raised an error; `SerializedError` carries it
    /// across the wire unchanged.
    #[error("{0}")]
    Remote(SerializedError),

    /// No method with this name is registered in the worker.
    #[error("unknown method {0:?}")]
    UnknownMethod(String),

    /// `Method::Fn` was routed to a `WorkerKind::Process` pool. A bare
    /// function pointer is not portably relocatable across a fresh exec.
    #[error("inline functions can only run on thread workers")]
    FnOnProcessWorker,

    /// The task's `TaskHandle` was cancelled by the caller.
    #[error("task cancelled")]
    Cancelled,

    /// The task's timeout elapsed before a terminal response arrived.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The worker was torn down (gracefully or forcibly) while this task
    /// was still in flight.
    #[error("worker terminated")]
    Terminated,

    /// The worker endpoint exited unexpectedly.
    #[error("worker crashed (exit_code={exit_code:?}, signal={signal:?}, exe={exe:?})")]
    Crashed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        exe: PathBuf,
    },

    /// Cleanup did not complete within `abort_listener_timeout` /
    /// `worker_terminate_timeout`.
    #[error("cleanup timed out, worker was terminated")]
    CleanupTimedOut,

    /// Transport-level failure (pipe closed, spawn failed, (de)serialization).
    #[error("worker io error: {0}")]
    Io(String),
}

/// Errors surfaced by the `Pool` itself, independent of any one task.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    #[error("task queue is full (max {0})")]
    QueueFull(usize),

    #[error("pool has been terminated")]
    PoolTerminated,

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_error_display_is_name_and_message() {
        let err = SerializedError::new("TypeError", "params[0] is not a number");
        assert_eq!(err.to_string(), "TypeError: params[0] is not a number");
    }

    #[test]
    fn with_property_is_additive() {
        let err = SerializedError::new("Error", "boom")
            .with_property("code", "E_BOOM")
            .with_property("retryable", true);
        assert_eq!(err.properties.len(), 2);
        assert_eq!(err.properties["code"], Value::from("E_BOOM"));
    }

    #[test]
    fn pool_error_wraps_worker_error() {
        let pool_err: PoolError = WorkerError::Cancelled.into();
        assert!(matches!(pool_err, PoolError::Worker(WorkerError::Cancelled)));
    }
}
