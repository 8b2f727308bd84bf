/*!
 * A worker pool that offloads tasks to dedicated OS threads or freshly
 * spawned OS processes, talking to them over a small request/response wire
 * protocol (see [`protocol`]).
 *
 * Start with [`Pool::new`], register methods on a [`Registry`] built with
 * [`Registry::builder`], and submit work with [`Pool::exec`]. A process
 * worker binary must call [`process_bootstrap::maybe_enter_worker`] as the
 * first thing in `main`.
 */
mod debug_port;
mod error;
mod future;
mod handle;
mod options;
mod pool;
mod process_bootstrap;
mod protocol;
mod registry;
mod runtime_info;
mod worker_runtime;

pub use error::{PoolError, SerializedError, WorkerError};
pub use future::TaskHandle;
pub use handle::Method;
pub use options::{
    ExecOptions, MinWorkers, PoolOptions, RegisterOptions, ResolvedPoolOptions, WorkerKind, WorkerKindOrDefault,
};
pub use pool::{Pool, PoolProxy, PoolStats};
pub use process_bootstrap::maybe_enter_worker;
pub use protocol::{CLEANUP_METHOD, TERMINATE_METHOD};
pub use registry::{AbortListener, Registry, RegistryBuilder, WorkerContext};
pub use runtime_info::{is_main_thread, logical_cpus, mark_main_thread};
