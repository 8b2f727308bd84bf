/**
 * Workerpool — a pool of thread or process workers for offloading tasks.
 *
 * This is the crate applications depend on directly. It re-exports the
 * engine crate's public API and adds one convenience constructor that
 * bundles registry building and pool construction into a single call.
 *
 * # Quick start
 *
 * ```ignore
 * let registry = workerpool::Registry::builder()
 *     .method("double", |params, _ctx| {
 *         let n = params[0].as_i64().unwrap_or(0);
 *         Ok((n * 2).into())
 *     })
 *     .build();
 *
 * let pool = workerpool::spawn(workerpool::PoolOptions::default(), registry).await?;
 * let result = pool.exec("double", vec![21.into()], Default::default()).await?.await?;
 * assert_eq!(result, 42);
 * ```
 *
 * A binary that uses `WorkerKind::Process` must call
 * [`process::maybe_enter_worker`] as the first line of `main`, before
 * anything else runs, so a re-executed worker child takes the worker path
 * instead of repeating the controller's startup:
 *
 * ```ignore
 * #[tokio::main]
 * async fn main() {
 *     workerpool::process::maybe_enter_worker(build_registry, Default::default()).await;
 *     // only the controller process reaches here
 * }
 * ```
 */
pub use workerpool_core::{
    AbortListener, ExecOptions, Method, MinWorkers, Pool, PoolError, PoolOptions, PoolProxy, PoolStats,
    RegisterOptions, Registry, RegistryBuilder, ResolvedPoolOptions, SerializedError, TaskHandle, WorkerContext,
    WorkerError, WorkerKind, WorkerKindOrDefault, CLEANUP_METHOD, TERMINATE_METHOD,
};

/// Builds and starts a pool in one call: equivalent to
/// `Pool::new(options, registry, RegisterOptions::default())`.
pub async fn spawn(options: PoolOptions, registry: Registry) -> Result<Pool, PoolError> {
    Pool::new(options, registry, RegisterOptions::default()).await
}

/// Environment-detection helpers used by `PoolOptions::build` to pick
/// sensible defaults; exposed for hosts that want the same numbers.
pub mod runtime {
    pub use workerpool_core::{is_main_thread, logical_cpus, mark_main_thread};
}

/// The worker-side process entry point for `WorkerKind::Process` pools.
pub mod process {
    pub use workerpool_core::maybe_enter_worker;
}
