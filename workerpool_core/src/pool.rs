/*!
 * `Pool` — owns a set of [`WorkerHandle`]s, a FIFO task queue, and the
 * dispatch loop that assigns queued tasks to idle workers.
 */
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::debug_port::{lease, DebugPortLease};
use crate::error::PoolError;
use crate::future::TaskHandle;
use crate::handle::{Method, WorkerHandle};
use crate::options::{ExecOptions, PoolOptions, RegisterOptions, ResolvedPoolOptions, WorkerKind};
use crate::registry::Registry;

struct QueuedTask {
    method: Method,
    params: Vec<Value>,
    options: ExecOptions,
    resolver: tokio::sync::oneshot::Sender<Result<Value, crate::error::WorkerError>>,
    control: crate::future::CancelControl,
}

struct LiveWorker {
    handle: WorkerHandle,
    _debug_port: Option<DebugPortLease>,
}

/// Runtime counters reported by [`Pool::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub pending_tasks: usize,
    pub active_tasks: usize,
}

/// The worker pool. Cloning a `Pool` shares the same underlying queue and
/// worker set (it is an `Arc`-backed handle), so a `proxy()` or a task
/// spawned to watch the pool can hold one independently of the owner.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<Inner>>,
    opts: ResolvedPoolOptions,
    registry: Registry,
    register_options: RegisterOptions,
}

struct Inner {
    workers: Vec<LiveWorker>,
    tasks: VecDeque<QueuedTask>,
    terminated: bool,
}

impl Pool {
    /// Builds a pool, validating `options` and eagerly spawning
    /// `min_workers` workers.
    pub async fn new(options: PoolOptions, registry: Registry, register_options: RegisterOptions) -> Result<Self, PoolError> {
        let opts = options.build()?;
        let pool = Self {
            inner: Arc::new(Mutex::new(Inner {
                workers: Vec::new(),
                tasks: VecDeque::new(),
                terminated: false,
            })),
            opts,
            registry,
            register_options,
        };

        {
            let mut inner = pool.inner.lock().await;
            for _ in 0..pool.opts.min_workers {
                let worker = pool.spawn_worker()?;
                inner.workers.push(worker);
            }
        }

        Ok(pool)
    }

    fn spawn_worker(&self) -> Result<LiveWorker, PoolError> {
        if let Some(cb) = &self.opts.on_create_worker {
            cb();
        }

        let debug_port = Some(lease(self.opts.debug_port_start));

        let handle = match self.opts.worker_kind {
            WorkerKind::Thread => {
                WorkerHandle::spawn_thread(self.registry.clone(), self.register_options.clone(), &self.opts)
            }
            WorkerKind::Process => WorkerHandle::spawn_process(&self.opts)?,
        };

        if let Some(cb) = &self.opts.on_created_worker {
            cb();
        }

        info!(kind = ?self.opts.worker_kind, "spawned worker");
        Ok(LiveWorker {
            handle,
            _debug_port: debug_port,
        })
    }

    /// Submits a task. Returns immediately with a [`TaskHandle`]; the task
    /// is enqueued and dispatched as soon as a worker is free.
    #[instrument(skip(self, method, params, options))]
    pub async fn exec(&self, method: impl Into<Method>, params: Vec<Value>, options: ExecOptions) -> Result<TaskHandle, PoolError> {
        let method = method.into();
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return Err(PoolError::PoolTerminated);
        }
        if let Some(max) = self.opts.max_queue_size {
            if inner.tasks.len() >= max {
                return Err(PoolError::QueueFull(max));
            }
        }

        let (resolver, result_rx) = tokio::sync::oneshot::channel();
        let control = crate::future::CancelControl::new();
        let task_handle = TaskHandle::new(result_rx, control.clone());

        inner.tasks.push_back(QueuedTask {
            method,
            params,
            options,
            resolver,
            control,
        });

        self.dispatch(&mut inner)?;
        Ok(task_handle)
    }

    /// Assigns queued tasks to idle (or freshly spawned) workers until
    /// either the queue drains or no worker is available. Mirrors the
    /// original dispatcher's behaviour of checking exactly one
    /// idle-or-spawnable worker per queued task rather than looking ahead;
    /// under pathological arrival patterns this can leave a task queued
    /// slightly longer than strictly necessary even though a new worker
    /// could technically be spawned for it. This is intentional, not a bug
    /// this implementation tries to hide.
    fn dispatch(&self, inner: &mut Inner) -> Result<(), PoolError> {
        self.reap_and_replace_crashed_workers(inner)?;

        loop {
            let Some(task) = inner.tasks.front() else { break };
            let _ = task;

            let worker_index = inner.workers.iter().position(|w| !w.handle.busy() && !w.handle.terminated());
            let worker_index = match worker_index {
                Some(i) => Some(i),
                None if inner.workers.len() < self.opts.max_workers => {
                    let worker = self.spawn_worker()?;
                    inner.workers.push(worker);
                    Some(inner.workers.len() - 1)
                }
                None => None,
            };

            let Some(worker_index) = worker_index else { break };

            let task = inner.tasks.pop_front().expect("checked front above");
            if task.resolver.is_closed() {
                debug!("dropping task whose caller already lost interest");
                continue;
            }

            let worker = &inner.workers[worker_index];
            task.control.mark_dispatched();
            let _ = worker
                .handle
                .exec(task.method, task.params, task.options, task.resolver, task.control);
        }
        Ok(())
    }

    /// Drops workers whose endpoint has already exited (crashed or was
    /// torn down by the cleanup handshake) and tops the pool back up to
    /// `min_workers` if the crash left it short. In-flight tasks on a
    /// crashed worker are already rejected by its actor loop before
    /// `terminated()` goes true, so dropping the dead entry here is just
    /// bookkeeping, not an error path.
    fn reap_and_replace_crashed_workers(&self, inner: &mut Inner) -> Result<(), PoolError> {
        let before = inner.workers.len();
        inner.workers.retain(|w| !w.handle.terminated());
        if inner.workers.len() < before {
            warn!(dropped = before - inner.workers.len(), "reaped crashed or terminated workers");
        }

        while inner.workers.len() < self.opts.min_workers {
            let worker = self.spawn_worker()?;
            inner.workers.push(worker);
        }
        Ok(())
    }

    /// Current worker/queue counters. A worker that crashed since the last
    /// `exec` call is not yet reaped (that only happens on dispatch) but is
    /// excluded here rather than miscounted as idle.
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let live = inner.workers.iter().filter(|w| !w.handle.terminated());
        let total = live.clone().count();
        let busy = live.filter(|w| w.handle.busy()).count();
        PoolStats {
            total_workers: total,
            busy_workers: busy,
            idle_workers: total - busy,
            pending_tasks: inner.tasks.len(),
            active_tasks: busy,
        }
    }

    /// Terminates every worker. Queued tasks are rejected immediately;
    /// in-flight tasks are rejected (`force`) or allowed to drain first.
    pub async fn terminate(&self, force: bool) {
        let mut inner = self.inner.lock().await;
        inner.terminated = true;
        for task in inner.tasks.drain(..) {
            let _ = task.resolver.send(Err(crate::error::WorkerError::Terminated));
        }

        let workers = std::mem::take(&mut inner.workers);
        drop(inner);
        let handles: Vec<_> = workers.iter().map(|w| w.handle.terminate(force)).collect();
        futures_util::future::join_all(handles).await;
        if let Some(cb) = &self.opts.on_terminate_worker {
            cb();
        }
        warn!("pool terminated");
    }

    /// A thin ergonomic wrapper exposing `call(method, params)`. There is
    /// no compile-time method list to generate real per-method bindings
    /// from, since the registry lives inside the worker.
    pub fn proxy(&self) -> PoolProxy {
        PoolProxy { pool: self.clone() }
    }
}

/// See [`Pool::proxy`].
#[derive(Clone)]
pub struct PoolProxy {
    pool: Pool,
}

impl PoolProxy {
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<TaskHandle, PoolError> {
        self.pool.exec(method, params, ExecOptions::default()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::WorkerError;
    use crate::registry::Registry;

    use super::*;

    fn echo_registry() -> Registry {
        Registry::builder()
            .method("echo", |params, _ctx| Ok(params.first().cloned().unwrap_or(Value::Null)))
            .async_method("sleep_then_echo", |params, ctx| async move {
                let millis = params.first().and_then(|v| v.as_u64()).unwrap_or(0);
                for _ in 0..millis / 10 {
                    if ctx.is_aborted() {
                        return Err(WorkerError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(params.get(1).cloned().unwrap_or(Value::Null))
            })
            .build()
    }

    async fn thread_pool(max_workers: usize) -> Pool {
        let options = PoolOptions {
            max_workers: Some(max_workers),
            worker_kind: WorkerKind::Thread.into(),
            ..Default::default()
        };
        Pool::new(options, echo_registry(), RegisterOptions::default())
            .await
            .expect("pool should start")
    }

    #[tokio::test]
    async fn exec_round_trips_a_value() {
        let pool = thread_pool(1).await;
        let result = pool
            .exec("echo", vec![Value::from("hello")], ExecOptions::default())
            .await
            .expect("accepted")
            .await
            .expect("completes");
        assert_eq!(result, Value::from("hello"));
        pool.terminate(false).await;
    }

    #[tokio::test]
    async fn unknown_method_surfaces_as_remote_error() {
        let pool = thread_pool(1).await;
        let err = pool
            .exec("no_such_method", vec![], ExecOptions::default())
            .await
            .expect("accepted")
            .await
            .expect_err("should fail");
        assert!(matches!(err, WorkerError::Remote(_)));
        pool.terminate(false).await;
    }

    #[tokio::test]
    async fn cancel_resolves_to_cancelled() {
        let pool = thread_pool(1).await;
        let task = pool
            .exec("sleep_then_echo", vec![Value::from(500), Value::from("late")], ExecOptions::default())
            .await
            .expect("accepted");
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.cancel();
        let err = task.await.expect_err("should be cancelled");
        assert!(matches!(err, WorkerError::Cancelled));
        pool.terminate(false).await;
    }

    #[tokio::test]
    async fn queue_wait_does_not_consume_a_late_bound_timeout() {
        // One worker. Task A occupies it for 200ms. Task B is queued behind
        // it with a 500ms timeout set immediately (before A finishes) — the
        // timeout must only start counting once B is actually dispatched,
        // so B should complete even though it waited ~200ms in queue first.
        let pool = thread_pool(1).await;

        let task_a = pool
            .exec("sleep_then_echo", vec![Value::from(200), Value::from("a")], ExecOptions::default())
            .await
            .expect("accepted");
        let task_b = pool
            .exec("sleep_then_echo", vec![Value::from(50), Value::from("b")], ExecOptions::default())
            .await
            .expect("accepted");
        task_b.timeout(Duration::from_millis(500));

        let result_a = task_a.await.expect("a completes");
        let result_b = task_b.await.expect("b completes despite queueing behind a");
        assert_eq!(result_a, Value::from("a"));
        assert_eq!(result_b, Value::from("b"));

        pool.terminate(false).await;
    }

    #[tokio::test]
    async fn dispatch_spawns_workers_on_demand_up_to_max() {
        let pool = thread_pool(2).await;
        let a = pool
            .exec("sleep_then_echo", vec![Value::from(100), Value::from("a")], ExecOptions::default())
            .await
            .expect("accepted");
        let b = pool
            .exec("sleep_then_echo", vec![Value::from(100), Value::from("b")], ExecOptions::default())
            .await
            .expect("accepted");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.busy_workers, 2);

        a.await.unwrap();
        b.await.unwrap();
        pool.terminate(false).await;
    }

    #[tokio::test]
    async fn terminated_pool_rejects_new_tasks() {
        let pool = thread_pool(1).await;
        pool.terminate(false).await;
        let result = pool.exec("echo", vec![], ExecOptions::default()).await;
        assert!(matches!(result, Err(PoolError::PoolTerminated)));
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let options = PoolOptions {
            max_workers: Some(1),
            max_queue_size: Some(1),
            worker_kind: WorkerKind::Thread.into(),
            ..Default::default()
        };
        let pool = Pool::new(options, echo_registry(), RegisterOptions::default())
            .await
            .expect("pool should start");

        let _occupies_worker = pool
            .exec("sleep_then_echo", vec![Value::from(200), Value::Null], ExecOptions::default())
            .await
            .expect("accepted");
        let _fills_queue = pool
            .exec("sleep_then_echo", vec![Value::from(200), Value::Null], ExecOptions::default())
            .await
            .expect("accepted");

        let rejected = pool.exec("echo", vec![], ExecOptions::default()).await;
        assert!(matches!(rejected, Err(PoolError::QueueFull(1))));

        pool.terminate(true).await;
    }
}
