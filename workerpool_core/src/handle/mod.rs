/*!
 * `WorkerHandle` — owns one worker endpoint and drives its lifecycle: the
 * request/response protocol, event dispatch, the cancellation/cleanup
 * handshake, and graceful/forced termination.
 *
 * The state machine itself runs as a dedicated actor task (spawned by
 * [`WorkerHandle::spawn_thread`]/[`WorkerHandle::spawn_process`]); the
 * `WorkerHandle` value handed to [`crate::pool::Pool`] is just a command
 * sender plus a pair of atomics the pool can poll synchronously without an
 * async round trip.
 */
mod endpoint;
mod process_endpoint;
mod thread_endpoint;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::WorkerError;
use crate::future::CancelControl;
use crate::options::{ExecOptions, RegisterOptions, ResolvedPoolOptions, WorkerKind};
use crate::protocol::{Inbound, Outbound, Request, CLEANUP_METHOD};
use crate::registry::Registry;

use endpoint::{ExitInfo, WorkerEndpoint};
pub(crate) use process_endpoint::WORKER_ENV_FLAG;
use process_endpoint::ProcessEndpoint;
use thread_endpoint::ThreadEndpoint;

/// What `Pool::exec` dispatches: either a method registered by name in the
/// worker, or (thread workers only) a plain function item run in-process.
#[derive(Clone)]
pub enum Method {
    Named(String),
    Fn(fn(&[Value]) -> Result<Value, WorkerError>),
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Method::Named(name.to_string())
    }
}

impl From<String> for Method {
    fn from(name: String) -> Self {
        Method::Named(name)
    }
}

struct InFlight {
    resolver: oneshot::Sender<Result<Value, WorkerError>>,
    on_event: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    control: CancelControl,
}

enum ActorCommand {
    Exec {
        method: Method,
        params: Vec<Value>,
        resolver: oneshot::Sender<Result<Value, WorkerError>>,
        on_event: Option<Arc<dyn Fn(Value) + Send + Sync>>,
        control: CancelControl,
    },
    Terminate {
        force: bool,
        done: oneshot::Sender<()>,
    },
}

enum Internal {
    FnDone { id: u32, result: Result<Value, WorkerError> },
    CancelRequested { id: u32 },
    CleanupDeadline { id: u32 },
}

#[derive(Default)]
struct WorkerStatus {
    busy: AtomicBool,
    terminated: AtomicBool,
}

/// Controller-side handle to one worker. Deliberately not `Clone`: a
/// worker has exactly one owner, the pool's worker list.
pub(crate) struct WorkerHandle {
    cmd_tx: mpsc::UnboundedSender<ActorCommand>,
    status: Arc<WorkerStatus>,
}

impl WorkerHandle {
    pub fn spawn_thread(registry: Registry, register_options: RegisterOptions, opts: &ResolvedPoolOptions) -> Self {
        let endpoint = ThreadEndpoint::spawn(registry, register_options);
        Self::spawn_with_endpoint(Box::new(endpoint), opts.worker_terminate_timeout, WorkerKind::Thread)
    }

    pub fn spawn_process(opts: &ResolvedPoolOptions) -> Result<Self, WorkerError> {
        let exe = opts
            .worker_exe
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .ok_or_else(|| WorkerError::Io("could not resolve worker executable path".into()))?;
        let endpoint = ProcessEndpoint::spawn(exe, &opts.worker_args, &opts.worker_env)?;
        Ok(Self::spawn_with_endpoint(
            Box::new(endpoint),
            opts.worker_terminate_timeout,
            WorkerKind::Process,
        ))
    }

    fn spawn_with_endpoint(
        endpoint: Box<dyn WorkerEndpoint>,
        worker_terminate_timeout: Duration,
        kind: WorkerKind,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let status = Arc::new(WorkerStatus::default());
        tokio::spawn(actor_loop(endpoint, cmd_rx, status.clone(), worker_terminate_timeout, kind));
        Self { cmd_tx, status }
    }

    pub fn busy(&self) -> bool {
        self.status.busy.load(Ordering::Acquire)
    }

    pub fn terminated(&self) -> bool {
        self.status.terminated.load(Ordering::Acquire)
    }

    /// Hands a task to this worker. `resolver`/`control` are owned by the
    /// caller (the pool) — this lets the pool-facing `TaskHandle` it
    /// already returned to its caller observe cancellation/timeout that
    /// the worker's actor loop reacts to, instead of the handle and the
    /// pool each tracking their own, disconnected cancellation state.
    pub fn exec(
        &self,
        method: Method,
        params: Vec<Value>,
        options: ExecOptions,
        resolver: oneshot::Sender<Result<Value, WorkerError>>,
        control: CancelControl,
    ) -> Result<(), WorkerError> {
        if self.terminated() {
            let _ = resolver.send(Err(WorkerError::Terminated));
            return Err(WorkerError::Terminated);
        }
        self.cmd_tx
            .send(ActorCommand::Exec {
                method,
                params,
                resolver,
                on_event: options.on_event,
                control,
            })
            .map_err(|_| WorkerError::Terminated)
    }

    pub async fn terminate(&self, force: bool) {
        let (done, done_rx) = oneshot::channel();
        if self.cmd_tx.send(ActorCommand::Terminate { force, done }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn actor_loop(
    mut endpoint: Box<dyn WorkerEndpoint>,
    mut cmd_rx: mpsc::UnboundedReceiver<ActorCommand>,
    status: Arc<WorkerStatus>,
    worker_terminate_timeout: Duration,
    kind: WorkerKind,
) {
    let mut next_id: u32 = 1;
    let mut ready = false;
    let mut request_queue: VecDeque<Outbound> = VecDeque::new();
    let mut processing: HashMap<u32, InFlight> = HashMap::new();
    let mut tracking: HashMap<u32, InFlight> = HashMap::new();
    let mut terminating = false;
    let mut cleaning = false;
    let mut pending_terminate_done: Option<oneshot::Sender<()>> = None;

    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break,
                    Some(ActorCommand::Exec { method, params, resolver, on_event, control }) => {
                        let id = next_id;
                        next_id = next_id.wrapping_add(1);

                        match method {
                            Method::Fn(f) => {
                                if kind != WorkerKind::Thread {
                                    let _ = resolver.send(Err(WorkerError::FnOnProcessWorker));
                                    continue;
                                }
                                processing.insert(id, InFlight { resolver, on_event, control });
                                let tx = internal_tx.clone();
                                tokio::spawn(async move {
                                    let result = f(&params);
                                    let _ = tx.send(Internal::FnDone { id, result });
                                });
                            }
                            Method::Named(name) => {
                                let token = control.token.clone();
                                processing.insert(id, InFlight { resolver, on_event, control });

                                let cancel_tx = internal_tx.clone();
                                tokio::spawn(async move {
                                    token.cancelled().await;
                                    let _ = cancel_tx.send(Internal::CancelRequested { id });
                                });

                                let req = Outbound::Call(Request { id, method: name, params });
                                if ready {
                                    if let Err(e) = endpoint.send(req) {
                                        if let Some(entry) = processing.remove(&id) {
                                            let _ = entry.resolver.send(Err(e));
                                        }
                                    }
                                } else {
                                    request_queue.push_back(req);
                                }
                            }
                        }
                    }
                    Some(ActorCommand::Terminate { force, done }) => {
                        if force {
                            for (_, entry) in processing.drain() {
                                let _ = entry.resolver.send(Err(WorkerError::Terminated));
                            }
                            for (_, entry) in tracking.drain() {
                                let _ = entry.resolver.send(Err(WorkerError::Terminated));
                            }
                        }
                        if processing.is_empty() {
                            cleaning = true;
                            if ready {
                                let _ = endpoint.send(Outbound::Terminate);
                            } else {
                                request_queue.push_back(Outbound::Terminate);
                            }
                            tokio::time::timeout(worker_terminate_timeout, endpoint.kill()).await.ok();
                            status.terminated.store(true, Ordering::Release);
                            let _ = done.send(());
                            return;
                        } else {
                            terminating = true;
                            pending_terminate_done = Some(done);
                        }
                    }
                }
            }

            wire = endpoint.recv() => {
                match wire {
                    None => {
                        if cleaning {
                            status.terminated.store(true, Ordering::Release);
                            if let Some(done) = pending_terminate_done.take() {
                                let _ = done.send(());
                            }
                            return;
                        }
                        let ExitInfo { exit_code, signal } = endpoint.try_exit_status().unwrap_or_default();
                        let crash = WorkerError::Crashed { exit_code, signal, exe: endpoint.exe_descriptor() };
                        for (_, entry) in processing.drain() {
                            let _ = entry.resolver.send(Err(crash.clone()));
                        }
                        for (_, entry) in tracking.drain() {
                            let _ = entry.resolver.send(Err(crash.clone()));
                        }
                        status.terminated.store(true, Ordering::Release);
                        return;
                    }
                    Some(Inbound::Ready) => {
                        ready = true;
                        while let Some(msg) = request_queue.pop_front() {
                            if endpoint.send(msg).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Inbound::Event { id, payload }) => {
                        if let Some(entry) = processing.get(&id) {
                            if let Some(cb) = &entry.on_event {
                                cb(payload);
                            }
                        }
                    }
                    Some(Inbound::ControlAck { id, error }) => {
                        if let Some(entry) = tracking.remove(&id) {
                            let err = entry.control.take_reason().into_error();
                            let _ = entry.resolver.send(Err(err));
                        }
                        if error.is_some() {
                            // No abort listener ran cleanly for this task; the
                            // worker's internal state for it is unknown, so it
                            // cannot be trusted with further work.
                            for (_, e) in processing.drain() {
                                let _ = e.resolver.send(Err(WorkerError::Terminated));
                            }
                            for (_, e) in tracking.drain() {
                                let _ = e.resolver.send(Err(WorkerError::Terminated));
                            }
                            // No Terminate was sent on this path, so the
                            // worker's recv loop is still blocked waiting
                            // for a message; send one so kill()'s join
                            // can't hang forever.
                            let _ = endpoint.send(Outbound::Terminate);
                            tokio::time::timeout(worker_terminate_timeout, endpoint.kill()).await.ok();
                            status.terminated.store(true, Ordering::Release);
                            if let Some(done) = pending_terminate_done.take() {
                                let _ = done.send(());
                            }
                            return;
                        }
                    }
                    Some(Inbound::Result { id, result }) => {
                        if let Some(entry) = processing.remove(&id) {
                            let _ = entry.resolver.send(Ok(result));
                        }
                    }
                    Some(Inbound::Error { id, error }) => {
                        if let Some(entry) = processing.remove(&id) {
                            let unknown_method = error
                                .properties
                                .get("method")
                                .filter(|_| error.name == "UnknownMethod")
                                .and_then(|v| v.as_str())
                                .map(str::to_string);
                            let err = match unknown_method {
                                Some(method) => WorkerError::UnknownMethod(method),
                                None => WorkerError::Remote(error),
                            };
                            let _ = entry.resolver.send(Err(err));
                        }
                    }
                }
            }

            internal = internal_rx.recv() => {
                match internal.expect("internal_tx kept alive by this task") {
                    Internal::FnDone { id, result } => {
                        if let Some(entry) = processing.remove(&id) {
                            let _ = entry.resolver.send(result);
                        }
                    }
                    Internal::CancelRequested { id } => {
                        if let Some(entry) = processing.remove(&id) {
                            if ready {
                                let _ = endpoint.send(Outbound::Call(Request {
                                    id,
                                    method: CLEANUP_METHOD.to_string(),
                                    params: Vec::new(),
                                }));
                            }
                            let deadline_tx = internal_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(worker_terminate_timeout).await;
                                let _ = deadline_tx.send(Internal::CleanupDeadline { id });
                            });
                            tracking.insert(id, entry);
                        }
                    }
                    Internal::CleanupDeadline { id } => {
                        if let Some(entry) = tracking.remove(&id) {
                            let err = entry.control.take_reason().into_error();
                            let _ = entry.resolver.send(Err(err));
                            // The worker itself is unresponsive at this
                            // point (cleanup didn't ack in time), so every
                            // other in-flight task on it is rejected with
                            // the same reason rather than a generic
                            // "terminated".
                            for (_, e) in processing.drain() {
                                let _ = e.resolver.send(Err(WorkerError::CleanupTimedOut));
                            }
                            for (_, e) in tracking.drain() {
                                let _ = e.resolver.send(Err(WorkerError::CleanupTimedOut));
                            }
                            let _ = endpoint.send(Outbound::Terminate);
                            tokio::time::timeout(worker_terminate_timeout, endpoint.kill()).await.ok();
                            status.terminated.store(true, Ordering::Release);
                            if let Some(done) = pending_terminate_done.take() {
                                let _ = done.send(());
                            }
                            return;
                        }
                    }
                }
            }
        }

        status.busy.store(cleaning || !processing.is_empty(), Ordering::Release);

        if terminating && !cleaning && processing.is_empty() {
            cleaning = true;
            if ready {
                let _ = endpoint.send(Outbound::Terminate);
            } else {
                request_queue.push_back(Outbound::Terminate);
            }
        }
    }

    status.terminated.store(true, Ordering::Release);
    if let Some(done) = pending_terminate_done.take() {
        let _ = done.send(());
    }
}
