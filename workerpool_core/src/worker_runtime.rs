/*!
 * The worker-side message loop. Transport-agnostic: both the thread
 * endpoint and the process endpoint feed it `Outbound` messages through an
 * `mpsc` channel and drain `Inbound` responses from another, so this is
 * the one place method dispatch, `CLEANUP`, and `TERMINATE` are handled.
 *
 * A registered method runs in its own `tokio::spawn`ed task rather than
 * inline in this loop. The pool never dispatches a second call to a busy
 * worker, so in practice at most one such task is ever running — but
 * keeping method execution off this loop means a `CLEANUP` for that same
 * task can still be received and acted on while it runs.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SerializedError;
use crate::options::RegisterOptions;
use crate::protocol::{Inbound, Outbound, CLEANUP_METHOD};
use crate::registry::{AbortListener, Registry, WorkerContext};

/// Drives one worker's entire lifetime: sends `Ready`, dispatches calls,
/// handles `CLEANUP`/`TERMINATE`, and returns once `TERMINATE` is
/// processed or the inbound channel closes.
pub async fn run(
    registry: Registry,
    options: RegisterOptions,
    mut inbound: mpsc::UnboundedReceiver<Outbound>,
    outbound: mpsc::UnboundedSender<Inbound>,
) {
    let registry = Arc::new(registry);
    let abort_listeners: Arc<Mutex<HashMap<u32, Vec<AbortListener>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let running: Arc<Mutex<HashMap<u32, Arc<AtomicBool>>>> = Arc::new(Mutex::new(HashMap::new()));

    let emit = {
        let outbound = outbound.clone();
        Arc::new(move |id: u32, payload: serde_json::Value| {
            let _ = outbound.send(Inbound::Event { id, payload });
        }) as Arc<dyn Fn(u32, serde_json::Value) + Send + Sync>
    };

    let register_abort_listener = {
        let abort_listeners = abort_listeners.clone();
        Arc::new(move |id: u32, listener: AbortListener| {
            abort_listeners.lock().unwrap().entry(id).or_default().push(listener);
        }) as Arc<dyn Fn(u32, AbortListener) + Send + Sync>
    };

    if outbound.send(Inbound::Ready).is_err() {
        return;
    }

    while let Some(msg) = inbound.recv().await {
        match msg {
            Outbound::Terminate => {
                debug!("worker received terminate signal");
                if let Some(handler) = registry.termination_handler.clone() {
                    handler(0).await;
                }
                break;
            }
            Outbound::Call(req) if req.method == CLEANUP_METHOD => {
                handle_cleanup(req.id, &options, &abort_listeners, &running, &outbound).await;
            }
            Outbound::Call(req) => {
                let Some(method) = registry.get(&req.method).cloned() else {
                    let _ = outbound.send(Inbound::Error {
                        id: req.id,
                        error: SerializedError::new(
                            "UnknownMethod",
                            format!("no method named {:?} is registered", req.method),
                        )
                        .with_property("method", req.method.clone()),
                    });
                    continue;
                };

                let aborted_flag = Arc::new(AtomicBool::new(false));
                running.lock().unwrap().insert(req.id, aborted_flag.clone());

                let ctx = WorkerContext {
                    task_id: req.id,
                    aborted: aborted_flag,
                    emit: emit.clone(),
                    register_abort_listener: register_abort_listener.clone(),
                };

                let outbound = outbound.clone();
                let abort_listeners = abort_listeners.clone();
                let running = running.clone();
                let id = req.id;
                let params = req.params;

                tokio::spawn(async move {
                    let join = tokio::spawn(async move { method(&params, &ctx).await });
                    let outcome = join.await;
                    abort_listeners.lock().unwrap().remove(&id);
                    running.lock().unwrap().remove(&id);

                    let response = match outcome {
                        Ok(Ok(value)) => Inbound::Result { id, result: value },
                        Ok(Err(err)) => Inbound::Error {
                            id,
                            error: serialize_worker_error(&err),
                        },
                        Err(join_err) if join_err.is_panic() => {
                            let message = panic_message(join_err);
                            Inbound::Error {
                                id,
                                error: SerializedError::new("Panic", message),
                            }
                        }
                        Err(_) => Inbound::Error {
                            id,
                            error: SerializedError::new("Aborted", "method task was aborted"),
                        },
                    };
                    let _ = outbound.send(response);
                });
            }
        }
    }
}

async fn handle_cleanup(
    id: u32,
    options: &RegisterOptions,
    abort_listeners: &Arc<Mutex<HashMap<u32, Vec<AbortListener>>>>,
    running: &Arc<Mutex<HashMap<u32, Arc<AtomicBool>>>>,
    outbound: &mpsc::UnboundedSender<Inbound>,
) {
    // `Call` for `id` is always processed before `Cleanup` for the same id
    // (both travel the same ordered inbound channel), so the flag is always
    // present here; flip it so `WorkerContext::is_aborted` observes it.
    if let Some(flag) = running.lock().unwrap().get(&id) {
        flag.store(true, Ordering::Relaxed);
    }
    let listeners = abort_listeners.lock().unwrap().remove(&id).unwrap_or_default();

    if listeners.is_empty() {
        let _ = outbound.send(Inbound::ControlAck {
            id,
            error: Some(SerializedError::new(
                "WorkerTerminating",
                "no abort listener registered for this task, worker will be terminated",
            )),
        });
        return;
    }

    let run_all = join_all(listeners.iter().map(|listener| listener()));
    match tokio::time::timeout(options.abort_listener_timeout(), run_all).await {
        Ok(results) => {
            if let Some(err) = results.into_iter().find_map(|r| r.err()) {
                warn!(task_id = id, "abort listener failed");
                let _ = outbound.send(Inbound::ControlAck {
                    id,
                    error: Some(serialize_worker_error(&err)),
                });
            } else {
                let _ = outbound.send(Inbound::ControlAck { id, error: None });
            }
        }
        Err(_) => {
            warn!(task_id = id, "abort listeners timed out");
            let _ = outbound.send(Inbound::ControlAck {
                id,
                error: Some(SerializedError::new(
                    "TimeoutError",
                    "abort listeners did not complete before abort_listener_timeout",
                )),
            });
        }
    }
}

fn serialize_worker_error(err: &crate::error::WorkerError) -> SerializedError {
    match err {
        crate::error::WorkerError::Remote(serialized) => serialized.clone(),
        other => SerializedError::new(error_name(other), other.to_string()),
    }
}

fn error_name(err: &crate::error::WorkerError) -> &'static str {
    use crate::error::WorkerError::*;
    match err {
        Remote(_) => "Error",
        UnknownMethod(_) => "UnknownMethod",
        FnOnProcessWorker => "FnOnProcessWorker",
        Cancelled => "Cancelled",
        TimedOut(_) => "TimedOut",
        Terminated => "Terminated",
        Crashed { .. } => "Crashed",
        CleanupTimedOut => "CleanupTimedOut",
        Io(_) => "IoError",
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    err.try_into_panic()
        .ok()
        .and_then(|p| {
            p.downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| p.downcast_ref::<String>().cloned())
        })
        .unwrap_or_else(|| "worker method panicked".to_string())
}
