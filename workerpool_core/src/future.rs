/*!
 * The caller-facing future returned by `Pool::exec` / `WorkerHandle::exec`,
 * plus the late-binding timeout machinery described in the design notes:
 * calling `.timeout(d)` on a task that is still sitting in the queue does
 * not start the clock until the task is actually dispatched to a worker,
 * so queue-wait time never eats into a task's deadline.
 */
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;

#[derive(Default)]
pub(crate) enum CancelReason {
    #[default]
    None,
    Cancelled,
    TimedOut(Duration),
}

impl CancelReason {
    pub(crate) fn into_error(self) -> WorkerError {
        match self {
            CancelReason::None | CancelReason::Cancelled => WorkerError::Cancelled,
            CancelReason::TimedOut(d) => WorkerError::TimedOut(d),
        }
    }
}

#[derive(Default)]
struct TimeoutShared {
    dispatched: AtomicBool,
    pending_duration: Mutex<Option<Duration>>,
}

/// Shared between a `TaskHandle` and the queue/worker-side `Task` it
/// corresponds to. Lets either side observe/trigger cancellation and lets
/// the dispatcher arm a timeout that was requested before dispatch.
#[derive(Clone)]
pub(crate) struct CancelControl {
    pub(crate) token: CancellationToken,
    reason: Arc<Mutex<CancelReason>>,
    timeout: Arc<TimeoutShared>,
}

impl CancelControl {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(CancelReason::None)),
            timeout: Arc::new(TimeoutShared::default()),
        }
    }

    pub(crate) fn take_reason(&self) -> CancelReason {
        std::mem::take(&mut *self.reason.lock().unwrap())
    }

    fn cancel_with(&self, reason: CancelReason) {
        *self.reason.lock().unwrap() = reason;
        self.token.cancel();
    }

    fn spawn_timer(&self, duration: Duration) {
        let control = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if !control.token.is_cancelled() {
                control.cancel_with(CancelReason::TimedOut(duration));
            }
        });
    }

    /// Called once, by the dispatcher, at the moment a task is handed to a
    /// worker. Arms any timeout duration requested while the task was
    /// still queued.
    pub(crate) fn mark_dispatched(&self) {
        self.timeout.dispatched.store(true, Ordering::Release);
        if let Some(d) = self.timeout.pending_duration.lock().unwrap().take() {
            self.spawn_timer(d);
        }
    }
}

/// A pending task. Implements `Future` so it can be `.await`ed directly;
/// also exposes `cancel`/`timeout` for explicit control.
pub struct TaskHandle {
    result_rx: oneshot::Receiver<Result<Value, WorkerError>>,
    control: CancelControl,
}

impl TaskHandle {
    pub(crate) fn new(
        result_rx: oneshot::Receiver<Result<Value, WorkerError>>,
        control: CancelControl,
    ) -> Self {
        Self { result_rx, control }
    }

    /// Requests cancellation. The worker is given a chance to run its
    /// registered abort listeners before being destroyed; either way this
    /// task ultimately resolves to `Err(WorkerError::Cancelled)`.
    pub fn cancel(&self) {
        self.control.cancel_with(CancelReason::Cancelled);
    }

    /// Bounds how long this task may take from the moment it is dispatched
    /// to a worker (not from the moment this is called). If the task is
    /// still queued, the duration is recorded and the timer starts at
    /// dispatch time.
    pub fn timeout(&self, duration: Duration) {
        if self.control.timeout.dispatched.load(Ordering::Acquire) {
            self.control.spawn_timer(duration);
        } else {
            *self.control.timeout.pending_duration.lock().unwrap() = Some(duration);
        }
    }
}

impl Future for TaskHandle {
    type Output = Result<Value, WorkerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.result_rx).poll(cx).map(|r| match r {
            Ok(inner) => inner,
            Err(_) => Err(WorkerError::Terminated),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_resolver_surfaces_as_terminated() {
        let control = CancelControl::new();
        let (resolver, result_rx) = oneshot::channel();
        let handle = TaskHandle::new(result_rx, control);
        drop(resolver);

        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut handle = Box::pin(handle);
        match handle.as_mut().poll(&mut cx) {
            Poll::Ready(Err(WorkerError::Terminated)) => {}
            other => panic!("expected Terminated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_set_before_dispatch_does_not_fire_until_marked_dispatched() {
        let control = CancelControl::new();
        let (_resolver, result_rx) = oneshot::channel();
        let handle = TaskHandle::new(result_rx, control.clone());

        handle.timeout(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!control.token.is_cancelled());
    }

    #[tokio::test]
    async fn timeout_set_before_dispatch_fires_after_marking_dispatched() {
        let control = CancelControl::new();
        let (_resolver, result_rx) = oneshot::channel();
        let handle = TaskHandle::new(result_rx, control.clone());

        handle.timeout(Duration::from_millis(10));
        control.mark_dispatched();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(control.token.is_cancelled());
    }

    #[test]
    fn cancel_records_reason_and_cancels_token() {
        let control = CancelControl::new();
        let (_resolver, result_rx) = oneshot::channel();
        let handle = TaskHandle::new(result_rx, control.clone());

        handle.cancel();
        assert!(control.token.is_cancelled());
        assert!(matches!(control.take_reason(), CancelReason::Cancelled));
    }
}
