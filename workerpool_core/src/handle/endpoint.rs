/*!
 * The transport seam a `WorkerHandle` drives: something that accepts
 * `Outbound` messages and yields `Inbound` ones, regardless of whether the
 * other end is a thread in this process or a freshly exec'd child.
 */
use std::path::PathBuf;

use crate::error::WorkerError;
use crate::protocol::{Inbound, Outbound};

pub(crate) type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Exit information recovered after an endpoint has gone away
/// unexpectedly (i.e. its inbound stream closed without a prior graceful
/// `TERMINATE`).
#[derive(Debug, Clone, Default)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

pub(crate) trait WorkerEndpoint: Send {
    /// Enqueues a message for delivery. Non-blocking; delivery itself
    /// happens on a background task/thread owned by the endpoint.
    fn send(&mut self, msg: Outbound) -> Result<(), WorkerError>;

    /// Awaits the next inbound message. Resolves to `None` once the
    /// endpoint's inbound stream has closed (graceful exit or crash).
    fn recv(&mut self) -> BoxFuture<'_, Option<Inbound>>;

    /// Forcibly tears the endpoint down (kills the thread/process and
    /// waits for it to finish).
    fn kill(&mut self) -> BoxFuture<'_, ()>;

    /// Best-effort exit status, available once the endpoint has actually
    /// exited. Used to build `WorkerError::Crashed` when `recv` closes
    /// without a preceding graceful terminate.
    fn try_exit_status(&mut self) -> Option<ExitInfo> {
        None
    }

    /// A human-readable descriptor of what this endpoint is running,
    /// attached to crash errors.
    fn exe_descriptor(&self) -> PathBuf;
}
