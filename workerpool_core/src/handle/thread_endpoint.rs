/*!
 * A worker endpoint backed by a dedicated OS thread inside this process.
 *
 * Grounded on the background-thread pattern the pack already uses for a
 * single-purpose worker (spawn once, drive it with a channel, join on
 * teardown) — generalized here to run the full worker message loop
 * instead of one fixed job, and to carry an inner single-threaded Tokio
 * runtime so registered methods can themselves be `async`.
 */
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::WorkerError;
use crate::options::RegisterOptions;
use crate::protocol::{Inbound, Outbound};
use crate::registry::Registry;
use crate::worker_runtime;

use super::endpoint::{BoxFuture, ExitInfo, WorkerEndpoint};

pub(crate) struct ThreadEndpoint {
    to_worker: mpsc::UnboundedSender<Outbound>,
    from_worker: mpsc::UnboundedReceiver<Inbound>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl ThreadEndpoint {
    pub fn spawn(registry: Registry, options: RegisterOptions) -> Self {
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
        let (from_worker_tx, from_worker_rx) = mpsc::unbounded_channel();

        let join = std::thread::Builder::new()
            .name("workerpool-worker".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("failed to build in-process worker runtime");
                rt.block_on(worker_runtime::run(registry, options, to_worker_rx, from_worker_tx));
            })
            .expect("failed to spawn worker thread");

        Self {
            to_worker: to_worker_tx,
            from_worker: from_worker_rx,
            join: Some(join),
        }
    }
}

impl WorkerEndpoint for ThreadEndpoint {
    fn send(&mut self, msg: Outbound) -> Result<(), WorkerError> {
        self.to_worker
            .send(msg)
            .map_err(|_| WorkerError::Io("worker thread channel closed".into()))
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Inbound>> {
        let rx = &mut self.from_worker;
        Box::pin(async move { rx.recv().await })
    }

    fn kill(&mut self) -> BoxFuture<'_, ()> {
        let join = self.join.take();
        Box::pin(async move {
            if let Some(join) = join {
                let _ = tokio::task::spawn_blocking(move || join.join()).await;
            }
        })
    }

    fn try_exit_status(&mut self) -> Option<ExitInfo> {
        match &self.join {
            Some(j) if j.is_finished() => Some(ExitInfo::default()),
            Some(_) => None,
            None => Some(ExitInfo::default()),
        }
    }

    fn exe_descriptor(&self) -> PathBuf {
        PathBuf::from("<in-process thread>")
    }
}
