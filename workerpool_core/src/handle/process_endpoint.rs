/*!
 * A worker endpoint backed by a freshly spawned OS process, re-executing
 * the current binary (or a configured one) with a reserved environment
 * variable set.
 *
 * Grounded on the re-exec worker-process pattern (spawn the same
 * executable, flag the child via an env var, reconnect over a pipe);
 * adapted from a dedicated IPC-channel crate to plain NDJSON over the
 * child's stdin/stdout, one JSON object per line, since that keeps the
 * transport to crates already in this workspace.
 */
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::WorkerError;
use crate::protocol::{Inbound, Outbound};

use super::endpoint::{BoxFuture, ExitInfo, WorkerEndpoint};

/// Set to `"1"` in a worker child's environment. Checked by
/// [`crate::process_bootstrap::maybe_enter_worker`].
pub const WORKER_ENV_FLAG: &str = "WORKERPOOL_WORKER";

pub(crate) struct ProcessEndpoint {
    child: Child,
    to_worker: mpsc::UnboundedSender<String>,
    from_worker: mpsc::UnboundedReceiver<Inbound>,
    exe: PathBuf,
    _writer: tokio::task::JoinHandle<()>,
    _reader: tokio::task::JoinHandle<()>,
}

impl ProcessEndpoint {
    pub fn spawn(
        exe: PathBuf,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self, WorkerError> {
        let mut cmd = Command::new(&exe);
        cmd.args(args)
            .env(WORKER_ENV_FLAG, "1")
            .envs(env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Io(format!("failed to spawn worker process at {exe:?}: {e}")))?;

        let mut stdin = child.stdin.take().expect("configured with Stdio::piped");
        let stdout = child.stdout.take().expect("configured with Stdio::piped");

        let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(line) = to_worker_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let (from_worker_tx, from_worker_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Inbound>(&line) {
                            Ok(msg) => {
                                if from_worker_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("malformed message from worker process, ignoring: {e}");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("error reading from worker process stdout: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child,
            to_worker: to_worker_tx,
            from_worker: from_worker_rx,
            exe,
            _writer: writer,
            _reader: reader,
        })
    }
}

impl WorkerEndpoint for ProcessEndpoint {
    fn send(&mut self, msg: Outbound) -> Result<(), WorkerError> {
        let line = serde_json::to_string(&msg).map_err(|e| WorkerError::Io(e.to_string()))?;
        self.to_worker
            .send(line)
            .map_err(|_| WorkerError::Io("worker process stdin closed".into()))
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Inbound>> {
        let rx = &mut self.from_worker;
        Box::pin(async move { rx.recv().await })
    }

    fn kill(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        })
    }

    fn try_exit_status(&mut self) -> Option<ExitInfo> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(ExitInfo {
                exit_code: status.code(),
                #[cfg(unix)]
                signal: {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                },
                #[cfg(not(unix))]
                signal: None,
            }),
            _ => None,
        }
    }

    fn exe_descriptor(&self) -> PathBuf {
        self.exe.clone()
    }
}
