/*!
 * Entry point for the worker side of a `WorkerKind::Process` pool.
 *
 * Rust has no runtime `eval`/dynamic-import to load an ad hoc worker
 * script the way a packaged default worker script would in a scripting
 * runtime, so the worker logic has to be compiled into the same binary.
 * Call [`maybe_enter_worker`] as the very first thing in `main`: if this
 * process was spawned by a [`crate::pool::Pool`] as a worker child, it
 * registers the given methods and runs the worker loop until
 * `TERMINATE`, then exits the process. Otherwise it returns immediately.
 */
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::handle::WORKER_ENV_FLAG;
use crate::options::RegisterOptions;
use crate::protocol::{Inbound, Outbound};
use crate::registry::Registry;
use crate::worker_runtime;

/// If this process was started as a worker child, builds the registry via
/// `build_registry`, runs the worker message loop over stdin/stdout, and
/// exits with status 0. Otherwise returns immediately and `main` should
/// continue as the controller process.
///
/// Must be called from inside a Tokio runtime (the caller's `#[tokio::main]`).
pub async fn maybe_enter_worker(build_registry: impl FnOnce() -> Registry, options: RegisterOptions) {
    if std::env::var_os(WORKER_ENV_FLAG).is_none() {
        return;
    }

    let registry = build_registry();
    run_over_stdio(registry, options).await;
    std::process::exit(0);
}

async fn run_over_stdio(registry: Registry, options: RegisterOptions) {
    let (to_runtime_tx, to_runtime_rx) = mpsc::unbounded_channel::<Outbound>();
    let (from_runtime_tx, mut from_runtime_rx) = mpsc::unbounded_channel::<Inbound>();

    let reader = tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = tokio::io::BufReader::new(stdin).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Outbound>(&line) {
                        Ok(msg) => {
                            if to_runtime_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("malformed message from controller, ignoring: {e}");
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = from_runtime_rx.recv().await {
            let Ok(line) = serde_json::to_string(&msg) else { continue };
            if write_line(&mut stdout, &line).await.is_err() {
                break;
            }
        }
    });

    worker_runtime::run(registry, options, to_runtime_rx, from_runtime_tx).await;

    reader.abort();
    let _ = writer.await;
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
