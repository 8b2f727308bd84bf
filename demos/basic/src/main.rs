/**
 * Minimal test harness for the worker pool.
 *
 * Spawns a thread-backed pool, registers a sync and an async method, runs
 * a handful of tasks, and demonstrates cancellation and timeout:
 *
 *   cargo run -p workerpool_basic_demo
 */
use std::time::Duration;

use workerpool::{ExecOptions, PoolOptions, Registry};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let registry = Registry::builder()
        .method("double", |params, _ctx| {
            let n = params.first().and_then(|v| v.as_i64()).unwrap_or(0);
            Ok((n * 2).into())
        })
        .async_method("slow_echo", |params, ctx| async move {
            for step in 0..5 {
                if ctx.is_aborted() {
                    return Err(workerpool::WorkerError::Cancelled);
                }
                ctx.emit(serde_json::json!({ "step": step }));
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(params.into_iter().next().unwrap_or(serde_json::Value::Null))
        })
        .build();

    let pool = workerpool::spawn(PoolOptions::default(), registry)
        .await
        .expect("pool should start");

    let doubled = pool
        .exec("double", vec![21.into()], ExecOptions::default())
        .await
        .expect("task should be accepted")
        .await
        .expect("double should succeed");
    println!("[example] double(21) = {doubled}");

    let task = pool
        .exec(
            "slow_echo",
            vec!["hi".into()],
            ExecOptions {
                on_event: Some(std::sync::Arc::new(|payload| println!("[example] progress: {payload}"))),
            },
        )
        .await
        .expect("task should be accepted");
    let echoed = task.await.expect("slow_echo should complete");
    println!("[example] slow_echo = {echoed}");

    let cancelled = pool
        .exec("slow_echo", vec!["bye".into()], ExecOptions::default())
        .await
        .expect("task should be accepted");
    cancelled.cancel();
    match cancelled.await {
        Err(e) => println!("[example] cancelled task resolved with: {e}"),
        Ok(v) => println!("[example] cancelled task unexpectedly resolved: {v}"),
    }

    let timed_out = pool
        .exec("slow_echo", vec!["late".into()], ExecOptions::default())
        .await
        .expect("task should be accepted");
    timed_out.timeout(Duration::from_millis(50));
    match timed_out.await {
        Err(e) => println!("[example] timed out task resolved with: {e}"),
        Ok(v) => println!("[example] timed out task unexpectedly resolved: {v}"),
    }

    pool.terminate(false).await;
    println!("[example] done.");
}
