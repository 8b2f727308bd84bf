/*!
 * The worker-side method table.
 *
 * Parameters and results are `serde_json::Value` — a tagged union over the
 * JSON-serializable primitive types, reused directly rather than
 * hand-rolled, per the original design note that this is exactly what a
 * `Value` type needs to be.
 */
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::WorkerError;

pub type MethodResult = Result<Value, WorkerError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type AbortListener = Arc<dyn Fn() -> BoxFuture<'static, Result<(), WorkerError>> + Send + Sync>;
pub type TerminationHandler = Arc<dyn Fn(i32) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered method. Sync methods return immediately; async ones return
/// a boxed future that the worker runtime awaits.
pub type Method = Arc<dyn Fn(&[Value], &WorkerContext) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Handed to a method body while it executes. Lets the method register a
/// cleanup callback for cooperative cancellation and emit progress events.
#[derive(Clone)]
pub struct WorkerContext {
    pub(crate) task_id: u32,
    pub(crate) aborted: Arc<AtomicBool>,
    pub(crate) emit: Arc<dyn Fn(u32, Value) + Send + Sync>,
    pub(crate) register_abort_listener: Arc<dyn Fn(u32, AbortListener) + Send + Sync>,
}

impl WorkerContext {
    /// Emits a progress event for the task currently executing.
    pub fn emit(&self, payload: Value) {
        (self.emit)(self.task_id, payload);
    }

    /// Registers a callback run when the controller sends a `CLEANUP`
    /// request for this task (the caller cancelled it or its timeout
    /// elapsed). Multiple listeners may be registered; all run
    /// concurrently, bounded by `abort_listener_timeout`.
    pub fn add_abort_listener(&self, listener: AbortListener) {
        (self.register_abort_listener)(self.task_id, listener);
    }

    /// True once the controller has requested cancellation for this task.
    /// Long-running methods should poll this cooperatively.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

/// The method table plus the optional termination hook. Built once via
/// [`Registry::builder`] and handed to the worker runtime.
#[derive(Clone, Default)]
pub struct Registry {
    methods: HashMap<String, Method>,
    pub(crate) termination_handler: Option<TerminationHandler>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    methods: HashMap<String, Method>,
    termination_handler: Option<TerminationHandler>,
}

impl RegistryBuilder {
    /// Registers a synchronous method.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value], &WorkerContext) -> MethodResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.methods.insert(
            name.into(),
            Arc::new(move |params, ctx| {
                let f = f.clone();
                let params = params.to_vec();
                let ctx = ctx.clone();
                Box::pin(async move { f(&params, &ctx) })
            }),
        );
        self
    }

    /// Registers an async method.
    pub fn async_method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let f = Arc::new(f);
        self.methods.insert(
            name.into(),
            Arc::new(move |params, ctx| {
                let f = f.clone();
                let params = params.to_vec();
                let ctx = ctx.clone();
                Box::pin(async move { f(params, ctx).await })
            }),
        );
        self
    }

    pub fn on_terminate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(i32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.termination_handler = Some(Arc::new(move |code| Box::pin(f(code))));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            methods: self.methods,
            termination_handler: self.termination_handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_ctx() -> WorkerContext {
        WorkerContext {
            task_id: 1,
            aborted: Arc::new(AtomicBool::new(false)),
            emit: Arc::new(|_, _| {}),
            register_abort_listener: Arc::new(|_, _| {}),
        }
    }

    #[tokio::test]
    async fn unregistered_method_is_absent() {
        let registry = Registry::builder().build();
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn sync_method_runs_through_the_boxed_future_adapter() {
        let registry = Registry::builder()
            .method("double", |params, _ctx| {
                let n = params[0].as_i64().unwrap_or(0);
                Ok(Value::from(n * 2))
            })
            .build();

        let method = registry.get("double").expect("registered");
        let result = method(&[Value::from(21)], &noop_ctx()).await.unwrap();
        assert_eq!(result, Value::from(42));
    }

    #[tokio::test]
    async fn async_method_sees_task_id_through_context() {
        let registry = Registry::builder()
            .async_method("echo_task_id", |_params, ctx| async move { Ok(Value::from(ctx.task_id)) })
            .build();

        let method = registry.get("echo_task_id").expect("registered");
        let ctx = noop_ctx();
        let result = method(&[], &ctx).await.unwrap();
        assert_eq!(result, Value::from(1));
    }

    #[test]
    fn is_aborted_reflects_the_shared_flag() {
        let ctx = noop_ctx();
        assert!(!ctx.is_aborted());
        ctx.aborted.store(true, Ordering::Relaxed);
        assert!(ctx.is_aborted());
    }
}
