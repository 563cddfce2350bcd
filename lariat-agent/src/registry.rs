//! The operation registry.
//!
//! Controllers invoke operations by name; the agent owns the mapping
//! from names to functions. Synchronous operations run on the blocking
//! pool — one worker per in-flight call, because an operation may block
//! arbitrarily — while async operations run as plain tasks.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use lariat_proto::Value;

use crate::loader::Loader;

/// What an operation returns: a codec value, or an error message that
/// travels back to the controller verbatim.
pub type OpResult = Result<Value, String>;

/// Arguments to one invocation.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct CallArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments, in the order they were sent.
    pub kwargs: Vec<(String, Value)>,
}

impl CallArgs {
    /// Builds arguments from parts.
    pub fn new(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Self {
        Self { args, kwargs }
    }

    /// The positional argument at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// The keyword argument named `key`.
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// The positional argument at `index` as text, or an error naming it.
    pub fn str_arg(&self, index: usize) -> Result<&str, String> {
        self.get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("argument {index} must be a string"))
    }
}

/// Per-invocation context handed to every operation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OpCtx {
    /// Host name this agent was started as.
    pub host: String,
    /// Host names from the root controller to this agent, inclusive.
    pub path: Vec<String>,
    /// Nested-tunnel depth limit in force.
    pub depth_limit: usize,
    loader: Loader,
}

impl OpCtx {
    pub(crate) fn new(host: String, path: Vec<String>, depth_limit: usize, loader: Loader) -> Self {
        Self {
            host,
            path,
            depth_limit,
            loader,
        }
    }

    /// Fetches a resource from the controller by key, waiting up to the
    /// resource timeout. Cached: each key crosses the wire once.
    pub fn resource(&self, key: &str) -> Result<Vec<u8>, String> {
        let entry = self.loader.get(key)?;
        if !entry.exists {
            return Err(format!("resource {key:?} does not exist on the controller"));
        }
        Ok(entry.source)
    }

    /// Whether a resource key is already cached, without requesting it.
    pub fn resource_cached(&self, key: &str) -> bool {
        self.loader.cached(key)
    }
}

type SyncOp = Arc<dyn Fn(&OpCtx, CallArgs) -> OpResult + Send + Sync>;
type BoxedFuture = Pin<Box<dyn Future<Output = OpResult> + Send>>;
type AsyncOp = Arc<dyn Fn(OpCtx, CallArgs) -> BoxedFuture + Send + Sync>;

enum OpFn {
    Sync(SyncOp),
    Async(AsyncOp),
}

/// Mapping from operation names to functions.
#[derive(Default)]
pub struct Registry {
    ops: HashMap<String, OpFn>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("ops", &names).finish()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous operation. It may block; each invocation
    /// gets its own worker.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&OpCtx, CallArgs) -> OpResult + Send + Sync + 'static,
    {
        self.ops.insert(name.into(), OpFn::Sync(Arc::new(f)));
    }

    /// Registers an async operation.
    pub fn register_async<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(OpCtx, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OpResult> + Send + 'static,
    {
        self.ops.insert(
            name.into(),
            OpFn::Async(Arc::new(move |ctx, args| Box::pin(f(ctx, args)))),
        );
    }

    /// The registered operation names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    /// Runs one operation to completion.
    pub async fn run(&self, ctx: OpCtx, name: &str, args: CallArgs) -> OpResult {
        match self.ops.get(name) {
            Some(OpFn::Sync(f)) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(&ctx, args))
                    .await
                    .map_err(|e| format!("operation {name:?} panicked: {e}"))?
            }
            Some(OpFn::Async(f)) => f(ctx, args).await,
            None => Err(format!("unknown operation {name:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> OpCtx {
        OpCtx::new(
            "test".into(),
            vec!["test".into()],
            2,
            Loader::disconnected(),
        )
    }

    #[tokio::test]
    async fn sync_op_runs_on_the_blocking_pool() {
        let mut registry = Registry::new();
        registry.register("double", |_ctx, args| {
            let n = args
                .get(0)
                .and_then(Value::as_int)
                .ok_or("argument 0 must be an integer")?;
            Ok(Value::Int(n * 2))
        });
        let out = registry
            .run(test_ctx(), "double", CallArgs::new(vec![Value::Int(21)], vec![]))
            .await;
        assert_eq!(out, Ok(Value::Int(42)));
    }

    #[tokio::test]
    async fn async_op_and_kwargs() {
        let mut registry = Registry::new();
        registry.register_async("greet", |_ctx, args| async move {
            let name = args
                .kwarg("name")
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_owned();
            Ok(Value::Str(format!("hello {name}")))
        });
        let out = registry
            .run(
                test_ctx(),
                "greet",
                CallArgs::new(vec![], vec![("name".into(), Value::Str("h1".into()))]),
            )
            .await;
        assert_eq!(out, Ok(Value::Str("hello h1".into())));
    }

    #[tokio::test]
    async fn unknown_op_errors() {
        let registry = Registry::new();
        let out = registry.run(test_ctx(), "absent", CallArgs::default()).await;
        assert!(out.is_err());
    }
}
