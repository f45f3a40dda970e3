//! Executor contract and registry.
//!
//! Executors are the engine's only extension point: client applications
//! implement [`Executor`] for each unit of business work and register it by
//! name. The engine owns every state transition; executors only compute.
//!
//! The trait is dyn-compatible (registry holds `Arc<dyn Executor>`), so
//! `execute` returns a boxed future instead of using native async fn.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use taskforge_types::error::EngineError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Boxed future type used by the dyn-compatible traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Node state store
// ---------------------------------------------------------------------------

/// Durable per-node state handed to executors: checkpoints and progress.
///
/// Long-running executors save intermediate state here; after a crash the
/// retried attempt loads it and continues instead of starting over.
/// Progress snapshots are advisory data for observers and never gate a
/// status transition. The engine backs both with the workflow repository.
pub trait NodeStateStore: Send + Sync {
    /// Upsert the checkpoint for a node instance.
    fn save<'a>(
        &'a self,
        node_instance_id: Uuid,
        state: Value,
    ) -> BoxFuture<'a, Result<(), EngineError>>;

    /// Load the checkpoint for a node instance, if any.
    fn load<'a>(
        &'a self,
        node_instance_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<Value>, EngineError>>;

    /// Record the latest progress snapshot for a node instance.
    fn report_progress<'a>(
        &'a self,
        node_instance_id: Uuid,
        progress: Value,
    ) -> BoxFuture<'a, Result<(), EngineError>>;
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Per-invocation context handed to an executor.
pub struct ExecutionContext {
    /// Owning workflow instance.
    pub workflow_instance_id: Uuid,
    /// The node instance being executed.
    pub node_instance_id: Uuid,
    /// Template node ID.
    pub node_id: String,
    /// 1-based attempt number (first execution is attempt 1).
    pub attempt: u32,
    /// Snapshot of the instance's shared variables.
    pub variables: Value,
    /// Cancelled when the workflow is cancelled or the engine shuts down.
    /// Executors should poll this at safe points and return early.
    pub cancel: CancellationToken,
    node_state: Arc<dyn NodeStateStore>,
}

impl ExecutionContext {
    pub fn new(
        workflow_instance_id: Uuid,
        node_instance_id: Uuid,
        node_id: String,
        attempt: u32,
        variables: Value,
        cancel: CancellationToken,
        node_state: Arc<dyn NodeStateStore>,
    ) -> Self {
        Self {
            workflow_instance_id,
            node_instance_id,
            node_id,
            attempt,
            variables,
            cancel,
            node_state,
        }
    }

    /// Save intermediate executor state for crash-safe resume.
    pub async fn save_checkpoint(&self, state: Value) -> Result<(), EngineError> {
        self.node_state.save(self.node_instance_id, state).await
    }

    /// Load previously saved state, if any. Returns `None` on a fresh run.
    pub async fn load_checkpoint(&self) -> Result<Option<Value>, EngineError> {
        self.node_state.load(self.node_instance_id).await
    }

    /// Publish a progress snapshot for this node (e.g. items processed so
    /// far). Visible on the node record while the executor is still running.
    pub async fn report_progress(&self, progress: Value) -> Result<(), EngineError> {
        self.node_state
            .report_progress(self.node_instance_id, progress)
            .await
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// A named unit of business work.
///
/// Implementations must be idempotent or tolerate re-execution: the engine
/// may invoke the same node again after a crash, and uses checkpoints plus
/// status compare-and-sets to keep effects single-shot where it can.
pub trait Executor: Send + Sync {
    /// Registry name (matched against `NodeDefinition.executor`).
    fn name(&self) -> &str;

    /// Run the work. A `Err(EngineError::Execution { retryable: true, .. })`
    /// lets the node's retry policy schedule another attempt; any other
    /// error fails the node outright.
    fn execute<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        input: &'a Value,
    ) -> BoxFuture<'a, Result<Value, EngineError>>;
}

// ---------------------------------------------------------------------------
// Executor registry
// ---------------------------------------------------------------------------

/// Concurrent name -> executor map shared across engine services.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own name. Replaces any previous
    /// registration with the same name.
    pub fn register(&self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    /// Look up an executor by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Whether an executor is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered executor names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.executors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    impl Executor for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn execute<'a>(
            &'a self,
            _ctx: &'a ExecutionContext,
            input: &'a Value,
        ) -> BoxFuture<'a, Result<Value, EngineError>> {
            Box::pin(async move {
                let n = input["n"].as_i64().ok_or_else(|| {
                    EngineError::Validation("input must contain integer 'n'".to_string())
                })?;
                Ok(json!({"n": n * 2}))
            })
        }
    }

    struct NullNodeState;

    impl NodeStateStore for NullNodeState {
        fn save<'a>(&'a self, _id: Uuid, _state: Value) -> BoxFuture<'a, Result<(), EngineError>> {
            Box::pin(async { Ok(()) })
        }

        fn load<'a>(&'a self, _id: Uuid) -> BoxFuture<'a, Result<Option<Value>, EngineError>> {
            Box::pin(async { Ok(None) })
        }

        fn report_progress<'a>(
            &'a self,
            _id: Uuid,
            _progress: Value,
        ) -> BoxFuture<'a, Result<(), EngineError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn make_ctx() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "double".to_string(),
            1,
            json!({}),
            CancellationToken::new(),
            Arc::new(NullNodeState),
        )
    }

    #[tokio::test]
    async fn test_registry_lookup_and_execute() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(Doubler));

        assert!(registry.contains("doubler"));
        assert!(!registry.contains("missing"));
        assert_eq!(registry.names(), vec!["doubler"]);

        let executor = registry.get("doubler").unwrap();
        let ctx = make_ctx();
        let out = executor.execute(&ctx, &json!({"n": 21})).await.unwrap();
        assert_eq!(out, json!({"n": 42}));
    }

    #[tokio::test]
    async fn test_executor_validation_error() {
        let ctx = make_ctx();
        let err = Doubler.execute(&ctx, &json!({})).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_context_cancellation_flag() {
        let ctx = make_ctx();
        assert!(!ctx.is_cancelled());
        ctx.cancel.cancel();
        assert!(ctx.is_cancelled());
    }
}
