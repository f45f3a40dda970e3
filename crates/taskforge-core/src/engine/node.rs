//! Node execution service.
//!
//! Drives a single node instance through its state machine:
//!
//! - Idempotent re-entry: executing a node that is not Pending/FailedRetry
//!   is a no-op, so duplicate dispatch (two engines, a crash replay) is
//!   harmless.
//! - Every status change is a compare-and-set through the repository; the
//!   engine that loses a transition race simply stops.
//! - Loop/parallel fan-outs materialize children atomically in one storage
//!   transaction, then drive them (sequentially for loops, concurrently for
//!   parallels).
//! - Failed attempts with remaining retry budget park the node as
//!   FailedRetry with a durable `run_after`; the scheduler's dispatch pass
//!   picks it up. No in-process retry timers.
//! - Executor invocations happen outside any storage transaction, bounded
//!   by the node timeout and the instance's cancellation token.
//! - Terminal child statuses bubble up: counters bump atomically on the
//!   parent, the parent settles when all children have, and a terminal root
//!   finalizes the workflow instance (mirroring into the parent's
//!   subprocess node when the instance is a child workflow).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use taskforge_types::config::EngineConfig;
use taskforge_types::error::EngineError;
use taskforge_types::workflow::{
    FailurePolicy, InstanceStatus, NodeDefinition, NodeInstance, NodeStatus, NodeType, RetryPolicy,
    WorkflowDefinition, WorkflowInstance,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{BoxFuture, ExecutionContext, ExecutorRegistry, NodeStateStore};
use crate::repository::workflow::{NodePatch, WorkflowRepository};

use super::retry::Backoff;

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Evaluate a JEXL node condition against `{"variables": .., "input": ..}`.
///
/// Non-boolean results use JEXL truthiness (null/false are false).
fn eval_condition(expression: &str, context: &Value) -> Result<bool, EngineError> {
    let evaluator = jexl_eval::Evaluator::new();
    let result = evaluator
        .eval_in_context(expression, context)
        .map_err(|e| EngineError::Validation(format!("condition '{expression}': {e}")))?;
    Ok(match result {
        Value::Bool(b) => b,
        Value::Null => false,
        other => other != json!(false),
    })
}

// ---------------------------------------------------------------------------
// Node state adapter
// ---------------------------------------------------------------------------

/// Bridges the dyn [`NodeStateStore`] executors see onto the repository.
struct RepoNodeState<R> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository + 'static> NodeStateStore for RepoNodeState<R> {
    fn save<'a>(
        &'a self,
        node_instance_id: Uuid,
        state: Value,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            self.repo
                .save_checkpoint(&node_instance_id, &state)
                .await
                .map_err(EngineError::from)
        })
    }

    fn load<'a>(
        &'a self,
        node_instance_id: Uuid,
    ) -> BoxFuture<'a, Result<Option<Value>, EngineError>> {
        Box::pin(async move {
            self.repo
                .load_checkpoint(&node_instance_id)
                .await
                .map_err(EngineError::from)
        })
    }

    fn report_progress<'a>(
        &'a self,
        node_instance_id: Uuid,
        progress: Value,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            self.repo
                .set_node_progress(&node_instance_id, &progress)
                .await
                .map_err(EngineError::from)
        })
    }
}

// ---------------------------------------------------------------------------
// NodeExecutionService
// ---------------------------------------------------------------------------

/// Executes node instances and bubbles terminal statuses up the tree.
pub struct NodeExecutionService<R> {
    repo: Arc<R>,
    executors: Arc<ExecutorRegistry>,
    config: Arc<EngineConfig>,
    /// Per-workflow-instance cancellation tokens, created lazily.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowRepository + 'static> NodeExecutionService<R> {
    pub fn new(repo: Arc<R>, executors: Arc<ExecutorRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            repo,
            executors,
            config,
            cancellations: DashMap::new(),
        }
    }

    /// The cancellation token for a workflow instance, created on first use.
    pub fn cancel_token(&self, workflow_instance_id: Uuid) -> CancellationToken {
        self.cancellations
            .entry(workflow_instance_id)
            .or_default()
            .clone()
    }

    /// Cancel every running executor of a workflow instance.
    pub fn cancel_instance(&self, workflow_instance_id: Uuid) {
        if let Some(token) = self.cancellations.get(&workflow_instance_id) {
            token.cancel();
        }
    }

    /// Drop the cancellation token of a settled instance.
    pub fn release_instance(&self, workflow_instance_id: Uuid) {
        self.cancellations.remove(&workflow_instance_id);
    }

    /// Execute one node instance (and, for structural nodes, its subtree).
    ///
    /// Returns without error when the node is not eligible: already running
    /// elsewhere, already terminal, or its instance is paused/terminal.
    /// Errors signal infrastructure problems, never business failures --
    /// those are recorded on the node row.
    pub fn execute_node(&self, node_instance_id: Uuid) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let Some(node) = self.repo.get_node(&node_instance_id).await? else {
                return Err(EngineError::NotFound(format!("node {node_instance_id}")));
            };
            let Some(instance) = self.repo.get_instance(&node.workflow_instance_id).await? else {
                return Err(EngineError::NotFound(format!(
                    "instance {}",
                    node.workflow_instance_id
                )));
            };

            // A paused or settled workflow executes nothing.
            if instance.status.is_terminal() || instance.status == InstanceStatus::Paused {
                return Ok(());
            }
            // Idempotent re-entry: only Pending/FailedRetry nodes run.
            if !matches!(node.status, NodeStatus::Pending | NodeStatus::FailedRetry) {
                return Ok(());
            }

            let Some(definition) = self.repo.get_definition(&instance.definition_id).await? else {
                return Err(EngineError::NotFound(format!(
                    "definition {}",
                    instance.definition_id
                )));
            };
            let Some(node_def) = definition.find_node(&node.node_id).cloned() else {
                return Err(EngineError::Validation(format!(
                    "node template '{}' missing from definition {}",
                    node.node_id,
                    definition.reference()
                )));
            };

            // Skip the node when its condition evaluates false.
            if let Some(expr) = &node_def.condition {
                let context = json!({
                    "variables": instance.variables,
                    "input": node.input,
                });
                if !eval_condition(expr, &context)? {
                    let won = self
                        .repo
                        .transition_node(
                            &node.id,
                            &[NodeStatus::Pending, NodeStatus::FailedRetry],
                            NodeStatus::Completed,
                            NodePatch::completed(json!({"skipped": true})),
                        )
                        .await?;
                    if won {
                        tracing::debug!(node_id = %node.node_id, "node skipped by condition");
                        self.on_node_terminal(node.id).await?;
                    }
                    return Ok(());
                }
            }

            // Claim the node. Losing means another engine got here first.
            let won = self
                .repo
                .transition_node(
                    &node.id,
                    &[NodeStatus::Pending, NodeStatus::FailedRetry],
                    NodeStatus::Running,
                    NodePatch::default(),
                )
                .await?;
            if !won {
                return Ok(());
            }

            tracing::debug!(
                node_id = %node.node_id,
                node_type = ?node.node_type,
                attempt = node.retry_count + 1,
                "node execution started"
            );

            match node.node_type {
                NodeType::Simple | NodeType::Task => {
                    self.run_executor(&node, &node_def, &definition, &instance)
                        .await
                }
                NodeType::Loop => self.run_fanout(&node, &node_def, &instance, true).await,
                NodeType::Parallel => self.run_fanout(&node, &node_def, &instance, false).await,
                NodeType::Subprocess => self.run_subprocess(&node, &node_def).await,
            }
        })
    }

    // -----------------------------------------------------------------------
    // Simple/task nodes
    // -----------------------------------------------------------------------

    async fn run_executor(
        &self,
        node: &NodeInstance,
        node_def: &NodeDefinition,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
    ) -> Result<(), EngineError> {
        let result = self
            .invoke_executor(node, node_def, instance)
            .await;

        match result {
            Ok(output) => {
                // Completed work no longer needs its checkpoint.
                let _ = self.repo.delete_checkpoint(&node.id).await;
                self.merge_output_variables(instance, &output).await?;
                let won = self
                    .repo
                    .transition_node(
                        &node.id,
                        &[NodeStatus::Running],
                        NodeStatus::Completed,
                        NodePatch::completed(output),
                    )
                    .await?;
                if won {
                    tracing::info!(node_id = %node.node_id, "node completed");
                    self.on_node_terminal(node.id).await?;
                }
                Ok(())
            }
            Err(err) => self.record_failure(node, node_def, definition, err).await,
        }
    }

    /// Invoke the executor outside any storage transaction, bounded by the
    /// node timeout and the instance cancellation token.
    async fn invoke_executor(
        &self,
        node: &NodeInstance,
        node_def: &NodeDefinition,
        instance: &WorkflowInstance,
    ) -> Result<Value, EngineError> {
        let name = node_def.executor.as_deref().ok_or_else(|| {
            EngineError::Validation(format!("node '{}' declares no executor", node.node_id))
        })?;
        let executor = self.executors.get(name).ok_or_else(|| {
            EngineError::Validation(format!("executor '{name}' is not registered"))
        })?;

        let cancel = self.cancel_token(instance.id);
        let ctx = ExecutionContext::new(
            instance.id,
            node.id,
            node.node_id.clone(),
            node.retry_count + 1,
            instance.variables.clone(),
            cancel.clone(),
            Arc::new(RepoNodeState {
                repo: Arc::clone(&self.repo),
            }),
        );

        let timeout_secs = node_def
            .timeout_secs
            .unwrap_or(self.config.default_node_timeout_secs);
        let deadline = std::time::Duration::from_secs(timeout_secs);

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled(format!(
                "node '{}' cancelled",
                node.node_id
            ))),
            result = tokio::time::timeout(deadline, executor.execute(&ctx, &node.input)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::Timeout {
                        scope: format!("node '{}'", node.node_id),
                        elapsed_secs: timeout_secs,
                    }),
                }
            }
        }
    }

    /// Merge an executor's `variables` output object into the instance's
    /// shared variables.
    async fn merge_output_variables(
        &self,
        instance: &WorkflowInstance,
        output: &Value,
    ) -> Result<(), EngineError> {
        let Some(updates) = output.get("variables").and_then(Value::as_object) else {
            return Ok(());
        };
        let Some(current) = self.repo.get_instance(&instance.id).await? else {
            return Ok(());
        };
        let mut merged = match current.variables {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in updates {
            merged.insert(key.clone(), value.clone());
        }
        self.repo
            .set_instance_variables(&instance.id, &Value::Object(merged))
            .await?;
        Ok(())
    }

    /// Record a failed attempt: park for a durable retry when budget and
    /// retryability allow, otherwise fail the node.
    async fn record_failure(
        &self,
        node: &NodeInstance,
        node_def: &NodeDefinition,
        definition: &WorkflowDefinition,
        err: EngineError,
    ) -> Result<(), EngineError> {
        if !matches!(err, EngineError::Cancelled(_))
            && Backoff::should_retry(node.max_retries, node.retry_count, &err)
        {
            let policy = node_def
                .retry
                .or(definition.default_retry)
                .unwrap_or(RetryPolicy::Fixed { delay_ms: 1000 });
            let attempt = node.retry_count + 1;
            let run_after = Backoff::next_run_after(&policy, attempt, Utc::now());
            let won = self
                .repo
                .transition_node(
                    &node.id,
                    &[NodeStatus::Running],
                    NodeStatus::FailedRetry,
                    NodePatch::retry_at(err.to_string(), run_after),
                )
                .await?;
            if won {
                tracing::warn!(
                    node_id = %node.node_id,
                    attempt,
                    max_retries = node.max_retries,
                    %run_after,
                    error = %err,
                    "node attempt failed, retry scheduled"
                );
            }
            return Ok(());
        }

        let won = self
            .repo
            .transition_node(
                &node.id,
                &[NodeStatus::Running],
                NodeStatus::Failed,
                NodePatch::failed(err.to_string()),
            )
            .await?;
        if won {
            tracing::error!(node_id = %node.node_id, error = %err, "node failed");
            self.on_node_terminal(node.id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loop / parallel fan-out
    // -----------------------------------------------------------------------

    /// Expand a loop or parallel node and drive its children. `sequential`
    /// is true for loops.
    async fn run_fanout(
        &self,
        node: &NodeInstance,
        node_def: &NodeDefinition,
        instance: &WorkflowInstance,
        sequential: bool,
    ) -> Result<(), EngineError> {
        // Re-entry after a crash: children may already exist. Expansion is
        // keyed on their presence, never repeated.
        let mut children = self.repo.list_children(&node.id).await?;
        if children.is_empty() {
            let rows = if sequential {
                self.loop_children(node, node_def, instance)?
            } else {
                self.parallel_children(node, node_def)?
            };
            if rows.is_empty() {
                // Empty iteration set: the fan-out completes vacuously.
                self.repo.expand_node(&node.id, &[]).await?;
                self.repo
                    .set_loop_phase(&node.id, taskforge_types::workflow::LoopPhase::Completed)
                    .await?;
                let won = self
                    .repo
                    .transition_node(
                        &node.id,
                        &[NodeStatus::Running],
                        NodeStatus::Completed,
                        NodePatch::completed(json!({"outputs": []})),
                    )
                    .await?;
                if won {
                    self.on_node_terminal(node.id).await?;
                }
                return Ok(());
            }

            // One transaction: all children plus the parent's progress, or
            // nothing. A failure here puts the parent back in the dispatch
            // queue; without a fresh `run_after` no scan would ever re-pick
            // it.
            if let Err(e) = self.repo.expand_node(&node.id, &rows).await {
                self.repo
                    .transition_node(
                        &node.id,
                        &[NodeStatus::Running],
                        NodeStatus::Pending,
                        NodePatch {
                            run_after: Some(Utc::now()),
                            ..NodePatch::default()
                        },
                    )
                    .await?;
                return Err(e.into());
            }
            tracing::info!(
                node_id = %node.node_id,
                children = rows.len(),
                sequential,
                "fan-out expanded"
            );
            children = self.repo.list_children(&node.id).await?;
        }

        if sequential {
            for child in children {
                self.execute_node(child.id).await?;
                // FailFast may have settled the parent mid-iteration.
                let Some(parent) = self.repo.get_node(&node.id).await? else {
                    break;
                };
                if parent.status.is_terminal() {
                    break;
                }
            }
        } else {
            let results = futures_util::future::join_all(
                children.iter().map(|child| self.execute_node(child.id)),
            )
            .await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    /// Build child rows for a loop node: one per item in the iteration set.
    fn loop_children(
        &self,
        node: &NodeInstance,
        node_def: &NodeDefinition,
        instance: &WorkflowInstance,
    ) -> Result<Vec<NodeInstance>, EngineError> {
        let body = node_def.children.first().ok_or_else(|| {
            EngineError::Validation(format!("loop node '{}' has no body template", node.node_id))
        })?;

        let items: Vec<Value> = if let Some(items) = node.input.get("items").and_then(Value::as_array)
        {
            items.clone()
        } else if let Some(expr) = node.input.get("items_expr").and_then(Value::as_str) {
            let context = json!({"variables": instance.variables});
            let evaluator = jexl_eval::Evaluator::new();
            let result = evaluator.eval_in_context(expr, &context).map_err(|e| {
                EngineError::Validation(format!("items_expr '{expr}': {e}"))
            })?;
            result
                .as_array()
                .cloned()
                .ok_or_else(|| {
                    EngineError::Validation(format!("items_expr '{expr}' did not yield an array"))
                })?
        } else {
            return Err(EngineError::Validation(format!(
                "loop node '{}' input has neither 'items' nor 'items_expr'",
                node.node_id
            )));
        };

        Ok(items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let mut input = match &body.input {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                input.insert("item".to_string(), item.clone());
                input.insert("index".to_string(), json!(i));
                self.child_row(node, body, i as u32, Value::Object(input))
            })
            .collect())
    }

    /// Build child rows for a parallel node: one per branch template.
    fn parallel_children(
        &self,
        node: &NodeInstance,
        node_def: &NodeDefinition,
    ) -> Result<Vec<NodeInstance>, EngineError> {
        if node_def.children.is_empty() {
            return Err(EngineError::Validation(format!(
                "parallel node '{}' has no branches",
                node.node_id
            )));
        }
        Ok(node_def
            .children
            .iter()
            .enumerate()
            .map(|(i, branch)| self.child_row(node, branch, i as u32, branch.input.clone()))
            .collect())
    }

    fn child_row(
        &self,
        parent: &NodeInstance,
        template: &NodeDefinition,
        index: u32,
        input: Value,
    ) -> NodeInstance {
        NodeInstance {
            id: Uuid::now_v7(),
            workflow_instance_id: parent.workflow_instance_id,
            node_id: template.node_id.clone(),
            node_type: template.node_type,
            status: NodeStatus::Pending,
            parent_node_id: Some(parent.id),
            child_index: Some(index),
            loop_progress: None,
            retry_count: 0,
            max_retries: template.max_retries,
            run_after: None,
            input,
            output: None,
            error_details: None,
            progress: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    // -----------------------------------------------------------------------
    // Subprocess nodes
    // -----------------------------------------------------------------------

    async fn run_subprocess(
        &self,
        node: &NodeInstance,
        node_def: &NodeDefinition,
    ) -> Result<(), EngineError> {
        let Some(reference) = &node_def.subprocess else {
            return Err(EngineError::Validation(format!(
                "subprocess node '{}' references no workflow",
                node.node_id
            )));
        };

        // Re-entry: a child instance may already exist from a prior attempt.
        if let Some(child) = self.repo.find_subprocess_instance(&node.id).await? {
            if child.status.is_terminal() {
                return self.mirror_subprocess(node, &child).await;
            }
            let Some(root) = self.repo.get_root_node(&child.id).await? else {
                return Err(EngineError::Recovery(format!(
                    "subprocess instance {} has no root node",
                    child.id
                )));
            };
            // The child may have been interrupted too.
            self.reconcile(child.id).await?;
            return self.execute_node(root.id).await;
        }

        let Some(child_def) = self
            .repo
            .get_definition_by_ref(&reference.name, &reference.version)
            .await?
        else {
            return Err(EngineError::Validation(format!(
                "subprocess workflow {reference} not found"
            )));
        };

        let parent_instance_id = node.workflow_instance_id;
        let child = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: child_def.id,
            definition_name: child_def.name.clone(),
            definition_version: child_def.version.clone(),
            status: InstanceStatus::Pending,
            input: node.input.clone(),
            output: None,
            variables: json!({}),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
            mutex_key: None,
            business_key: None,
            parent_instance_id: Some(parent_instance_id),
            parent_node_id: Some(node.id),
            engine_id: None,
            error: None,
            created_at: Utc::now(),
        };
        self.repo.create_instance(&child).await?;

        let root = NodeInstance {
            id: Uuid::now_v7(),
            workflow_instance_id: child.id,
            node_id: child_def.root.node_id.clone(),
            node_type: child_def.root.node_type,
            status: NodeStatus::Pending,
            parent_node_id: None,
            child_index: None,
            loop_progress: None,
            retry_count: 0,
            max_retries: child_def.root.max_retries,
            run_after: None,
            input: node.input.clone(),
            output: None,
            error_details: None,
            progress: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.repo.create_node(&root).await?;
        self.repo.mark_instance_started(&child.id, "").await?;

        tracing::info!(
            node_id = %node.node_id,
            subprocess = %reference,
            child_instance = %child.id,
            "subprocess instance spawned"
        );

        self.execute_node(root.id).await
    }

    /// Copy a settled child instance's outcome onto its subprocess node.
    async fn mirror_subprocess(
        &self,
        node: &NodeInstance,
        child: &WorkflowInstance,
    ) -> Result<(), EngineError> {
        let (to, patch) = if child.status == InstanceStatus::Completed {
            (
                NodeStatus::Completed,
                NodePatch::completed(child.output.clone().unwrap_or(Value::Null)),
            )
        } else {
            (
                NodeStatus::Failed,
                NodePatch::failed(
                    child
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("subprocess ended {:?}", child.status)),
                ),
            )
        };
        let won = self
            .repo
            .transition_node(&node.id, &[NodeStatus::Running], to, patch)
            .await?;
        if won {
            self.on_node_terminal(node.id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Terminal bubbling
    // -----------------------------------------------------------------------

    /// React to a node reaching Completed/Failed: bump the parent's fan-out
    /// counters and settle it when every child has, or finalize the
    /// workflow instance when the root settled.
    pub fn on_node_terminal(&self, node_instance_id: Uuid) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let Some(node) = self.repo.get_node(&node_instance_id).await? else {
                return Err(EngineError::NotFound(format!("node {node_instance_id}")));
            };

            match node.parent_node_id {
                Some(parent_id) => self.on_child_terminal(&node, parent_id).await,
                None => self.finalize_instance(&node).await,
            }
        })
    }

    async fn on_child_terminal(
        &self,
        child: &NodeInstance,
        parent_id: Uuid,
    ) -> Result<(), EngineError> {
        let failed = child.status == NodeStatus::Failed;
        let progress = self
            .repo
            .increment_loop_progress(&parent_id, u32::from(!failed), u32::from(failed))
            .await?;

        let Some(parent) = self.repo.get_node(&parent_id).await? else {
            return Err(EngineError::NotFound(format!("node {parent_id}")));
        };
        if parent.status.is_terminal() {
            return Ok(());
        }

        let Some(instance) = self.repo.get_instance(&parent.workflow_instance_id).await? else {
            return Err(EngineError::NotFound(format!(
                "instance {}",
                parent.workflow_instance_id
            )));
        };
        let Some(definition) = self.repo.get_definition(&instance.definition_id).await? else {
            return Err(EngineError::NotFound(format!(
                "definition {}",
                instance.definition_id
            )));
        };
        let policy = definition
            .find_node(&parent.node_id)
            .map(|d| d.failure_policy)
            .unwrap_or_default();

        if failed && policy == FailurePolicy::FailFast {
            return self.fail_fast(&parent, child).await;
        }

        // Settlement is decided from the child rows themselves, not the
        // counters: a crash between a child's terminal write and the
        // counter bump must not wedge the parent forever.
        let children = self.repo.list_children(&parent_id).await?;
        if !progress.all_settled() && !children.iter().all(|c| c.status.is_terminal()) {
            return Ok(());
        }

        self.settle_fanout(&parent, &children).await
    }

    /// Aggregate settled children and finalize their fan-out parent.
    async fn settle_fanout(
        &self,
        parent: &NodeInstance,
        children: &[NodeInstance],
    ) -> Result<(), EngineError> {
        let parent_id = parent.id;
        let outputs: Vec<Value> = children
            .iter()
            .map(|c| c.output.clone().unwrap_or(Value::Null))
            .collect();
        let failed_count = children
            .iter()
            .filter(|c| c.status == NodeStatus::Failed)
            .count();

        if failed_count == 0 {
            self.repo
                .set_loop_phase(&parent_id, taskforge_types::workflow::LoopPhase::Completed)
                .await?;
            let won = self
                .repo
                .transition_node(
                    &parent_id,
                    &[NodeStatus::Running],
                    NodeStatus::Completed,
                    NodePatch::completed(json!({"outputs": outputs})),
                )
                .await?;
            if won {
                tracing::info!(node_id = %parent.node_id, "fan-out completed");
                self.on_node_terminal(parent_id).await?;
            }
        } else {
            // ContinueOnPartial: all children ran; record which failed.
            let failed_indices: Vec<u32> = children
                .iter()
                .filter(|c| c.status == NodeStatus::Failed)
                .filter_map(|c| c.child_index)
                .collect();
            self.repo
                .set_loop_phase(&parent_id, taskforge_types::workflow::LoopPhase::Failed)
                .await?;
            let mut patch = NodePatch::failed(format!(
                "{} of {} children failed",
                failed_count,
                children.len()
            ));
            patch.output = Some(json!({
                "outputs": outputs,
                "failed_indices": failed_indices,
            }));
            let won = self
                .repo
                .transition_node(&parent_id, &[NodeStatus::Running], NodeStatus::Failed, patch)
                .await?;
            if won {
                tracing::warn!(
                    node_id = %parent.node_id,
                    failed = failed_count,
                    total = children.len(),
                    "fan-out failed partially"
                );
                self.on_node_terminal(parent_id).await?;
            }
        }
        Ok(())
    }

    /// Repair nodes a crashed engine left mid-flight.
    ///
    /// Simple/task/subprocess nodes stuck in Running go back to Pending
    /// (their checkpoint, if any, survives for the next attempt). Fan-out
    /// parents stuck in Running settle immediately when their children all
    /// finished, and go back to Pending when expansion never happened.
    /// Parents whose children are still settling are left alone; the
    /// children will bubble up normally.
    pub async fn reconcile(&self, workflow_instance_id: Uuid) -> Result<(), EngineError> {
        let nodes = self.repo.list_nodes(&workflow_instance_id).await?;
        for node in &nodes {
            if node.status != NodeStatus::Running {
                continue;
            }
            match node.node_type {
                NodeType::Loop | NodeType::Parallel => {
                    let children = self.repo.list_children(&node.id).await?;
                    if children.is_empty() {
                        self.repo
                            .transition_node(
                                &node.id,
                                &[NodeStatus::Running],
                                NodeStatus::Pending,
                                NodePatch::default(),
                            )
                            .await?;
                    } else if children.iter().all(|c| c.status.is_terminal()) {
                        self.settle_fanout(node, &children).await?;
                    }
                }
                NodeType::Simple | NodeType::Task | NodeType::Subprocess => {
                    let reset = self
                        .repo
                        .transition_node(
                            &node.id,
                            &[NodeStatus::Running],
                            NodeStatus::Pending,
                            NodePatch::default(),
                        )
                        .await?;
                    if reset {
                        tracing::info!(
                            node_id = %node.node_id,
                            "interrupted node reset for re-execution"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// FailFast: a failed child settles the parent immediately and stops
    /// the remaining children from ever running.
    async fn fail_fast(
        &self,
        parent: &NodeInstance,
        failed_child: &NodeInstance,
    ) -> Result<(), EngineError> {
        let siblings = self.repo.list_children(&parent.id).await?;
        for sibling in &siblings {
            if sibling.id == failed_child.id {
                continue;
            }
            // Withdraw unstarted siblings; they are settled directly
            // without bubbling to keep the parent's counters untouched.
            self.repo
                .transition_node(
                    &sibling.id,
                    &[NodeStatus::Pending, NodeStatus::FailedRetry],
                    NodeStatus::Failed,
                    NodePatch::failed(format!(
                        "cancelled: sibling '{}' failed",
                        failed_child.node_id
                    )),
                )
                .await?;
        }

        self.repo
            .set_loop_phase(&parent.id, taskforge_types::workflow::LoopPhase::Failed)
            .await?;
        let won = self
            .repo
            .transition_node(
                &parent.id,
                &[NodeStatus::Running],
                NodeStatus::Failed,
                NodePatch::failed(format!(
                    "child '{}' failed: {}",
                    failed_child.node_id,
                    failed_child.error_details.as_deref().unwrap_or("unknown")
                )),
            )
            .await?;
        if won {
            tracing::warn!(
                node_id = %parent.node_id,
                failed_child = %failed_child.node_id,
                "fan-out failed fast"
            );
            self.on_node_terminal(parent.id).await?;
        }
        Ok(())
    }

    /// A terminal root node settles the workflow instance. Terminal status
    /// writes are conditional: cancel/timeout may already have settled it.
    async fn finalize_instance(&self, root: &NodeInstance) -> Result<(), EngineError> {
        let instance_id = root.workflow_instance_id;
        let non_terminal = [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Paused,
        ];

        let won = if root.status == NodeStatus::Completed {
            self.repo
                .update_instance_status_if(
                    &instance_id,
                    &non_terminal,
                    InstanceStatus::Completed,
                    root.output.as_ref(),
                    None,
                )
                .await?
        } else {
            self.repo
                .update_instance_status_if(
                    &instance_id,
                    &non_terminal,
                    InstanceStatus::Failed,
                    None,
                    root.error_details.as_deref(),
                )
                .await?
        };

        if !won {
            return Ok(());
        }

        tracing::info!(
            instance_id = %instance_id,
            status = ?root.status,
            "workflow instance settled"
        );
        self.release_instance(instance_id);

        // A child workflow mirrors its outcome into the parent's
        // subprocess node.
        let Some(instance) = self.repo.get_instance(&instance_id).await? else {
            return Ok(());
        };
        if let Some(parent_node_id) = instance.parent_node_id
            && let Some(parent_node) = self.repo.get_node(&parent_node_id).await?
        {
            self.mirror_subprocess(&parent_node, &instance).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_condition_boolean() {
        let ctx = json!({"variables": {"enabled": true}, "input": {}});
        assert!(eval_condition("variables.enabled == true", &ctx).unwrap());
        assert!(!eval_condition("variables.enabled == false", &ctx).unwrap());
    }

    #[test]
    fn test_eval_condition_truthiness() {
        let ctx = json!({"variables": {"count": 3}, "input": {}});
        assert!(eval_condition("variables.count", &ctx).unwrap());
        let ctx = json!({"variables": {}, "input": {}});
        assert!(!eval_condition("variables.missing", &ctx).unwrap());
    }

    #[test]
    fn test_eval_condition_invalid_expression() {
        let ctx = json!({"variables": {}, "input": {}});
        let err = eval_condition("][", &ctx).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }
}
