//! Workflow instance lifecycle service.
//!
//! Creates instances from published definitions (under mutex admission),
//! drives them to completion, and exposes resume/cancel/pause and history
//! lookups. The instance's terminal status is derived from its root node;
//! cancel and timeout pre-empt through conditional updates that never
//! overwrite an already-terminal status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use taskforge_types::config::EngineConfig;
use taskforge_types::error::EngineError;
use taskforge_types::workflow::{
    DefinitionRef, InstanceStatus, NodeDefinition, NodeInstance, NodeStatus, NodeType,
    WorkflowDefinition, WorkflowInstance,
};
use uuid::Uuid;

use crate::executor::ExecutorRegistry;
use crate::repository::workflow::WorkflowRepository;

use super::mutex::{MutexOutcome, MutexWorkflowManager};
use super::node::NodeExecutionService;

// ---------------------------------------------------------------------------
// Start options
// ---------------------------------------------------------------------------

/// Options for starting a workflow instance.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// At most one non-terminal instance per key.
    pub mutex_key: Option<String>,
    /// Application key for history lookups.
    pub business_key: Option<String>,
    /// When the run was scheduled (set by the scheduler).
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Cap on concurrent non-terminal instances of the definition.
    pub max_instances: Option<u32>,
}

/// Result of a start request.
#[derive(Debug)]
pub enum StartOutcome {
    /// A new instance was created and driven.
    Started(WorkflowInstance),
    /// The mutex key is held; the holding instance is returned instead.
    AlreadyRunning(WorkflowInstance),
}

// ---------------------------------------------------------------------------
// WorkflowInstanceService
// ---------------------------------------------------------------------------

/// Manages workflow instances end to end.
pub struct WorkflowInstanceService<R> {
    repo: Arc<R>,
    nodes: Arc<NodeExecutionService<R>>,
    mutex: MutexWorkflowManager<R>,
    executors: Arc<ExecutorRegistry>,
    config: Arc<EngineConfig>,
    engine_id: String,
}

impl<R: WorkflowRepository + 'static> WorkflowInstanceService<R> {
    pub fn new(
        repo: Arc<R>,
        nodes: Arc<NodeExecutionService<R>>,
        executors: Arc<ExecutorRegistry>,
        config: Arc<EngineConfig>,
        engine_id: impl Into<String>,
    ) -> Self {
        Self {
            mutex: MutexWorkflowManager::new(Arc::clone(&repo)),
            repo,
            nodes,
            executors,
            config,
            engine_id: engine_id.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and publish a workflow definition.
    pub async fn register_definition(&self, def: &WorkflowDefinition) -> Result<(), EngineError> {
        self.validate_definition(def)?;
        self.repo.save_definition(def).await?;
        tracing::info!(definition = %def.reference(), "workflow definition published");
        Ok(())
    }

    /// Parse a YAML definition file and publish it.
    pub async fn register_definition_yaml(
        &self,
        yaml: &str,
    ) -> Result<WorkflowDefinition, EngineError> {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml)
            .map_err(|e| EngineError::Validation(format!("definition YAML: {e}")))?;
        self.register_definition(&def).await?;
        Ok(def)
    }

    /// Structural validation of a definition tree.
    ///
    /// Checks node ID uniqueness, executor presence and registration for
    /// simple/task nodes, body/branch templates for fan-outs, and
    /// subprocess references. Referenced subprocess definitions are
    /// resolved at runtime, not here, so definitions can be published in
    /// any order.
    pub fn validate_definition(&self, def: &WorkflowDefinition) -> Result<(), EngineError> {
        if def.name.is_empty() {
            return Err(EngineError::Validation("definition name is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![&def.root];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.node_id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate node ID '{}'",
                    node.node_id
                )));
            }
            self.validate_node(node)?;
            stack.extend(node.children.iter());
        }
        Ok(())
    }

    fn validate_node(&self, node: &NodeDefinition) -> Result<(), EngineError> {
        match node.node_type {
            NodeType::Simple | NodeType::Task => {
                let executor = node.executor.as_deref().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "node '{}' declares no executor",
                        node.node_id
                    ))
                })?;
                if !self.executors.contains(executor) {
                    return Err(EngineError::Validation(format!(
                        "node '{}': executor '{executor}' is not registered",
                        node.node_id
                    )));
                }
            }
            NodeType::Loop => {
                if node.children.len() != 1 {
                    return Err(EngineError::Validation(format!(
                        "loop node '{}' must have exactly one body template",
                        node.node_id
                    )));
                }
            }
            NodeType::Parallel => {
                if node.children.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "parallel node '{}' has no branches",
                        node.node_id
                    )));
                }
            }
            NodeType::Subprocess => {
                if node.subprocess.is_none() {
                    return Err(EngineError::Validation(format!(
                        "subprocess node '{}' references no workflow",
                        node.node_id
                    )));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create and drive a workflow instance.
    ///
    /// Returns once the run settles or parks on durable retries; parked
    /// work is picked up later by the dispatch pass.
    pub async fn start(
        &self,
        reference: &DefinitionRef,
        input: Value,
        options: StartOptions,
    ) -> Result<StartOutcome, EngineError> {
        let Some(def) = self
            .repo
            .get_definition_by_ref(&reference.name, &reference.version)
            .await?
        else {
            return Err(EngineError::NotFound(format!("definition {reference}")));
        };
        self.validate_definition(&def)?;

        if let Some(max) = options.max_instances {
            let active = self.repo.count_active_by_definition(&def.id).await?;
            if active >= max {
                return Err(EngineError::ConcurrencyConflict(format!(
                    "definition {reference} already has {active} active instances (cap {max})"
                )));
            }
        }

        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_name: def.name.clone(),
            definition_version: def.version.clone(),
            status: InstanceStatus::Pending,
            input: input.clone(),
            output: None,
            variables: json!({}),
            scheduled_at: options.scheduled_at,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
            mutex_key: options.mutex_key,
            business_key: options.business_key,
            parent_instance_id: None,
            parent_node_id: None,
            engine_id: Some(self.engine_id.clone()),
            error: None,
            created_at: Utc::now(),
        };

        match self.mutex.create_exclusive(&instance).await? {
            MutexOutcome::Admitted => {}
            MutexOutcome::Conflict(holder) => {
                return Ok(StartOutcome::AlreadyRunning(holder));
            }
        }

        let root = NodeInstance {
            id: Uuid::now_v7(),
            workflow_instance_id: instance.id,
            node_id: def.root.node_id.clone(),
            node_type: def.root.node_type,
            status: NodeStatus::Pending,
            parent_node_id: None,
            child_index: None,
            loop_progress: None,
            retry_count: 0,
            max_retries: def.root.max_retries,
            run_after: None,
            input,
            output: None,
            error_details: None,
            progress: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.repo.create_node(&root).await?;

        tracing::info!(
            instance_id = %instance.id,
            definition = %reference,
            "workflow instance created"
        );

        self.run_root(&def, instance.id, root.id).await?;

        let final_state = self
            .repo
            .get_instance(&instance.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("instance {}", instance.id)))?;
        Ok(StartOutcome::Started(final_state))
    }

    /// Mark the instance running and drive its root under the workflow
    /// deadline.
    async fn run_root(
        &self,
        def: &WorkflowDefinition,
        instance_id: Uuid,
        root_node_id: Uuid,
    ) -> Result<(), EngineError> {
        self.repo
            .mark_instance_started(&instance_id, &self.engine_id)
            .await?;

        let timeout_secs = def
            .default_timeout_secs
            .unwrap_or(self.config.default_workflow_timeout_secs);
        let deadline = std::time::Duration::from_secs(timeout_secs);

        match tokio::time::timeout(deadline, self.nodes.execute_node(root_node_id)).await {
            Ok(result) => result,
            Err(_) => {
                self.nodes.cancel_instance(instance_id);
                self.repo
                    .update_instance_status_if(
                        &instance_id,
                        &[
                            InstanceStatus::Pending,
                            InstanceStatus::Running,
                            InstanceStatus::Paused,
                        ],
                        InstanceStatus::TimedOut,
                        None,
                        Some(&format!("workflow exceeded {timeout_secs}s")),
                    )
                    .await?;
                tracing::warn!(instance_id = %instance_id, timeout_secs, "workflow timed out");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resume / cancel / pause
    // -----------------------------------------------------------------------

    /// Resume a non-terminal instance on this engine.
    ///
    /// Safe to call repeatedly and safe after a crash: interrupted nodes
    /// are repaired, finished nodes are left untouched, and fan-outs never
    /// re-expand. A terminal instance is a no-op.
    pub async fn resume(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let Some(instance) = self.repo.get_instance(&instance_id).await? else {
            return Err(EngineError::NotFound(format!("instance {instance_id}")));
        };
        if instance.status.is_terminal() {
            return Ok(());
        }

        tracing::info!(instance_id = %instance_id, "resuming workflow instance");
        self.repo
            .mark_instance_started(&instance_id, &self.engine_id)
            .await?;
        self.nodes.reconcile(instance_id).await?;

        // Drive everything currently eligible. Parked retries stay parked
        // until their run_after elapses.
        let now = Utc::now();
        let all_nodes = self.repo.list_nodes(&instance_id).await?;
        for node in all_nodes {
            let eligible = match node.status {
                NodeStatus::Pending => node.run_after.is_none_or(|t| t <= now),
                NodeStatus::FailedRetry => node.run_after.is_some_and(|t| t <= now),
                _ => false,
            };
            if eligible {
                self.nodes.execute_node(node.id).await?;
            }
        }

        // The root may have settled while this instance was unowned.
        if let Some(root) = self.repo.get_root_node(&instance_id).await?
            && root.status.is_terminal()
        {
            self.nodes.on_node_terminal(root.id).await?;
        }
        Ok(())
    }

    /// Cancel a non-terminal instance. Returns whether this call settled
    /// it (false when it was already terminal).
    pub async fn cancel(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let won = self
            .repo
            .update_instance_status_if(
                &instance_id,
                &[
                    InstanceStatus::Pending,
                    InstanceStatus::Running,
                    InstanceStatus::Paused,
                ],
                InstanceStatus::Cancelled,
                None,
                Some("cancelled by request"),
            )
            .await?;
        if won {
            self.nodes.cancel_instance(instance_id);
            tracing::info!(instance_id = %instance_id, "workflow instance cancelled");
        }
        Ok(won)
    }

    /// Pause a running instance: no further nodes start until `resume`.
    /// In-flight executors are allowed to finish their current attempt.
    pub async fn pause(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let won = self
            .repo
            .update_instance_status_if(
                &instance_id,
                &[InstanceStatus::Pending, InstanceStatus::Running],
                InstanceStatus::Paused,
                None,
                None,
            )
            .await?;
        if won {
            tracing::info!(instance_id = %instance_id, "workflow instance paused");
        }
        Ok(won)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current instance record.
    pub async fn get(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.repo
            .get_instance(&instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("instance {instance_id}")))
    }

    /// All node instances of a run, in creation order.
    pub async fn nodes_of(&self, instance_id: Uuid) -> Result<Vec<NodeInstance>, EngineError> {
        Ok(self.repo.list_nodes(&instance_id).await?)
    }

    /// Run history for a business key, newest first.
    pub async fn history(
        &self,
        business_key: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.repo.list_by_business_key(business_key, limit).await?)
    }
}
