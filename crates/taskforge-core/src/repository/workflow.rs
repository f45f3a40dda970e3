//! Workflow repository trait definition.
//!
//! The storage interface for workflow definitions, workflow instances, node
//! instances, and node checkpoints. The infrastructure layer
//! (taskforge-infra) implements this trait with SQLite persistence.
//!
//! Two families of write operations carry the engine's correctness
//! guarantees and must be honored by every implementation:
//!
//! - **Compare-and-set transitions** (`transition_node`,
//!   `update_instance_status_if`, `claim_instance`): the update applies only
//!   if the row is currently in one of the expected states, and the caller
//!   learns whether it won. Concurrent engines race through these safely.
//! - **Atomic multi-row writes** (`expand_node`,
//!   `increment_loop_progress`): either every row change lands or none
//!   does. A loop expansion must never leave children without the parent's
//!   progress update, or vice versa.

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskforge_types::error::RepositoryError;
use taskforge_types::workflow::{
    InstanceStatus, LoopPhase, LoopProgress, NodeInstance, NodeStatus, WorkflowDefinition,
    WorkflowInstance,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Node patch
// ---------------------------------------------------------------------------

/// Field updates carried along a node status transition.
///
/// `transition_node` applies these only when the compare-and-set wins, so a
/// losing engine never clobbers the winner's output or retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    /// Output to record (completion).
    pub output: Option<Value>,
    /// Error details to record (failure or retry).
    pub error_details: Option<String>,
    /// Earliest next dispatch time (durable retry).
    pub run_after: Option<DateTime<Utc>>,
    /// Bump `retry_count` by one as part of the transition.
    pub increment_retry: bool,
}

impl NodePatch {
    /// A patch recording successful output.
    pub fn completed(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// A patch recording a terminal failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error_details: Some(error.into()),
            ..Self::default()
        }
    }

    /// A patch parking the node for a durable retry at `run_after`.
    pub fn retry_at(error: impl Into<String>, run_after: DateTime<Utc>) -> Self {
        Self {
            error_details: Some(error.into()),
            run_after: Some(run_after),
            increment_retry: true,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository
// ---------------------------------------------------------------------------

/// Repository trait for workflow persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get a workflow definition by `(name, version)`.
    fn get_definition_by_ref(
        &self,
        name: &str,
        version: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all definitions, newest first.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Workflow instances
    // -----------------------------------------------------------------------

    /// Create a workflow instance record.
    ///
    /// When the instance carries a `mutex_key`, the store must reject the
    /// insert with [`RepositoryError::Conflict`] if another non-terminal
    /// instance already holds that key. The store is the arbiter of this
    /// race; callers treat `Conflict` exactly like a pre-check hit.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow instance by its UUID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Unconditionally update an instance's status and completion fields.
    /// Sets `completed_at` when `status` is terminal.
    fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Compare-and-set status update. Applies only if the current status is
    /// one of `expected`; returns whether the update won.
    fn update_instance_status_if(
        &self,
        id: &Uuid,
        expected: &[InstanceStatus],
        to: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark the instance started: status Running, `started_at` set once.
    fn mark_instance_started(
        &self,
        id: &Uuid,
        engine_id: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the instance's shared variables object.
    fn set_instance_variables(
        &self,
        id: &Uuid,
        variables: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Find the non-terminal instance holding `mutex_key`, if any.
    fn find_active_by_mutex_key(
        &self,
        mutex_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Count non-terminal instances of a definition (schedule caps).
    fn count_active_by_definition(
        &self,
        definition_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    /// History lookup by application business key, newest first.
    fn list_by_business_key(
        &self,
        business_key: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Non-terminal instances owned by the given engine (recovery input).
    fn list_active_owned_by(
        &self,
        engine_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// The child instance spawned by a subprocess node, if any.
    fn find_subprocess_instance(
        &self,
        parent_node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Conditionally take ownership of an instance for recovery.
    ///
    /// Applies only if the instance is still non-terminal and (when
    /// `from_engine` is given) still owned by that engine. Returns whether
    /// the claim won; losing claimants must skip the instance.
    fn claim_instance(
        &self,
        id: &Uuid,
        new_engine_id: &str,
        from_engine: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Node instances
    // -----------------------------------------------------------------------

    /// Create a node instance record.
    fn create_node(
        &self,
        node: &NodeInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a node instance by its UUID.
    fn get_node(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<NodeInstance>, RepositoryError>> + Send;

    /// The root node of a workflow instance (`parent_node_id IS NULL`).
    fn get_root_node(
        &self,
        workflow_instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<NodeInstance>, RepositoryError>> + Send;

    /// All node instances of a workflow instance, in creation order.
    fn list_nodes(
        &self,
        workflow_instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;

    /// Children of a node, ordered by `child_index`.
    fn list_children(
        &self,
        parent_node_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;

    /// Compare-and-set node status transition.
    ///
    /// Applies `to` and `patch` only if the current status is one of
    /// `expected`. Sets `started_at` on the first transition to Running and
    /// `completed_at` on terminal transitions. Returns whether the
    /// transition won.
    fn transition_node(
        &self,
        id: &Uuid,
        expected: &[NodeStatus],
        to: NodeStatus,
        patch: NodePatch,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Atomically materialize a loop/parallel fan-out.
    ///
    /// In one transaction: insert every child row and move the parent's
    /// progress to `Executing` with `total_count = children.len()`. On any
    /// failure nothing is persisted.
    fn expand_node(
        &self,
        parent_id: &Uuid,
        children: &[NodeInstance],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically bump the parent's loop counters (in-place arithmetic, not
    /// read-modify-write) and return the updated progress.
    fn increment_loop_progress(
        &self,
        parent_id: &Uuid,
        completed_delta: u32,
        failed_delta: u32,
    ) -> impl std::future::Future<Output = Result<LoopProgress, RepositoryError>> + Send;

    /// Record the executor's latest progress snapshot on a node. Advisory
    /// data for observers; never part of a status transition.
    fn set_node_progress(
        &self,
        id: &Uuid,
        progress: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Set the loop phase on a fan-out parent.
    fn set_loop_phase(
        &self,
        parent_id: &Uuid,
        phase: LoopPhase,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Nodes eligible for dispatch: status Pending or FailedRetry with
    /// `run_after <= now`, oldest first, at most `limit` rows.
    fn find_due_nodes(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Node checkpoints
    // -----------------------------------------------------------------------

    /// Upsert an executor checkpoint for a node instance.
    fn save_checkpoint(
        &self,
        node_instance_id: &Uuid,
        state: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the checkpoint for a node instance, if any.
    fn load_checkpoint(
        &self,
        node_instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Delete the checkpoint for a node instance. Returns `true` if one
    /// existed.
    fn delete_checkpoint(
        &self,
        node_instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
