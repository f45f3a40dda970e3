//! Workflow domain types for Taskforge.
//!
//! Defines the canonical representation of workflows: the immutable
//! definition tree (`WorkflowDefinition` / `NodeDefinition`), the runtime
//! execution records (`WorkflowInstance` / `NodeInstance`), loop/parallel
//! fan-out progress tracking, and retry policies.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definition reference
// ---------------------------------------------------------------------------

/// A reference to a published workflow definition.
///
/// Definitions are immutable once published and identified by `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    /// Workflow definition name.
    pub name: String,
    /// Definition version string (e.g. "1.0.0").
    pub version: String,
}

impl std::fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

// ---------------------------------------------------------------------------
// Workflow Definition (immutable template)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// A definition is a tree of node templates rooted at `root`. It is the
/// single source of truth for a workflow's shape and is immutable once
/// published; new behavior means a new `(name, version)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save. Definition files may omit it.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Definition version string.
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The root node template. Deeper levels materialize lazily at runtime
    /// as loop/parallel nodes expand.
    pub root: NodeDefinition,
    /// Per-workflow timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
    /// Retry policy applied to nodes that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryPolicy>,
    /// Extensible metadata (for future use / custom integrations).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// The `(name, version)` reference identifying this definition.
    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    /// Find a node template by its `node_id` anywhere in the tree.
    pub fn find_node(&self, node_id: &str) -> Option<&NodeDefinition> {
        fn walk<'a>(node: &'a NodeDefinition, node_id: &str) -> Option<&'a NodeDefinition> {
            if node.node_id == node_id {
                return Some(node);
            }
            node.children.iter().find_map(|c| walk(c, node_id))
        }
        walk(&self.root, node_id)
    }
}

// ---------------------------------------------------------------------------
// Node Definition
// ---------------------------------------------------------------------------

/// The kind of node in a workflow tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// A single executor invocation.
    Simple,
    /// Like `Simple`; kept as a distinct kind so definitions can mark
    /// long-running business tasks separately from glue steps.
    Task,
    /// Fan-out over an iteration data set; one child per item.
    Loop,
    /// Fan-out over branch templates; children run concurrently.
    Parallel,
    /// Runs another workflow definition as a child instance.
    Subprocess,
}

/// Failure propagation policy for loop/parallel nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A single failed child fails the parent.
    #[default]
    FailFast,
    /// The parent waits for every child to settle; it fails only if any
    /// child failed, and its output records which indices failed.
    ContinueOnPartial,
}

/// A single node template within a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node ID, unique within the definition (e.g. "sync-rosters").
    pub node_id: String,
    /// Human-readable node name.
    pub name: String,
    /// The kind of node.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Executor name resolved through the executor registry.
    /// Required for simple/task nodes; ignored for structural nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Static input merged into the node instance input at materialization.
    #[serde(default)]
    pub input: Value,
    /// Node-level timeout in seconds (falls back to the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum retry attempts after the first execution.
    #[serde(default)]
    pub max_retries: u32,
    /// Retry backoff policy (falls back to the definition default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Optional JEXL condition evaluated against instance variables.
    /// A false condition skips the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Failure propagation policy for loop/parallel nodes.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Child templates. For loop nodes the first child is the per-item body
    /// template; for parallel nodes each child is one branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDefinition>,
    /// Referenced workflow for subprocess nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprocess: Option<DefinitionRef>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Backoff policy mapping a retry attempt number to a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// The same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// `base * 2^(attempt-1)`, optionally capped.
    Exponential {
        /// Delay before the first retry, in milliseconds.
        base_delay_ms: u64,
        /// Upper bound on the computed delay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_delay_ms: Option<u64>,
    },
}

// ---------------------------------------------------------------------------
// Workflow Instance (runtime record)
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl InstanceStatus {
    /// Terminal states are final and immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Cancelled
                | InstanceStatus::TimedOut
        )
    }
}

/// One runtime execution record for an entire workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// ID of the workflow definition being executed.
    pub definition_id: Uuid,
    /// Definition name (denormalized for display and history queries).
    pub definition_name: String,
    /// Definition version.
    pub definition_version: String,
    /// Current instance status.
    pub status: InstanceStatus,
    /// Trigger input for this run.
    pub input: Value,
    /// Final output, set at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Shared mutable variables visible to executors (JSON object).
    pub variables: Value,
    /// When the run was scheduled to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the root node actually started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the instance reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Workflow-level retry count.
    pub retry_count: u32,
    /// Workflow-level retry budget.
    pub max_retries: u32,
    /// Mutex key: at most one non-terminal instance may exist per key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutex_key: Option<String>,
    /// Application-supplied key for history lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    /// Parent instance for sub-workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,
    /// The subprocess node in the parent that spawned this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<Uuid>,
    /// Engine process currently owning this instance (recovery signal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_id: Option<String>,
    /// Error message if the instance failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Node Instance (runtime record)
// ---------------------------------------------------------------------------

/// Status of an individual node instance.
///
/// Strict forward-only state machine; the only backward edge is the explicit
/// `FailedRetry -> Running` transition, which increments `retry_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    FailedRetry,
}

impl NodeStatus {
    /// Terminal states: `Completed` and `Failed`. `FailedRetry` is transient.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }
}

/// Phase of a loop/parallel node's fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// Children not yet created.
    Pending,
    /// Children created; waiting for them to settle.
    Executing,
    Completed,
    Failed,
}

/// Progress counters for a loop/parallel node's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopProgress {
    /// Fan-out phase.
    pub status: LoopPhase,
    /// Number of children created by the expansion.
    pub total_count: u32,
    /// Children that reached `Completed`.
    pub completed_count: u32,
    /// Children that reached `Failed`.
    pub failed_count: u32,
}

impl LoopProgress {
    /// A fresh pre-expansion progress record.
    pub fn pending() -> Self {
        Self {
            status: LoopPhase::Pending,
            total_count: 0,
            completed_count: 0,
            failed_count: 0,
        }
    }

    /// `completed_count + failed_count <= total_count` must hold at every
    /// observed point in time.
    pub fn is_consistent(&self) -> bool {
        self.completed_count + self.failed_count <= self.total_count
    }

    /// Every child has reached a terminal state.
    pub fn all_settled(&self) -> bool {
        self.total_count > 0 && self.completed_count + self.failed_count == self.total_count
    }
}

/// One runtime execution record for a step in a workflow instance's tree.
///
/// The tree is arena-style: parent/child relationships are expressed as
/// foreign-key fields, never as in-memory back-references, so any engine
/// process can reconstruct it from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    /// UUIDv7 node instance ID.
    pub id: Uuid,
    /// Owning workflow instance.
    pub workflow_instance_id: Uuid,
    /// Template reference (`NodeDefinition.node_id`).
    pub node_id: String,
    /// The kind of node.
    pub node_type: NodeType,
    /// Current node status.
    pub status: NodeStatus,
    /// Parent node instance (None for the root).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<Uuid>,
    /// Position among siblings (0..N-1); None for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_index: Option<u32>,
    /// Fan-out progress; set only on loop/parallel nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_progress: Option<LoopProgress>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry budget from the template.
    pub max_retries: u32,
    /// Earliest time this node is eligible for (re-)dispatch. Retries are
    /// durable rows with a run-after timestamp, not in-process timers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_after: Option<DateTime<Utc>>,
    /// Effective input for this node instance.
    pub input: Value,
    /// Output data, set at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error details if the node failed (or is awaiting retry).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    /// Latest progress snapshot reported by the executor mid-run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    /// When execution first started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
