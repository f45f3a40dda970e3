//! Engine instance registry types.
//!
//! Every engine process registers itself in the shared store and heartbeats
//! while alive. Heartbeat staleness is the sole liveness signal used by the
//! recovery pass; there is no cross-engine RPC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Engine status
// ---------------------------------------------------------------------------

/// Lifecycle status of an engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Registered and heartbeating; eligible for dispatch.
    Active,
    /// Deregistered cleanly on shutdown.
    Inactive,
    /// Still heartbeating but not accepting new work.
    Maintenance,
}

// ---------------------------------------------------------------------------
// Load snapshot
// ---------------------------------------------------------------------------

/// Coarse load snapshot reported with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLoad {
    /// Workflow instances currently owned by this engine.
    pub running_instances: u32,
    /// Node executions currently in flight.
    pub running_nodes: u32,
}

// ---------------------------------------------------------------------------
// Engine instance record
// ---------------------------------------------------------------------------

/// A registered engine process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInstance {
    /// Stable engine identifier, unique per process (e.g. "host-a:7f3c").
    pub instance_id: String,
    /// Hostname the engine runs on.
    pub hostname: String,
    /// Current lifecycle status.
    pub status: EngineStatus,
    /// Executor names this engine can run.
    pub supported_executors: Vec<String>,
    /// Last reported load snapshot.
    pub load: EngineLoad,
    /// When the process registered.
    pub started_at: DateTime<Utc>,
    /// Last heartbeat timestamp.
    pub last_heartbeat: DateTime<Utc>,
}

impl EngineInstance {
    /// Whether this engine's heartbeat is older than `cutoff`.
    ///
    /// Only Active/Maintenance engines can be stale; an Inactive engine
    /// already handed its work back on shutdown.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status != EngineStatus::Inactive && self.last_heartbeat < cutoff
    }

    /// Whether this engine advertises the given executor.
    pub fn supports(&self, executor: &str) -> bool {
        self.supported_executors.iter().any(|e| e == executor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
