//! Engine services.
//!
//! - [`node`]: node execution -- the state machine for a single node,
//!   including loop/parallel fan-out and subprocess spawning.
//! - [`instance`]: workflow instance lifecycle (start, resume, cancel,
//!   status derivation, history).
//! - [`mutex`]: mutex-keyed admission control.
//! - [`retry`]: backoff computation and retry gating.
//! - [`scheduler`]: the cooperative loop running schedule scans, due-node
//!   dispatch, and stale-engine recovery.
//! - [`registry`]: engine instance registration and heartbeating.

pub mod instance;
pub mod mutex;
pub mod node;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use instance::{StartOptions, StartOutcome, WorkflowInstanceService};
pub use mutex::{MutexOutcome, MutexWorkflowManager};
pub use node::NodeExecutionService;
pub use registry::{EngineRegistryService, LoadProvider};
pub use retry::Backoff;
pub use scheduler::{SchedulerService, next_occurrence};
