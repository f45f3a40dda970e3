//! Storage ports for the engine.
//!
//! Three trait families, implemented by `taskforge-infra` with SQLite and by
//! the in-memory reference implementation in [`memory`]:
//!
//! - [`WorkflowRepository`]: definitions, instances, node instances,
//!   checkpoints.
//! - [`EngineRepository`]: the engine instance registry.
//! - [`ScheduleRepository`]: durable schedules.

pub mod engine;
pub mod memory;
pub mod schedule;
pub mod workflow;

pub use engine::EngineRepository;
pub use schedule::ScheduleRepository;
pub use workflow::{NodePatch, WorkflowRepository};
