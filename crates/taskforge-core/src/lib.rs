//! Engine services and storage ports for Taskforge.
//!
//! This crate holds the orchestration logic, independent of any concrete
//! storage backend:
//!
//! - `repository`: storage traits (workflow, engine registry, schedules)
//!   plus an in-memory reference implementation used by the engine tests.
//! - `executor`: the executor contract client applications implement, the
//!   executor registry, and the per-execution context handed to executors.
//! - `engine`: the services themselves -- node execution, workflow instance
//!   lifecycle, mutex admission, the scheduler loop, and the engine
//!   instance registry.

pub mod engine;
pub mod executor;
pub mod repository;
