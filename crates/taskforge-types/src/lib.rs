//! Shared domain types for the Taskforge orchestration engine.
//!
//! This crate contains the core domain types used across the engine:
//! workflow definitions and instances, node instances, engine registry
//! records, schedules, configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod workflow;
