//! Infrastructure layer for Taskforge.
//!
//! Contains the SQLite implementations of the repository traits defined in
//! `taskforge-core`, plus [`runtime::EngineRuntime`], which wires the pools,
//! repositories, and engine services into one running engine process.

pub mod runtime;
pub mod sqlite;
