//! Observability for Taskforge engine processes.
//!
//! Currently just tracing subscriber setup; engine crates emit plain
//! `tracing` events and spans and stay agnostic of the output format.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, init_tracing};
