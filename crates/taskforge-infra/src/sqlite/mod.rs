//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools. Compare-and-set transitions become
//! conditional UPDATEs; mutex admission is arbitrated by a partial unique
//! index; fan-out expansion runs in one transaction on the writer pool.

pub mod engine;
pub mod pool;
pub mod schedule;
pub mod workflow;

pub use engine::SqliteEngineRepository;
pub use pool::DatabasePool;
pub use schedule::SqliteScheduleRepository;
pub use workflow::SqliteWorkflowRepository;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use taskforge_types::error::RepositoryError;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Shared row helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Serialize a serde unit enum to its snake_case wire string.
pub(crate) fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .ok_or_else(|| RepositoryError::Serialization("enum is not a plain string".to_string()))
}

/// Parse a stored snake_case string back into a serde unit enum.
pub(crate) fn enum_from_str<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid enum value: {s}")))
}

/// Render a status slice as a quoted SQL IN-list. Values come from serde
/// unit enums, never from user input.
pub(crate) fn status_in_list<T: Serialize>(statuses: &[T]) -> Result<String, RepositoryError> {
    let parts = statuses
        .iter()
        .map(enum_str)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", "))
}

pub(crate) fn json_str(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

pub(crate) fn json_from_str(s: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid JSON: {e}")))
}
