//! Engine configuration.
//!
//! All intervals and limits the scheduler, registry, and dispatcher use,
//! with serde defaults so a minimal config file (or none) works.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Engine config
// ---------------------------------------------------------------------------

/// Tunable engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database path/URL. None means the caller supplies a pool.
    #[serde(default)]
    pub database_url: Option<String>,

    /// How often the schedule scan pass runs, in seconds.
    #[serde(default = "default_schedule_scan_interval_secs")]
    pub schedule_scan_interval_secs: u64,

    /// How often the due-node dispatch pass runs, in milliseconds.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// How often the recovery pass runs, in seconds.
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,

    /// Heartbeats older than this mark an engine stale.
    #[serde(default = "default_stale_engine_timeout_secs")]
    pub stale_engine_timeout_secs: u64,

    /// Heartbeat publish interval, in seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Maximum concurrent node executions per engine.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum due nodes fetched per dispatch pass.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: u32,

    /// Node timeout when neither node nor definition sets one, in seconds.
    #[serde(default = "default_node_timeout_secs")]
    pub default_node_timeout_secs: u64,

    /// Workflow timeout when the definition sets none, in seconds.
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_workflow_timeout_secs: u64,
}

fn default_schedule_scan_interval_secs() -> u64 {
    30
}
fn default_dispatch_interval_ms() -> u64 {
    500
}
fn default_recovery_interval_secs() -> u64 {
    60
}
fn default_stale_engine_timeout_secs() -> u64 {
    300
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    8
}
fn default_dispatch_batch_size() -> u32 {
    32
}
fn default_node_timeout_secs() -> u64 {
    300
}
fn default_workflow_timeout_secs() -> u64 {
    1800
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            schedule_scan_interval_secs: default_schedule_scan_interval_secs(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            recovery_interval_secs: default_recovery_interval_secs(),
            stale_engine_timeout_secs: default_stale_engine_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_concurrency: default_max_concurrency(),
            dispatch_batch_size: default_dispatch_batch_size(),
            default_node_timeout_secs: default_node_timeout_secs(),
            default_workflow_timeout_secs: default_workflow_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.schedule_scan_interval_secs, 30);
        assert_eq!(c.dispatch_interval_ms, 500);
        assert_eq!(c.stale_engine_timeout_secs, 300);
        assert_eq!(c.max_concurrency, 8);
        assert!(c.database_url.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
database_url = "sqlite://taskforge.db"
max_concurrency = 16
stale_engine_timeout_secs = 120
"#;
        let c: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(c.database_url.as_deref(), Some("sqlite://taskforge.db"));
        assert_eq!(c.max_concurrency, 16);
        assert_eq!(c.stale_engine_timeout_secs, 120);
        // untouched fields fall back
        assert_eq!(c.dispatch_batch_size, 32);
        assert_eq!(c.default_node_timeout_secs, 300);
    }

    #[test]
    fn test_empty_toml_is_valid() {
        let c: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(c.heartbeat_interval_secs, 30);
    }
}
