//! Schedule definitions.
//!
//! A schedule binds a trigger (cron expression or fixed interval) to a
//! workflow definition. Schedules are durable rows with a precomputed
//! `next_run_at`; the scheduler scans for due rows rather than keeping
//! per-schedule in-process timers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::DefinitionRef;

// ---------------------------------------------------------------------------
// Trigger specification
// ---------------------------------------------------------------------------

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Standard cron expression.
    Cron {
        /// Five or six field cron expression (e.g. "0 */5 * * * *").
        expression: String,
    },
    /// Fixed interval between occurrences.
    Interval {
        /// Seconds between occurrences.
        every_secs: u64,
    },
}

// ---------------------------------------------------------------------------
// Schedule definition
// ---------------------------------------------------------------------------

/// A durable schedule row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// UUIDv7 schedule ID.
    pub id: Uuid,
    /// Schedule name, unique.
    pub name: String,
    /// Workflow definition to trigger.
    pub workflow: DefinitionRef,
    /// Trigger timing.
    pub trigger: TriggerSpec,
    /// Input passed to each triggered run.
    #[serde(default)]
    pub input: Value,
    /// Mutex key applied to triggered runs. Defaults to the schedule name
    /// so overlapping occurrences of one schedule collapse into a conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutex_key: Option<String>,
    /// Cap on concurrent non-terminal instances of the target definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u32>,
    /// Whether the schedule currently fires.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Next computed occurrence; None until first computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last time the schedule actually fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleDefinition {
    /// The mutex key applied to runs triggered by this schedule.
    pub fn effective_mutex_key(&self) -> &str {
        self.mutex_key.as_deref().unwrap_or(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(mutex_key: Option<&str>) -> ScheduleDefinition {
        ScheduleDefinition {
            id: Uuid::now_v7(),
            name: "nightly-roster-sync".to_string(),
            workflow: DefinitionRef {
                name: "roster-full-sync".to_string(),
                version: "1.2".to_string(),
            },
            trigger: TriggerSpec::Cron {
                expression: "0 0 2 * * *".to_string(),
            },
            input: serde_json::json!({"scope": "all"}),
            mutex_key: mutex_key.map(String::from),
            max_instances: Some(1),
            enabled: true,
            next_run_at: None,
            last_run_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_effective_mutex_key_defaults_to_name() {
        assert_eq!(schedule(None).effective_mutex_key(), "nightly-roster-sync");
        assert_eq!(schedule(Some("rosters")).effective_mutex_key(), "rosters");
    }

    #[test]
    fn test_trigger_spec_serde() {
        let cron = TriggerSpec::Cron {
            expression: "0 */5 * * * *".to_string(),
        };
        let json = serde_json::to_string(&cron).unwrap();
        assert!(json.contains("\"type\":\"cron\""));
        assert_eq!(serde_json::from_str::<TriggerSpec>(&json).unwrap(), cron);

        let interval = TriggerSpec::Interval { every_secs: 300 };
        let json = serde_json::to_string(&interval).unwrap();
        assert!(json.contains("\"type\":\"interval\""));
        assert_eq!(
            serde_json::from_str::<TriggerSpec>(&json).unwrap(),
            interval
        );
    }

    #[test]
    fn test_schedule_yaml_defaults() {
        let yaml = r#"
id: "01938e90-0000-7000-8000-000000000002"
name: weekly-report
workflow:
  name: report-gen
  version: "1.0"
trigger:
  type: interval
  every_secs: 604800
created_at: "2026-08-01T00:00:00Z"
"#;
        let s: ScheduleDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(s.enabled);
        assert!(s.mutex_key.is_none());
        assert_eq!(s.effective_mutex_key(), "weekly-report");
    }
}
