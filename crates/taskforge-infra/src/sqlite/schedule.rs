//! SQLite schedule repository.
//!
//! Schedules are durable rows with a precomputed `next_run_at`; the
//! scheduler's scan pass runs the `find_due` query instead of keeping
//! per-schedule timers in memory. The trigger is stored as a JSON blob,
//! the workflow reference as two columns for readable queries.

use chrono::{DateTime, Utc};
use sqlx::Row;
use taskforge_core::repository::schedule::ScheduleRepository;
use taskforge_types::error::RepositoryError;
use taskforge_types::schedule::ScheduleDefinition;
use taskforge_types::workflow::DefinitionRef;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, json_from_str, json_str, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `ScheduleRepository`.
pub struct SqliteScheduleRepository {
    pool: DatabasePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct ScheduleRow {
    id: String,
    name: String,
    workflow_name: String,
    workflow_version: String,
    trigger: String,
    input: String,
    mutex_key: Option<String>,
    max_instances: Option<i64>,
    enabled: i64,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    created_at: String,
}

impl ScheduleRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get("workflow_version")?,
            trigger: row.try_get("trigger")?,
            input: row.try_get("input")?,
            mutex_key: row.try_get("mutex_key")?,
            max_instances: row.try_get("max_instances")?,
            enabled: row.try_get("enabled")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_schedule(self) -> Result<ScheduleDefinition, RepositoryError> {
        let trigger = serde_json::from_str(&self.trigger)
            .map_err(|e| RepositoryError::Query(format!("invalid trigger JSON: {e}")))?;
        Ok(ScheduleDefinition {
            id: parse_uuid(&self.id)?,
            name: self.name,
            workflow: DefinitionRef {
                name: self.workflow_name,
                version: self.workflow_version,
            },
            trigger,
            input: json_from_str(&self.input)?,
            mutex_key: self.mutex_key,
            max_instances: self.max_instances.map(|n| n as u32),
            enabled: self.enabled != 0,
            next_run_at: self.next_run_at.as_deref().map(parse_datetime).transpose()?,
            last_run_at: self.last_run_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl ScheduleRepository for SqliteScheduleRepository {
    async fn save(&self, schedule: &ScheduleDefinition) -> Result<(), RepositoryError> {
        let trigger = serde_json::to_string(&schedule.trigger)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO schedules
               (id, name, workflow_name, workflow_version, trigger, input, mutex_key,
                max_instances, enabled, next_run_at, last_run_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 workflow_name = excluded.workflow_name,
                 workflow_version = excluded.workflow_version,
                 trigger = excluded.trigger,
                 input = excluded.input,
                 mutex_key = excluded.mutex_key,
                 max_instances = excluded.max_instances,
                 enabled = excluded.enabled,
                 next_run_at = excluded.next_run_at,
                 last_run_at = excluded.last_run_at"#,
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.name)
        .bind(&schedule.workflow.name)
        .bind(&schedule.workflow.version)
        .bind(&trigger)
        .bind(json_str(&schedule.input)?)
        .bind(&schedule.mutex_key)
        .bind(schedule.max_instances.map(|n| n as i64))
        .bind(schedule.enabled as i64)
        .bind(schedule.next_run_at.as_ref().map(format_datetime))
        .bind(schedule.last_run_at.as_ref().map(format_datetime))
        .bind(format_datetime(&schedule.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ScheduleDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| ScheduleRow::from_row(&row).map_err(query_err)?.into_schedule())
            .transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| ScheduleRow::from_row(&row).map_err(query_err)?.into_schedule())
            .transpose()
    }

    async fn list(&self) -> Result<Vec<ScheduleDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| ScheduleRow::from_row(row).map_err(query_err)?.into_schedule())
            .collect()
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduleDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM schedules \
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ? \
             ORDER BY next_run_at ASC LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| ScheduleRow::from_row(row).map_err(query_err)?.into_schedule())
            .collect()
    }

    async fn mark_fired(
        &self,
        id: &Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE schedules SET last_run_at = ?, next_run_at = ? WHERE id = ?")
                .bind(format_datetime(&last_run_at))
                .bind(next_run_at.as_ref().map(format_datetime))
                .bind(id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    async fn set_enabled(&self, id: &Uuid, enabled: bool) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE schedules SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use taskforge_types::schedule::TriggerSpec;

    async fn test_repo() -> SqliteScheduleRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteScheduleRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn schedule(name: &str, next_run_at: Option<DateTime<Utc>>) -> ScheduleDefinition {
        ScheduleDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            workflow: DefinitionRef {
                name: "roster-full-sync".to_string(),
                version: "1.0".to_string(),
            },
            trigger: TriggerSpec::Cron {
                expression: "0 0 2 * * *".to_string(),
            },
            input: json!({"scope": "all"}),
            mutex_key: None,
            max_instances: Some(1),
            enabled: true,
            next_run_at,
            last_run_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let repo = test_repo().await;
        let s = schedule("nightly", Some(Utc::now()));
        repo.save(&s).await.unwrap();

        let loaded = repo.get(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.workflow.name, "roster-full-sync");
        assert_eq!(
            loaded.trigger,
            TriggerSpec::Cron {
                expression: "0 0 2 * * *".to_string()
            }
        );
        assert_eq!(loaded.input["scope"], "all");
        assert_eq!(loaded.max_instances, Some(1));

        let by_name = repo.get_by_name("nightly").await.unwrap().unwrap();
        assert_eq!(by_name.id, s.id);
    }

    #[tokio::test]
    async fn test_find_due_respects_enabled_and_time() {
        let repo = test_repo().await;
        let now = Utc::now();

        repo.save(&schedule("due", Some(now - Duration::minutes(1))))
            .await
            .unwrap();
        repo.save(&schedule("future", Some(now + Duration::hours(1))))
            .await
            .unwrap();
        let mut disabled = schedule("disabled", Some(now - Duration::minutes(1)));
        disabled.enabled = false;
        repo.save(&disabled).await.unwrap();
        repo.save(&schedule("unscheduled", None)).await.unwrap();

        let due = repo.find_due(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "due");
    }

    #[tokio::test]
    async fn test_mark_fired_advances_occurrence() {
        let repo = test_repo().await;
        let now = Utc::now();
        let s = schedule("nightly", Some(now));
        repo.save(&s).await.unwrap();

        let next = now + Duration::hours(24);
        repo.mark_fired(&s.id, now, Some(next)).await.unwrap();

        let loaded = repo.get(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_run_at, Some(now));
        assert_eq!(loaded.next_run_at, Some(next));
        assert!(repo.find_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_enabled_and_delete() {
        let repo = test_repo().await;
        let s = schedule("nightly", Some(Utc::now()));
        repo.save(&s).await.unwrap();

        repo.set_enabled(&s.id, false).await.unwrap();
        assert!(!repo.get(&s.id).await.unwrap().unwrap().enabled);

        assert!(repo.delete(&s.id).await.unwrap());
        assert!(!repo.delete(&s.id).await.unwrap());

        let err = repo.set_enabled(&s.id, true).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
