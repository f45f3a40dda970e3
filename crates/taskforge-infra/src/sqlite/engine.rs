//! SQLite engine registry repository.
//!
//! One row per engine process. Registration is an upsert so a restarted
//! process with the same instance ID replaces its old row; heartbeats
//! update the load snapshot and `last_heartbeat` in place.

use chrono::{DateTime, Utc};
use sqlx::Row;
use taskforge_core::repository::engine::EngineRepository;
use taskforge_types::engine::{EngineInstance, EngineLoad, EngineStatus};
use taskforge_types::error::RepositoryError;

use super::pool::DatabasePool;
use super::{enum_from_str, enum_str, format_datetime, json_from_str, parse_datetime};

/// SQLite-backed implementation of `EngineRepository`.
pub struct SqliteEngineRepository {
    pool: DatabasePool,
}

impl SqliteEngineRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct EngineRow {
    instance_id: String,
    hostname: String,
    status: String,
    supported_executors: String,
    running_instances: i64,
    running_nodes: i64,
    started_at: String,
    last_heartbeat: String,
}

impl EngineRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            hostname: row.try_get("hostname")?,
            status: row.try_get("status")?,
            supported_executors: row.try_get("supported_executors")?,
            running_instances: row.try_get("running_instances")?,
            running_nodes: row.try_get("running_nodes")?,
            started_at: row.try_get("started_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }

    fn into_engine(self) -> Result<EngineInstance, RepositoryError> {
        let executors = json_from_str(&self.supported_executors)?;
        let supported_executors = serde_json::from_value(executors)
            .map_err(|e| RepositoryError::Query(format!("invalid executor list: {e}")))?;
        Ok(EngineInstance {
            instance_id: self.instance_id,
            hostname: self.hostname,
            status: enum_from_str(&self.status)?,
            supported_executors,
            load: EngineLoad {
                running_instances: self.running_instances as u32,
                running_nodes: self.running_nodes as u32,
            },
            started_at: parse_datetime(&self.started_at)?,
            last_heartbeat: parse_datetime(&self.last_heartbeat)?,
        })
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl EngineRepository for SqliteEngineRepository {
    async fn register(&self, engine: &EngineInstance) -> Result<(), RepositoryError> {
        let executors = serde_json::to_string(&engine.supported_executors)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO engine_instances
               (instance_id, hostname, status, supported_executors, running_instances,
                running_nodes, started_at, last_heartbeat)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 hostname = excluded.hostname,
                 status = excluded.status,
                 supported_executors = excluded.supported_executors,
                 running_instances = excluded.running_instances,
                 running_nodes = excluded.running_nodes,
                 started_at = excluded.started_at,
                 last_heartbeat = excluded.last_heartbeat"#,
        )
        .bind(&engine.instance_id)
        .bind(&engine.hostname)
        .bind(enum_str(&engine.status)?)
        .bind(&executors)
        .bind(engine.load.running_instances as i64)
        .bind(engine.load.running_nodes as i64)
        .bind(format_datetime(&engine.started_at))
        .bind(format_datetime(&engine.last_heartbeat))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn heartbeat(
        &self,
        instance_id: &str,
        load: EngineLoad,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE engine_instances SET running_instances = ?, running_nodes = ?, \
             last_heartbeat = ? WHERE instance_id = ?",
        )
        .bind(load.running_instances as i64)
        .bind(load.running_nodes as i64)
        .bind(format_datetime(&at))
        .bind(instance_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("engine {instance_id}")));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: EngineStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE engine_instances SET status = ? WHERE instance_id = ?")
            .bind(enum_str(&status)?)
            .bind(instance_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("engine {instance_id}")));
        }
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<Option<EngineInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM engine_instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| EngineRow::from_row(&row).map_err(query_err)?.into_engine())
            .transpose()
    }

    async fn list(&self) -> Result<Vec<EngineInstance>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM engine_instances ORDER BY instance_id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| EngineRow::from_row(row).map_err(query_err)?.into_engine())
            .collect()
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EngineInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM engine_instances \
             WHERE status != 'inactive' AND last_heartbeat < ? \
             ORDER BY last_heartbeat ASC",
        )
        .bind(format_datetime(&cutoff))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| EngineRow::from_row(row).map_err(query_err)?.into_engine())
            .collect()
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM engine_instances WHERE instance_id = ?")
            .bind(instance_id)
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

    async fn test_repo() -> SqliteEngineRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteEngineRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn engine(instance_id: &str) -> EngineInstance {
        let now = Utc::now();
        EngineInstance {
            instance_id: instance_id.to_string(),
            hostname: "host-a".to_string(),
            status: EngineStatus::Active,
            supported_executors: vec!["roster-sync".to_string(), "http-call".to_string()],
            load: EngineLoad::default(),
            started_at: now,
            last_heartbeat: now,
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let repo = test_repo().await;
        repo.register(&engine("host-a:1")).await.unwrap();

        let loaded = repo.get("host-a:1").await.unwrap().unwrap();
        assert_eq!(loaded.status, EngineStatus::Active);
        assert!(loaded.supports("roster-sync"));
        assert!(repo.get("host-b:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_replaces_existing_row() {
        let repo = test_repo().await;
        let mut e = engine("host-a:1");
        repo.register(&e).await.unwrap();

        e.status = EngineStatus::Maintenance;
        e.supported_executors = vec!["http-call".to_string()];
        repo.register(&e).await.unwrap();

        let loaded = repo.get("host-a:1").await.unwrap().unwrap();
        assert_eq!(loaded.status, EngineStatus::Maintenance);
        assert_eq!(loaded.supported_executors, vec!["http-call".to_string()]);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_load_and_timestamp() {
        let repo = test_repo().await;
        repo.register(&engine("host-a:1")).await.unwrap();

        let at = Utc::now() + Duration::seconds(30);
        let load = EngineLoad {
            running_instances: 3,
            running_nodes: 7,
        };
        repo.heartbeat("host-a:1", load, at).await.unwrap();

        let loaded = repo.get("host-a:1").await.unwrap().unwrap();
        assert_eq!(loaded.load, load);
        assert_eq!(loaded.last_heartbeat, at);

        let err = repo.heartbeat("missing", load, at).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_find_stale_skips_inactive() {
        let repo = test_repo().await;
        let now = Utc::now();

        let mut stale = engine("host-a:1");
        stale.last_heartbeat = now - Duration::hours(1);
        repo.register(&stale).await.unwrap();

        let mut retired = engine("host-b:1");
        retired.status = EngineStatus::Inactive;
        retired.last_heartbeat = now - Duration::hours(1);
        repo.register(&retired).await.unwrap();

        repo.register(&engine("host-c:1")).await.unwrap();

        let cutoff = now - Duration::minutes(5);
        let found = repo.find_stale(cutoff).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, "host-a:1");
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = test_repo().await;
        repo.register(&engine("host-a:1")).await.unwrap();

        assert!(repo.delete("host-a:1").await.unwrap());
        assert!(!repo.delete("host-a:1").await.unwrap());
        assert!(repo.get("host-a:1").await.unwrap().is_none());
    }
}
