//! SQLite connection pools for the engine's persistence layer.
//!
//! The engine's write paths are compare-and-set updates and small
//! transactions, so all writes go through one connection and never contend
//! with each other; reads come from a separate read-only pool sized for the
//! dispatch and recovery scans. WAL keeps the readers from blocking behind
//! the writer.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// The engine's database handle: a read-only pool plus one write
/// connection.
///
/// Pass `writer` to anything that mutates state (including multi-statement
/// transactions like node expansion) and `reader` to the scan and lookup
/// queries.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) the database at `database_url` and bring
    /// its schema up to date.
    ///
    /// Migrations run on the writer before the reader pool opens, so a
    /// fresh file is never visible half-initialized. Both pools share WAL
    /// mode, foreign key enforcement, and a 5 second busy timeout.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        Ok(Self { reader, writer })
    }
}

/// Database URL used when the config carries none: `taskforge.db` under
/// `TASKFORGE_DATA_DIR`, or under `~/.taskforge` when that is unset.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("TASKFORGE_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.taskforge")
    });
    format!("sqlite://{data_dir}/taskforge.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = DatabasePool::new(&url).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(table_names.contains(&"workflow_definitions"));
        assert!(table_names.contains(&"workflow_instances"));
        assert!(table_names.contains(&"node_instances"));
        assert!(table_names.contains(&"node_checkpoints"));
        assert!(table_names.contains(&"engine_instances"));
        assert!(table_names.contains(&"schedules"));
    }

    #[tokio::test]
    async fn test_pool_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test_wal.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = DatabasePool::new(&url).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_default_database_url() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("taskforge.db"));
    }
}
