//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `taskforge-core` using sqlx with
//! split read/write pools. Definitions are stored as JSON blobs keyed by
//! `(name, version)`. Instance and node rows carry the execution state the
//! engine's compare-and-set transitions race over:
//!
//! - Mutex admission is arbitrated by a partial unique index on
//!   `mutex_key` over non-terminal rows; the losing insert surfaces as
//!   [`RepositoryError::Conflict`].
//! - `transition_node`, `update_instance_status_if`, and `claim_instance`
//!   are single conditional UPDATEs; `rows_affected` decides who won.
//! - `expand_node` inserts every child and the parent's progress columns in
//!   one transaction on the writer pool.
//! - `increment_loop_progress` bumps counters with SQL arithmetic and reads
//!   the result back through RETURNING, never read-modify-write.

use chrono::{DateTime, Utc};
use sqlx::Row;
use taskforge_core::repository::workflow::{NodePatch, WorkflowRepository};
use taskforge_types::error::RepositoryError;
use taskforge_types::workflow::{
    InstanceStatus, LoopPhase, LoopProgress, NodeInstance, NodeStatus, WorkflowDefinition,
    WorkflowInstance,
};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    enum_from_str, enum_str, format_datetime, json_from_str, json_str, parse_datetime, parse_uuid,
    status_in_list,
};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid definition JSON: {e}")))
    }
}

struct InstanceRow {
    id: String,
    definition_id: String,
    definition_name: String,
    definition_version: String,
    status: String,
    input: String,
    output: Option<String>,
    variables: String,
    scheduled_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    retry_count: i64,
    max_retries: i64,
    mutex_key: Option<String>,
    business_key: Option<String>,
    parent_instance_id: Option<String>,
    parent_node_id: Option<String>,
    engine_id: Option<String>,
    error: Option<String>,
    created_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_name: row.try_get("definition_name")?,
            definition_version: row.try_get("definition_version")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            variables: row.try_get("variables")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            mutex_key: row.try_get("mutex_key")?,
            business_key: row.try_get("business_key")?,
            parent_instance_id: row.try_get("parent_instance_id")?,
            parent_node_id: row.try_get("parent_node_id")?,
            engine_id: row.try_get("engine_id")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            definition_name: self.definition_name,
            definition_version: self.definition_version,
            status: enum_from_str(&self.status)?,
            input: json_from_str(&self.input)?,
            output: self.output.as_deref().map(json_from_str).transpose()?,
            variables: json_from_str(&self.variables)?,
            scheduled_at: self.scheduled_at.as_deref().map(parse_datetime).transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            mutex_key: self.mutex_key,
            business_key: self.business_key,
            parent_instance_id: self
                .parent_instance_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            parent_node_id: self.parent_node_id.as_deref().map(parse_uuid).transpose()?,
            engine_id: self.engine_id,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct NodeRow {
    id: String,
    workflow_instance_id: String,
    node_id: String,
    node_type: String,
    status: String,
    parent_node_id: Option<String>,
    child_index: Option<i64>,
    loop_phase: Option<String>,
    loop_total: Option<i64>,
    loop_completed: i64,
    loop_failed: i64,
    retry_count: i64,
    max_retries: i64,
    run_after: Option<String>,
    input: String,
    output: Option<String>,
    error_details: Option<String>,
    progress: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
}

impl NodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_instance_id: row.try_get("workflow_instance_id")?,
            node_id: row.try_get("node_id")?,
            node_type: row.try_get("node_type")?,
            status: row.try_get("status")?,
            parent_node_id: row.try_get("parent_node_id")?,
            child_index: row.try_get("child_index")?,
            loop_phase: row.try_get("loop_phase")?,
            loop_total: row.try_get("loop_total")?,
            loop_completed: row.try_get("loop_completed")?,
            loop_failed: row.try_get("loop_failed")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            run_after: row.try_get("run_after")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error_details: row.try_get("error_details")?,
            progress: row.try_get("progress")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_node(self) -> Result<NodeInstance, RepositoryError> {
        let loop_progress = self
            .loop_phase
            .as_deref()
            .map(|phase| -> Result<LoopProgress, RepositoryError> {
                Ok(LoopProgress {
                    status: enum_from_str(phase)?,
                    total_count: self.loop_total.unwrap_or(0) as u32,
                    completed_count: self.loop_completed as u32,
                    failed_count: self.loop_failed as u32,
                })
            })
            .transpose()?;

        Ok(NodeInstance {
            id: parse_uuid(&self.id)?,
            workflow_instance_id: parse_uuid(&self.workflow_instance_id)?,
            node_id: self.node_id,
            node_type: enum_from_str(&self.node_type)?,
            status: enum_from_str(&self.status)?,
            parent_node_id: self.parent_node_id.as_deref().map(parse_uuid).transpose()?,
            child_index: self.child_index.map(|i| i as u32),
            loop_progress,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            run_after: self.run_after.as_deref().map(parse_datetime).transpose()?,
            input: json_from_str(&self.input)?,
            output: self.output.as_deref().map(json_from_str).transpose()?,
            error_details: self.error_details,
            progress: self.progress.as_deref().map(json_from_str).transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Map a unique-constraint violation to `Conflict`; the partial index on
/// `mutex_key` makes the store the arbiter of mutex races.
fn insert_err(e: sqlx::Error) -> RepositoryError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => RepositoryError::Conflict(db.to_string()),
        _ => RepositoryError::Query(e.to_string()),
    }
}

const NON_TERMINAL: [InstanceStatus; 3] = [
    InstanceStatus::Pending,
    InstanceStatus::Running,
    InstanceStatus::Paused,
];

const NODE_COLUMNS: &str = "id, workflow_instance_id, node_id, node_type, status, parent_node_id, \
     child_index, loop_phase, loop_total, loop_completed, loop_failed, retry_count, max_retries, \
     run_after, input, output, error_details, progress, started_at, completed_at, created_at";

/// Bind one node row onto an INSERT with [`NODE_COLUMNS`] placeholders.
fn bind_node<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    node: &'q NodeInstance,
    node_type: &'q str,
    status: &'q str,
    loop_phase: Option<&'q str>,
    input: &'q str,
    output: Option<&'q str>,
    progress: Option<&'q str>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(node.id.to_string())
        .bind(node.workflow_instance_id.to_string())
        .bind(&node.node_id)
        .bind(node_type)
        .bind(status)
        .bind(node.parent_node_id.map(|id| id.to_string()))
        .bind(node.child_index.map(|i| i as i64))
        .bind(loop_phase)
        .bind(node.loop_progress.as_ref().map(|p| p.total_count as i64))
        .bind(
            node.loop_progress
                .as_ref()
                .map(|p| p.completed_count as i64)
                .unwrap_or(0),
        )
        .bind(
            node.loop_progress
                .as_ref()
                .map(|p| p.failed_count as i64)
                .unwrap_or(0),
        )
        .bind(node.retry_count as i64)
        .bind(node.max_retries as i64)
        .bind(node.run_after.as_ref().map(format_datetime))
        .bind(input)
        .bind(output)
        .bind(&node.error_details)
        .bind(progress)
        .bind(node.started_at.as_ref().map(format_datetime))
        .bind(node.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&node.created_at))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    // -- Definitions --

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.version)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| DefinitionRow::from_row(&row).map_err(query_err)?.into_definition())
            .transpose()
    }

    async fn get_definition_by_ref(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE name = ? AND version = ?",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|row| DefinitionRow::from_row(&row).map_err(query_err)?.into_definition())
            .transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows =
            sqlx::query("SELECT definition FROM workflow_definitions ORDER BY created_at DESC")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_err)?;

        rows.iter()
            .map(|row| DefinitionRow::from_row(row).map_err(query_err)?.into_definition())
            .collect()
    }

    // -- Workflow instances --

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let status = enum_str(&instance.status)?;
        let input = json_str(&instance.input)?;
        let output = instance.output.as_ref().map(json_str).transpose()?;
        let variables = json_str(&instance.variables)?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, definition_id, definition_name, definition_version, status, input, output,
                variables, scheduled_at, started_at, completed_at, retry_count, max_retries,
                mutex_key, business_key, parent_instance_id, parent_node_id, engine_id, error,
                created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(&instance.definition_name)
        .bind(&instance.definition_version)
        .bind(&status)
        .bind(&input)
        .bind(&output)
        .bind(&variables)
        .bind(instance.scheduled_at.as_ref().map(format_datetime))
        .bind(instance.started_at.as_ref().map(format_datetime))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(instance.retry_count as i64)
        .bind(instance.max_retries as i64)
        .bind(&instance.mutex_key)
        .bind(&instance.business_key)
        .bind(instance.parent_instance_id.map(|id| id.to_string()))
        .bind(instance.parent_node_id.map(|id| id.to_string()))
        .bind(&instance.engine_id)
        .bind(&instance.error)
        .bind(format_datetime(&instance.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(insert_err)?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| InstanceRow::from_row(&row).map_err(query_err)?.into_instance())
            .transpose()
    }

    async fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let status_str = enum_str(&status)?;
        let output_str = output.map(json_str).transpose()?;
        let completed_at = status
            .is_terminal()
            .then(|| format_datetime(&Utc::now()));

        let result = sqlx::query(
            "UPDATE workflow_instances SET status = ?, output = COALESCE(?, output), \
             error = COALESCE(?, error), completed_at = COALESCE(completed_at, ?) WHERE id = ?",
        )
        .bind(&status_str)
        .bind(&output_str)
        .bind(error)
        .bind(&completed_at)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    async fn update_instance_status_if(
        &self,
        id: &Uuid,
        expected: &[InstanceStatus],
        to: InstanceStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let status_str = enum_str(&to)?;
        let output_str = output.map(json_str).transpose()?;
        let completed_at = to.is_terminal().then(|| format_datetime(&Utc::now()));
        let sql = format!(
            "UPDATE workflow_instances SET status = ?, output = COALESCE(?, output), \
             error = COALESCE(?, error), completed_at = COALESCE(completed_at, ?) \
             WHERE id = ? AND status IN ({})",
            status_in_list(expected)?
        );

        let result = sqlx::query(&sql)
            .bind(&status_str)
            .bind(&output_str)
            .bind(error)
            .bind(&completed_at)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_instance_started(
        &self,
        id: &Uuid,
        engine_id: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET status = 'running', engine_id = ?, \
             started_at = COALESCE(started_at, ?) WHERE id = ?",
        )
        .bind(engine_id)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    async fn set_instance_variables(
        &self,
        id: &Uuid,
        variables: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflow_instances SET variables = ? WHERE id = ?")
            .bind(json_str(variables)?)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    async fn find_active_by_mutex_key(
        &self,
        mutex_key: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT * FROM workflow_instances WHERE mutex_key = ? AND status IN ({})",
            status_in_list(&NON_TERMINAL)?
        );
        let row = sqlx::query(&sql)
            .bind(mutex_key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| InstanceRow::from_row(&row).map_err(query_err)?.into_instance())
            .transpose()
    }

    async fn count_active_by_definition(
        &self,
        definition_id: &Uuid,
    ) -> Result<u32, RepositoryError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM workflow_instances WHERE definition_id = ? AND status IN ({})",
            status_in_list(&NON_TERMINAL)?
        );
        let row = sqlx::query(&sql)
            .bind(definition_id.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;
        let count: i64 = row.try_get("n").map_err(query_err)?;
        Ok(count as u32)
    }

    async fn list_by_business_key(
        &self,
        business_key: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE business_key = ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(business_key)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| InstanceRow::from_row(row).map_err(query_err)?.into_instance())
            .collect()
    }

    async fn list_active_owned_by(
        &self,
        engine_id: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT * FROM workflow_instances WHERE engine_id = ? AND status IN ({})",
            status_in_list(&NON_TERMINAL)?
        );
        let rows = sqlx::query(&sql)
            .bind(engine_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| InstanceRow::from_row(row).map_err(query_err)?.into_instance())
            .collect()
    }

    async fn find_subprocess_instance(
        &self,
        parent_node_id: &Uuid,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE parent_node_id = ?")
            .bind(parent_node_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| InstanceRow::from_row(&row).map_err(query_err)?.into_instance())
            .transpose()
    }

    async fn claim_instance(
        &self,
        id: &Uuid,
        new_engine_id: &str,
        from_engine: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let sql = format!(
            "UPDATE workflow_instances SET engine_id = ? \
             WHERE id = ? AND status IN ({}) AND (? IS NULL OR engine_id = ?)",
            status_in_list(&NON_TERMINAL)?
        );
        let result = sqlx::query(&sql)
            .bind(new_engine_id)
            .bind(id.to_string())
            .bind(from_engine)
            .bind(from_engine)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    // -- Node instances --

    async fn create_node(&self, node: &NodeInstance) -> Result<(), RepositoryError> {
        let node_type = enum_str(&node.node_type)?;
        let status = enum_str(&node.status)?;
        let loop_phase = node
            .loop_progress
            .as_ref()
            .map(|p| enum_str(&p.status))
            .transpose()?;
        let input = json_str(&node.input)?;
        let output = node.output.as_ref().map(json_str).transpose()?;
        let progress = node.progress.as_ref().map(json_str).transpose()?;

        let sql = format!(
            "INSERT INTO node_instances ({NODE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        bind_node(
            sqlx::query(&sql),
            node,
            &node_type,
            &status,
            loop_phase.as_deref(),
            &input,
            output.as_deref(),
            progress.as_deref(),
        )
        .execute(&self.pool.writer)
        .await
        .map_err(insert_err)?;

        Ok(())
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<NodeInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM node_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| NodeRow::from_row(&row).map_err(query_err)?.into_node())
            .transpose()
    }

    async fn get_root_node(
        &self,
        workflow_instance_id: &Uuid,
    ) -> Result<Option<NodeInstance>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM node_instances \
             WHERE workflow_instance_id = ? AND parent_node_id IS NULL",
        )
        .bind(workflow_instance_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|row| NodeRow::from_row(&row).map_err(query_err)?.into_node())
            .transpose()
    }

    async fn list_nodes(
        &self,
        workflow_instance_id: &Uuid,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM node_instances WHERE workflow_instance_id = ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(workflow_instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| NodeRow::from_row(row).map_err(query_err)?.into_node())
            .collect()
    }

    async fn list_children(
        &self,
        parent_node_id: &Uuid,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM node_instances WHERE parent_node_id = ? ORDER BY child_index ASC",
        )
        .bind(parent_node_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| NodeRow::from_row(row).map_err(query_err)?.into_node())
            .collect()
    }

    async fn transition_node(
        &self,
        id: &Uuid,
        expected: &[NodeStatus],
        to: NodeStatus,
        patch: NodePatch,
    ) -> Result<bool, RepositoryError> {
        let to_str = enum_str(&to)?;
        let output = patch.output.as_ref().map(json_str).transpose()?;
        let run_after = patch.run_after.as_ref().map(format_datetime);
        let retry_bump: i64 = patch.increment_retry.into();

        let mut sets = vec![
            "status = ?",
            "output = COALESCE(?, output)",
            "error_details = COALESCE(?, error_details)",
            "run_after = ?",
            "retry_count = retry_count + ?",
        ];
        if to == NodeStatus::Running {
            sets.push("started_at = COALESCE(started_at, ?)");
        }
        if to.is_terminal() {
            sets.push("completed_at = COALESCE(completed_at, ?)");
        }
        let sql = format!(
            "UPDATE node_instances SET {} WHERE id = ? AND status IN ({})",
            sets.join(", "),
            status_in_list(expected)?
        );

        let now = format_datetime(&Utc::now());
        let mut query = sqlx::query(&sql)
            .bind(&to_str)
            .bind(&output)
            .bind(&patch.error_details)
            .bind(&run_after)
            .bind(retry_bump);
        if to == NodeStatus::Running || to.is_terminal() {
            query = query.bind(&now);
        }
        let result = query
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn expand_node(
        &self,
        parent_id: &Uuid,
        children: &[NodeInstance],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let result = sqlx::query(
            "UPDATE node_instances SET loop_phase = 'executing', loop_total = ?, \
             loop_completed = 0, loop_failed = 0 WHERE id = ?",
        )
        .bind(children.len() as i64)
        .bind(parent_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("node {parent_id}")));
        }

        let sql = format!(
            "INSERT INTO node_instances ({NODE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        for child in children {
            let node_type = enum_str(&child.node_type)?;
            let status = enum_str(&child.status)?;
            let input = json_str(&child.input)?;
            let output = child.output.as_ref().map(json_str).transpose()?;
            let progress = child.progress.as_ref().map(json_str).transpose()?;
            bind_node(
                sqlx::query(&sql),
                child,
                &node_type,
                &status,
                None,
                &input,
                output.as_deref(),
                progress.as_deref(),
            )
            .execute(&mut *tx)
            .await
            .map_err(insert_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn increment_loop_progress(
        &self,
        parent_id: &Uuid,
        completed_delta: u32,
        failed_delta: u32,
    ) -> Result<LoopProgress, RepositoryError> {
        let row = sqlx::query(
            "UPDATE node_instances SET loop_completed = loop_completed + ?, \
             loop_failed = loop_failed + ? WHERE id = ? AND loop_phase IS NOT NULL \
             RETURNING loop_phase, loop_total, loop_completed, loop_failed",
        )
        .bind(completed_delta as i64)
        .bind(failed_delta as i64)
        .bind(parent_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Err(RepositoryError::Query(format!(
                "node {parent_id} has no fan-out"
            )));
        };
        let phase: String = row.try_get("loop_phase").map_err(query_err)?;
        let total: Option<i64> = row.try_get("loop_total").map_err(query_err)?;
        let completed: i64 = row.try_get("loop_completed").map_err(query_err)?;
        let failed: i64 = row.try_get("loop_failed").map_err(query_err)?;
        Ok(LoopProgress {
            status: enum_from_str(&phase)?,
            total_count: total.unwrap_or(0) as u32,
            completed_count: completed as u32,
            failed_count: failed as u32,
        })
    }

    async fn set_node_progress(
        &self,
        id: &Uuid,
        progress: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE node_instances SET progress = ? WHERE id = ?")
            .bind(json_str(progress)?)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("node {id}")));
        }
        Ok(())
    }

    async fn set_loop_phase(
        &self,
        parent_id: &Uuid,
        phase: LoopPhase,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE node_instances SET loop_phase = ? WHERE id = ? AND loop_phase IS NOT NULL",
        )
        .bind(enum_str(&phase)?)
        .bind(parent_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Query(format!(
                "node {parent_id} has no fan-out"
            )));
        }
        Ok(())
    }

    async fn find_due_nodes(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM node_instances \
             WHERE status IN ('pending', 'failed_retry') \
               AND run_after IS NOT NULL AND run_after <= ? \
             ORDER BY run_after ASC LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| NodeRow::from_row(row).map_err(query_err)?.into_node())
            .collect()
    }

    // -- Checkpoints --

    async fn save_checkpoint(
        &self,
        node_instance_id: &Uuid,
        state: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO node_checkpoints (node_instance_id, state, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT(node_instance_id) DO UPDATE SET
                 state = excluded.state,
                 updated_at = excluded.updated_at"#,
        )
        .bind(node_instance_id.to_string())
        .bind(json_str(state)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        node_instance_id: &Uuid,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM node_checkpoints WHERE node_instance_id = ?")
            .bind(node_instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| {
            let state: String = row.try_get("state").map_err(query_err)?;
            json_from_str(&state)
        })
        .transpose()
    }

    async fn delete_checkpoint(&self, node_instance_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM node_checkpoints WHERE node_instance_id = ?")
            .bind(node_instance_id.to_string())
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
    use serde_json::json;
    use taskforge_types::workflow::{
        FailurePolicy, NodeDefinition, NodeType, WorkflowDefinition,
    };

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "roster-sync".to_string(),
            version: "1.0".to_string(),
            description: Some("Sync member rosters".to_string()),
            root: NodeDefinition {
                node_id: "sync".to_string(),
                name: "sync".to_string(),
                node_type: NodeType::Simple,
                executor: Some("roster-sync".to_string()),
                input: serde_json::Value::Null,
                timeout_secs: Some(120),
                max_retries: 2,
                retry: None,
                condition: None,
                failure_policy: FailurePolicy::FailFast,
                children: vec![],
                subprocess: None,
            },
            default_timeout_secs: Some(600),
            default_retry: None,
            metadata: Default::default(),
        }
    }

    fn sample_instance(def: &WorkflowDefinition) -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_name: def.name.clone(),
            definition_version: def.version.clone(),
            status: InstanceStatus::Pending,
            input: json!({"region": "emea"}),
            output: None,
            variables: json!({}),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
            mutex_key: None,
            business_key: None,
            parent_instance_id: None,
            parent_node_id: None,
            engine_id: Some("engine-a".to_string()),
            error: None,
            created_at: Utc::now(),
        }
    }

    fn sample_node(instance: &WorkflowInstance) -> NodeInstance {
        NodeInstance {
            id: Uuid::now_v7(),
            workflow_instance_id: instance.id,
            node_id: "sync".to_string(),
            node_type: NodeType::Simple,
            status: NodeStatus::Pending,
            parent_node_id: None,
            child_index: None,
            loop_progress: None,
            retry_count: 0,
            max_retries: 2,
            run_after: None,
            input: json!({"region": "emea"}),
            output: None,
            error_details: None,
            progress: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    // -- Definition CRUD --

    #[tokio::test]
    async fn test_save_and_get_definition() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();

        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "roster-sync");
        assert_eq!(loaded.root.node_id, "sync");

        let by_ref = repo
            .get_definition_by_ref("roster-sync", "1.0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_ref.id, def.id);
    }

    #[tokio::test]
    async fn test_save_definition_upsert() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let mut def = sample_definition();

        repo.save_definition(&def).await.unwrap();
        def.version = "2.0".to_string();
        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, "2.0");
    }

    // -- Instance lifecycle --

    #[tokio::test]
    async fn test_create_and_get_instance() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();

        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Pending);
        assert_eq!(loaded.input["region"], "emea");
        assert_eq!(loaded.engine_id.as_deref(), Some("engine-a"));
    }

    #[tokio::test]
    async fn test_mutex_key_unique_among_active() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();

        let mut first = sample_instance(&def);
        first.mutex_key = Some("nightly".to_string());
        repo.create_instance(&first).await.unwrap();

        let mut second = sample_instance(&def);
        second.mutex_key = Some("nightly".to_string());
        let err = repo.create_instance(&second).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // Terminal holder releases the key.
        repo.update_instance_status(&first.id, InstanceStatus::Completed, None, None)
            .await
            .unwrap();
        repo.create_instance(&second).await.unwrap();

        let holder = repo.find_active_by_mutex_key("nightly").await.unwrap().unwrap();
        assert_eq!(holder.id, second.id);
    }

    #[tokio::test]
    async fn test_conditional_status_update() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();

        let won = repo
            .update_instance_status_if(
                &instance.id,
                &[InstanceStatus::Pending],
                InstanceStatus::Cancelled,
                None,
                Some("cancelled by request"),
            )
            .await
            .unwrap();
        assert!(won);

        // Second writer loses: the instance is already terminal.
        let lost = repo
            .update_instance_status_if(
                &instance.id,
                &[InstanceStatus::Pending, InstanceStatus::Running],
                InstanceStatus::Completed,
                Some(&json!({"n": 1})),
                None,
            )
            .await
            .unwrap();
        assert!(!lost);

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Cancelled);
        assert!(loaded.output.is_none());
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_instance_conditional() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();

        // Wrong previous owner: claim loses.
        let lost = repo
            .claim_instance(&instance.id, "engine-b", Some("engine-x"))
            .await
            .unwrap();
        assert!(!lost);

        let won = repo
            .claim_instance(&instance.id, "engine-b", Some("engine-a"))
            .await
            .unwrap();
        assert!(won);

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.engine_id.as_deref(), Some("engine-b"));
    }

    // -- Node transitions --

    #[tokio::test]
    async fn test_node_cas_transition() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let node = sample_node(&instance);
        repo.create_node(&node).await.unwrap();

        let won = repo
            .transition_node(
                &node.id,
                &[NodeStatus::Pending],
                NodeStatus::Running,
                NodePatch::default(),
            )
            .await
            .unwrap();
        assert!(won);

        // A second claim on the same node loses.
        let lost = repo
            .transition_node(
                &node.id,
                &[NodeStatus::Pending, NodeStatus::FailedRetry],
                NodeStatus::Running,
                NodePatch::default(),
            )
            .await
            .unwrap();
        assert!(!lost);

        let loaded = repo.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_node_retry_parking() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let node = sample_node(&instance);
        repo.create_node(&node).await.unwrap();

        repo.transition_node(&node.id, &[NodeStatus::Pending], NodeStatus::Running, NodePatch::default())
            .await
            .unwrap();

        let run_after = Utc::now() + chrono::Duration::milliseconds(50);
        repo.transition_node(
            &node.id,
            &[NodeStatus::Running],
            NodeStatus::FailedRetry,
            NodePatch::retry_at("upstream 503", run_after),
        )
        .await
        .unwrap();

        let loaded = repo.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::FailedRetry);
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.run_after.is_some());

        // Not due yet, then due.
        let due_now = repo.find_due_nodes(Utc::now(), 10).await.unwrap();
        assert!(due_now.is_empty());
        let due_later = repo
            .find_due_nodes(Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(due_later.len(), 1);
        assert_eq!(due_later[0].id, node.id);
    }

    #[tokio::test]
    async fn test_expand_node_atomic_and_counters() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();

        let mut parent = sample_node(&instance);
        parent.node_type = NodeType::Loop;
        repo.create_node(&parent).await.unwrap();

        let children: Vec<NodeInstance> = (0..3)
            .map(|i| {
                let mut child = sample_node(&instance);
                child.id = Uuid::now_v7();
                child.node_id = "per-item".to_string();
                child.parent_node_id = Some(parent.id);
                child.child_index = Some(i);
                child
            })
            .collect();
        repo.expand_node(&parent.id, &children).await.unwrap();

        let loaded = repo.get_node(&parent.id).await.unwrap().unwrap();
        let progress = loaded.loop_progress.unwrap();
        assert_eq!(progress.status, LoopPhase::Executing);
        assert_eq!(progress.total_count, 3);

        let listed = repo.list_children(&parent.id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].child_index, Some(0));

        let progress = repo.increment_loop_progress(&parent.id, 1, 0).await.unwrap();
        assert_eq!(progress.completed_count, 1);
        let progress = repo.increment_loop_progress(&parent.id, 0, 1).await.unwrap();
        assert_eq!(progress.failed_count, 1);

        repo.set_loop_phase(&parent.id, LoopPhase::Completed).await.unwrap();
        let loaded = repo.get_node(&parent.id).await.unwrap().unwrap();
        assert_eq!(loaded.loop_progress.unwrap().status, LoopPhase::Completed);
    }

    #[tokio::test]
    async fn test_increment_without_fanout_rejected() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let node = sample_node(&instance);
        repo.create_node(&node).await.unwrap();

        let err = repo.increment_loop_progress(&node.id, 1, 0).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Query(_)));
    }

    // -- Checkpoints --

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let node = sample_node(&instance);
        repo.create_node(&node).await.unwrap();

        repo.save_checkpoint(&node.id, &json!({"cursor": 42})).await.unwrap();
        repo.save_checkpoint(&node.id, &json!({"cursor": 99})).await.unwrap();

        let state = repo.load_checkpoint(&node.id).await.unwrap().unwrap();
        assert_eq!(state["cursor"], 99);

        assert!(repo.delete_checkpoint(&node.id).await.unwrap());
        assert!(!repo.delete_checkpoint(&node.id).await.unwrap());
        assert!(repo.load_checkpoint(&node.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_node_progress_persists_without_touching_status() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        repo.create_instance(&instance).await.unwrap();
        let node = sample_node(&instance);
        repo.create_node(&node).await.unwrap();

        repo.transition_node(&node.id, &[NodeStatus::Pending], NodeStatus::Running, NodePatch::default())
            .await
            .unwrap();

        repo.set_node_progress(&node.id, &json!({"rows": 40}))
            .await
            .unwrap();
        repo.set_node_progress(&node.id, &json!({"rows": 120}))
            .await
            .unwrap();

        let loaded = repo.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::Running);
        assert_eq!(loaded.progress, Some(json!({"rows": 120})));

        let err = repo
            .set_node_progress(&Uuid::now_v7(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
