//! Engine runtime assembly.
//!
//! [`EngineRuntime`] wires the SQLite pools, repositories, and engine
//! services into one running engine process: it registers the engine in
//! the shared store, spawns the heartbeat and scheduler loops, and tears
//! both down on shutdown. Applications register their executors, call
//! [`EngineRuntime::start`], and talk to the engine through the exposed
//! services.

use std::sync::Arc;

use taskforge_core::engine::{
    EngineRegistryService, NodeExecutionService, SchedulerService, WorkflowInstanceService,
};
use taskforge_core::executor::ExecutorRegistry;
use taskforge_types::config::EngineConfig;
use taskforge_types::error::EngineError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sqlite::pool::default_database_url;
use crate::sqlite::{
    DatabasePool, SqliteEngineRepository, SqliteScheduleRepository, SqliteWorkflowRepository,
};

type Workflows = WorkflowInstanceService<SqliteWorkflowRepository>;
type Scheduler =
    SchedulerService<SqliteWorkflowRepository, SqliteScheduleRepository, SqliteEngineRepository>;

/// One assembled engine process.
///
/// Owns the background heartbeat and scheduler tasks; dropping the runtime
/// without calling [`shutdown`](Self::shutdown) leaves the engine row to be
/// reclaimed by a peer's staleness recovery instead of a clean handoff.
pub struct EngineRuntime {
    engine_id: String,
    pool: DatabasePool,
    schedule_repo: Arc<SqliteScheduleRepository>,
    workflows: Arc<Workflows>,
    scheduler: Arc<Scheduler>,
    registry: Arc<EngineRegistryService<SqliteEngineRepository>>,
    executors: Arc<ExecutorRegistry>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineRuntime {
    /// Open the database, register this engine, and spawn the background
    /// loops (heartbeat, schedule scan, dispatch, recovery).
    pub async fn start(
        config: EngineConfig,
        executors: Arc<ExecutorRegistry>,
    ) -> Result<Self, EngineError> {
        let database_url = config
            .database_url
            .clone()
            .unwrap_or_else(default_database_url);
        let pool = DatabasePool::new(&database_url)
            .await
            .map_err(|e| EngineError::Transaction(format!("opening {database_url}: {e}")))?;

        let config = Arc::new(config);
        let workflow_repo = Arc::new(SqliteWorkflowRepository::new(pool.clone()));
        let schedule_repo = Arc::new(SqliteScheduleRepository::new(pool.clone()));
        let engine_repo = Arc::new(SqliteEngineRepository::new(pool.clone()));

        let hostname =
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let engine_id = format!("{hostname}:{}", Uuid::now_v7());

        let nodes = Arc::new(NodeExecutionService::new(
            Arc::clone(&workflow_repo),
            Arc::clone(&executors),
            Arc::clone(&config),
        ));
        let workflows = Arc::new(WorkflowInstanceService::new(
            Arc::clone(&workflow_repo),
            Arc::clone(&nodes),
            Arc::clone(&executors),
            Arc::clone(&config),
            engine_id.clone(),
        ));
        let scheduler = Arc::new(SchedulerService::new(
            Arc::clone(&workflow_repo),
            Arc::clone(&schedule_repo),
            Arc::clone(&engine_repo),
            Arc::clone(&workflows),
            Arc::clone(&nodes),
            Arc::clone(&config),
            engine_id.clone(),
        ));
        let registry = Arc::new(
            EngineRegistryService::new(
                Arc::clone(&engine_repo),
                engine_id.clone(),
                hostname,
                executors.names(),
                Arc::clone(&config),
            ),
        );

        registry.register().await?;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        {
            let registry = Arc::clone(&registry);
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                registry.run_heartbeat(token).await;
            }));
        }
        {
            let scheduler = Arc::clone(&scheduler);
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                scheduler.run(token).await;
            }));
        }

        tracing::info!(engine_id = %engine_id, "engine runtime started");
        Ok(Self {
            engine_id,
            pool,
            schedule_repo,
            workflows,
            scheduler,
            registry,
            executors,
            cancel,
            tasks,
        })
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Workflow definition and instance operations.
    pub fn workflows(&self) -> &Arc<Workflows> {
        &self.workflows
    }

    /// The scheduler service, for manual scan/dispatch/recovery passes.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The schedule store, for creating and managing schedules.
    pub fn schedules(&self) -> &Arc<SqliteScheduleRepository> {
        &self.schedule_repo
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    /// The underlying database pool.
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Stop accepting new work while continuing to heartbeat.
    pub async fn enter_maintenance(&self) -> Result<(), EngineError> {
        self.registry.enter_maintenance().await
    }

    /// Cancel the background loops, wait for them to finish, and deregister
    /// the engine so peers can take over its work without a staleness wait.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            // Heartbeat loop deregisters on its way out.
            let _ = task.await;
        }
        tracing::info!(engine_id = %self.engine_id, "engine runtime stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use taskforge_core::engine::{StartOptions, StartOutcome};
    use taskforge_core::executor::{BoxFuture, ExecutionContext, Executor};
    use taskforge_types::workflow::{
        FailurePolicy, InstanceStatus, NodeDefinition, NodeType, WorkflowDefinition,
    };

    struct Echo;

    impl Executor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn execute<'a>(
            &'a self,
            _ctx: &'a ExecutionContext,
            input: &'a Value,
        ) -> BoxFuture<'a, Result<Value, EngineError>> {
            Box::pin(async move { Ok(input.clone()) })
        }
    }

    fn test_config() -> EngineConfig {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runtime.db");
        std::mem::forget(dir);
        EngineConfig {
            database_url: Some(format!("sqlite://{}?mode=rwc", db_path.display())),
            ..EngineConfig::default()
        }
    }

    fn echo_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "echo-flow".to_string(),
            version: "1.0".to_string(),
            description: None,
            root: NodeDefinition {
                node_id: "echo".to_string(),
                name: "echo".to_string(),
                node_type: NodeType::Simple,
                executor: Some("echo".to_string()),
                input: Value::Null,
                timeout_secs: Some(5),
                max_retries: 0,
                retry: None,
                condition: None,
                failure_policy: FailurePolicy::FailFast,
                children: vec![],
                subprocess: None,
            },
            default_timeout_secs: Some(30),
            default_retry: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_runtime_runs_workflow_end_to_end() {
        let _ = taskforge_observe::init_tracing(taskforge_observe::LogFormat::Pretty);
        let executors = Arc::new(ExecutorRegistry::new());
        executors.register(Arc::new(Echo));

        let runtime = EngineRuntime::start(test_config(), executors).await.unwrap();

        let def = echo_definition();
        runtime.workflows().register_definition(&def).await.unwrap();

        let outcome = runtime
            .workflows()
            .start(
                &def.reference(),
                json!({"greeting": "hello"}),
                StartOptions::default(),
            )
            .await
            .unwrap();
        let StartOutcome::Started(instance) = outcome else {
            panic!("expected a fresh instance");
        };

        let finished = runtime.workflows().get(instance.id).await.unwrap();
        assert_eq!(finished.status, InstanceStatus::Completed);
        assert_eq!(finished.output.unwrap()["greeting"], "hello");
        assert_eq!(finished.engine_id.as_deref(), Some(runtime.engine_id()));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_deregisters_engine() {
        let executors = Arc::new(ExecutorRegistry::new());
        executors.register(Arc::new(Echo));

        let config = test_config();
        let url = config.database_url.clone().unwrap();
        let runtime = EngineRuntime::start(config, executors).await.unwrap();
        let engine_id = runtime.engine_id().to_string();
        runtime.shutdown().await;

        // Reopen the store and verify the clean handoff marker.
        let pool = DatabasePool::new(&url).await.unwrap();
        let repo = SqliteEngineRepository::new(pool);
        use taskforge_core::repository::engine::EngineRepository;
        let row = repo.get(&engine_id).await.unwrap().unwrap();
        assert_eq!(row.status, taskforge_types::engine::EngineStatus::Inactive);
    }
}
