//! In-memory repository implementations.
//!
//! Reference implementations of the storage ports, used by the engine test
//! suite and useful for embedding the engine without a database. A single
//! mutex guards each repository's state, so every multi-row operation is
//! atomic by construction, matching the transactional contract the SQLite
//! adapters provide.
//!
//! `fail_next_writes` injects storage failures into upcoming write
//! operations, letting tests verify that multi-row writes are truly
//! all-or-nothing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskforge_types::engine::{EngineInstance, EngineLoad, EngineStatus};
use taskforge_types::error::RepositoryError;
use taskforge_types::schedule::ScheduleDefinition;
use taskforge_types::workflow::{
    InstanceStatus, LoopPhase, LoopProgress, NodeInstance, NodeStatus, WorkflowDefinition,
    WorkflowInstance,
};
use uuid::Uuid;

use super::engine::EngineRepository;
use super::schedule::ScheduleRepository;
use super::workflow::{NodePatch, WorkflowRepository};

// ---------------------------------------------------------------------------
// InMemoryWorkflowRepository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WorkflowState {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    nodes: HashMap<Uuid, NodeInstance>,
    checkpoints: HashMap<Uuid, Value>,
}

/// In-memory [`WorkflowRepository`].
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    state: Mutex<WorkflowState>,
    fail_writes: AtomicU32,
    fail_expansions: AtomicU32,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write operations fail before mutating anything.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make only the next `n` `expand_node` calls fail.
    pub fn fail_next_expansions(&self, n: u32) {
        self.fail_expansions.store(n, Ordering::SeqCst);
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .unwrap_or(0)
            > 0
    }

    fn check_fault(&self) -> Result<(), RepositoryError> {
        if Self::consume(&self.fail_writes) {
            Err(RepositoryError::Query("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkflowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    // -- Definitions --

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.check_fault()?;
        self.lock().definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.lock().definitions.get(id).cloned())
    }

    async fn get_definition_by_ref(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .lock()
            .definitions
            .values()
            .find(|d| d.name == name && d.version == version)
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self.lock().definitions.values().cloned().collect();
        defs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(defs)
    }

    // -- Workflow instances --

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        if let Some(key) = &instance.mutex_key {
            let holder = state
                .instances
                .values()
                .find(|i| !i.status.is_terminal() && i.mutex_key.as_deref() == Some(key.as_str()));
            if let Some(existing) = holder {
                return Err(RepositoryError::Conflict(format!(
                    "mutex key '{key}' held by instance {}",
                    existing.id
                )));
            }
        }
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.lock().instances.get(id).cloned())
    }

    async fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {id}")))?;
        instance.status = status;
        if let Some(out) = output {
            instance.output = Some(out.clone());
        }
        if let Some(err) = error {
            instance.error = Some(err.to_string());
        }
        if status.is_terminal() && instance.completed_at.is_none() {
            instance.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_instance_status_if(
        &self,
        id: &Uuid,
        expected: &[InstanceStatus],
        to: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {id}")))?;
        if !expected.contains(&instance.status) {
            return Ok(false);
        }
        instance.status = to;
        if let Some(out) = output {
            instance.output = Some(out.clone());
        }
        if let Some(err) = error {
            instance.error = Some(err.to_string());
        }
        if to.is_terminal() && instance.completed_at.is_none() {
            instance.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn mark_instance_started(
        &self,
        id: &Uuid,
        engine_id: &str,
    ) -> Result<(), RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {id}")))?;
        instance.status = InstanceStatus::Running;
        instance.engine_id = Some(engine_id.to_string());
        if instance.started_at.is_none() {
            instance.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_instance_variables(
        &self,
        id: &Uuid,
        variables: &Value,
    ) -> Result<(), RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {id}")))?;
        instance.variables = variables.clone();
        Ok(())
    }

    async fn find_active_by_mutex_key(
        &self,
        mutex_key: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self
            .lock()
            .instances
            .values()
            .find(|i| !i.status.is_terminal() && i.mutex_key.as_deref() == Some(mutex_key))
            .cloned())
    }

    async fn count_active_by_definition(
        &self,
        definition_id: &Uuid,
    ) -> Result<u32, RepositoryError> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|i| !i.status.is_terminal() && i.definition_id == *definition_id)
            .count() as u32)
    }

    async fn list_by_business_key(
        &self,
        business_key: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut matches: Vec<_> = self
            .lock()
            .instances
            .values()
            .filter(|i| i.business_key.as_deref() == Some(business_key))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn list_active_owned_by(
        &self,
        engine_id: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|i| !i.status.is_terminal() && i.engine_id.as_deref() == Some(engine_id))
            .cloned()
            .collect())
    }

    async fn find_subprocess_instance(
        &self,
        parent_node_id: &Uuid,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self
            .lock()
            .instances
            .values()
            .find(|i| i.parent_node_id == Some(*parent_node_id))
            .cloned())
    }

    async fn claim_instance(
        &self,
        id: &Uuid,
        new_engine_id: &str,
        from_engine: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {id}")))?;
        if instance.status.is_terminal() {
            return Ok(false);
        }
        if let Some(from) = from_engine
            && instance.engine_id.as_deref() != Some(from)
        {
            return Ok(false);
        }
        instance.engine_id = Some(new_engine_id.to_string());
        Ok(true)
    }

    // -- Node instances --

    async fn create_node(&self, node: &NodeInstance) -> Result<(), RepositoryError> {
        self.check_fault()?;
        self.lock().nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<NodeInstance>, RepositoryError> {
        Ok(self.lock().nodes.get(id).cloned())
    }

    async fn get_root_node(
        &self,
        workflow_instance_id: &Uuid,
    ) -> Result<Option<NodeInstance>, RepositoryError> {
        Ok(self
            .lock()
            .nodes
            .values()
            .find(|n| n.workflow_instance_id == *workflow_instance_id && n.parent_node_id.is_none())
            .cloned())
    }

    async fn list_nodes(
        &self,
        workflow_instance_id: &Uuid,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let mut nodes: Vec<_> = self
            .lock()
            .nodes
            .values()
            .filter(|n| n.workflow_instance_id == *workflow_instance_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn list_children(
        &self,
        parent_node_id: &Uuid,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let mut children: Vec<_> = self
            .lock()
            .nodes
            .values()
            .filter(|n| n.parent_node_id == Some(*parent_node_id))
            .cloned()
            .collect();
        children.sort_by_key(|n| n.child_index);
        Ok(children)
    }

    async fn transition_node(
        &self,
        id: &Uuid,
        expected: &[NodeStatus],
        to: NodeStatus,
        patch: NodePatch,
    ) -> Result<bool, RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("node {id}")))?;
        if !expected.contains(&node.status) {
            return Ok(false);
        }
        node.status = to;
        if let Some(output) = patch.output {
            node.output = Some(output);
        }
        if let Some(err) = patch.error_details {
            node.error_details = Some(err);
        }
        node.run_after = patch.run_after;
        if patch.increment_retry {
            node.retry_count += 1;
        }
        if to == NodeStatus::Running && node.started_at.is_none() {
            node.started_at = Some(Utc::now());
        }
        if to.is_terminal() && node.completed_at.is_none() {
            node.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn expand_node(
        &self,
        parent_id: &Uuid,
        children: &[NodeInstance],
    ) -> Result<(), RepositoryError> {
        // Fault checks run before any mutation, so an injected failure
        // leaves neither children nor parent progress behind.
        if Self::consume(&self.fail_expansions) {
            return Err(RepositoryError::Query(
                "injected expansion failure".to_string(),
            ));
        }
        self.check_fault()?;
        let mut state = self.lock();
        let parent = state
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("node {parent_id}")))?;
        parent.loop_progress = Some(LoopProgress {
            status: LoopPhase::Executing,
            total_count: children.len() as u32,
            completed_count: 0,
            failed_count: 0,
        });
        for child in children {
            state.nodes.insert(child.id, child.clone());
        }
        Ok(())
    }

    async fn increment_loop_progress(
        &self,
        parent_id: &Uuid,
        completed_delta: u32,
        failed_delta: u32,
    ) -> Result<LoopProgress, RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let parent = state
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("node {parent_id}")))?;
        let progress = parent
            .loop_progress
            .as_mut()
            .ok_or_else(|| RepositoryError::Query(format!("node {parent_id} has no fan-out")))?;
        progress.completed_count += completed_delta;
        progress.failed_count += failed_delta;
        Ok(*progress)
    }

    async fn set_node_progress(&self, id: &Uuid, progress: &Value) -> Result<(), RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("node {id}")))?;
        node.progress = Some(progress.clone());
        Ok(())
    }

    async fn set_loop_phase(
        &self,
        parent_id: &Uuid,
        phase: LoopPhase,
    ) -> Result<(), RepositoryError> {
        self.check_fault()?;
        let mut state = self.lock();
        let parent = state
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("node {parent_id}")))?;
        let progress = parent
            .loop_progress
            .as_mut()
            .ok_or_else(|| RepositoryError::Query(format!("node {parent_id} has no fan-out")))?;
        progress.status = phase;
        Ok(())
    }

    async fn find_due_nodes(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let mut due: Vec<_> = self
            .lock()
            .nodes
            .values()
            .filter(|n| {
                matches!(n.status, NodeStatus::Pending | NodeStatus::FailedRetry)
                    && n.run_after.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|n| n.run_after);
        due.truncate(limit as usize);
        Ok(due)
    }

    // -- Checkpoints --

    async fn save_checkpoint(
        &self,
        node_instance_id: &Uuid,
        state_value: &Value,
    ) -> Result<(), RepositoryError> {
        self.check_fault()?;
        self.lock()
            .checkpoints
            .insert(*node_instance_id, state_value.clone());
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        node_instance_id: &Uuid,
    ) -> Result<Option<Value>, RepositoryError> {
        Ok(self.lock().checkpoints.get(node_instance_id).cloned())
    }

    async fn delete_checkpoint(&self, node_instance_id: &Uuid) -> Result<bool, RepositoryError> {
        self.check_fault()?;
        Ok(self.lock().checkpoints.remove(node_instance_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// InMemoryEngineRepository
// ---------------------------------------------------------------------------

/// In-memory [`EngineRepository`].
#[derive(Default)]
pub struct InMemoryEngineRepository {
    engines: Mutex<HashMap<String, EngineInstance>>,
}

impl InMemoryEngineRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EngineInstance>> {
        self.engines.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EngineRepository for InMemoryEngineRepository {
    async fn register(&self, engine: &EngineInstance) -> Result<(), RepositoryError> {
        self.lock()
            .insert(engine.instance_id.clone(), engine.clone());
        Ok(())
    }

    async fn heartbeat(
        &self,
        instance_id: &str,
        load: EngineLoad,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut engines = self.lock();
        let engine = engines
            .get_mut(instance_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("engine {instance_id}")))?;
        engine.load = load;
        engine.last_heartbeat = at;
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: EngineStatus,
    ) -> Result<(), RepositoryError> {
        let mut engines = self.lock();
        let engine = engines
            .get_mut(instance_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("engine {instance_id}")))?;
        engine.status = status;
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<Option<EngineInstance>, RepositoryError> {
        Ok(self.lock().get(instance_id).cloned())
    }

    async fn list(&self) -> Result<Vec<EngineInstance>, RepositoryError> {
        let mut engines: Vec<_> = self.lock().values().cloned().collect();
        engines.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(engines)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<EngineInstance>, RepositoryError> {
        Ok(self
            .lock()
            .values()
            .filter(|e| e.is_stale(cutoff))
            .cloned()
            .collect())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.lock().remove(instance_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// InMemoryScheduleRepository
// ---------------------------------------------------------------------------

/// In-memory [`ScheduleRepository`].
#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: Mutex<HashMap<Uuid, ScheduleDefinition>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ScheduleDefinition>> {
        self.schedules.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ScheduleRepository for InMemoryScheduleRepository {
    async fn save(&self, schedule: &ScheduleDefinition) -> Result<(), RepositoryError> {
        self.lock().insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ScheduleDefinition>, RepositoryError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleDefinition>, RepositoryError> {
        Ok(self.lock().values().find(|s| s.name == name).cloned())
    }

    async fn list(&self) -> Result<Vec<ScheduleDefinition>, RepositoryError> {
        let mut schedules: Vec<_> = self.lock().values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduleDefinition>, RepositoryError> {
        let mut due: Vec<_> = self
            .lock()
            .values()
            .filter(|s| s.enabled && s.next_run_at.is_some_and(|t| t <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn mark_fired(
        &self,
        id: &Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut schedules = self.lock();
        let schedule = schedules
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("schedule {id}")))?;
        schedule.last_run_at = Some(last_run_at);
        schedule.next_run_at = next_run_at;
        Ok(())
    }

    async fn set_enabled(&self, id: &Uuid, enabled: bool) -> Result<(), RepositoryError> {
        let mut schedules = self.lock();
        let schedule = schedules
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("schedule {id}")))?;
        schedule.enabled = enabled;
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.lock().remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_instance(mutex_key: Option<&str>) -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_name: "wf".to_string(),
            definition_version: "1.0".to_string(),
            status: InstanceStatus::Pending,
            input: Value::Null,
            output: None,
            variables: json!({}),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
            mutex_key: mutex_key.map(String::from),
            business_key: None,
            parent_instance_id: None,
            parent_node_id: None,
            engine_id: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn make_node(instance_id: Uuid, parent: Option<Uuid>, index: Option<u32>) -> NodeInstance {
        NodeInstance {
            id: Uuid::now_v7(),
            workflow_instance_id: instance_id,
            node_id: "step".to_string(),
            node_type: taskforge_types::workflow::NodeType::Simple,
            status: NodeStatus::Pending,
            parent_node_id: parent,
            child_index: index,
            loop_progress: None,
            retry_count: 0,
            max_retries: 2,
            run_after: None,
            input: Value::Null,
            output: None,
            error_details: None,
            progress: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    // -- Mutex arbitration --

    #[tokio::test]
    async fn test_create_instance_rejects_held_mutex_key() {
        let repo = InMemoryWorkflowRepository::new();
        repo.create_instance(&make_instance(Some("nightly")))
            .await
            .unwrap();

        let err = repo
            .create_instance(&make_instance(Some("nightly")))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminal_instance_releases_mutex_key() {
        let repo = InMemoryWorkflowRepository::new();
        let first = make_instance(Some("nightly"));
        repo.create_instance(&first).await.unwrap();
        repo.update_instance_status(&first.id, InstanceStatus::Completed, None, None)
            .await
            .unwrap();

        repo.create_instance(&make_instance(Some("nightly")))
            .await
            .unwrap();
    }

    // -- CAS transitions --

    #[tokio::test]
    async fn test_transition_node_cas() {
        let repo = InMemoryWorkflowRepository::new();
        let node = make_node(Uuid::now_v7(), None, None);
        repo.create_node(&node).await.unwrap();

        let won = repo
            .transition_node(
                &node.id,
                &[NodeStatus::Pending, NodeStatus::FailedRetry],
                NodeStatus::Running,
                NodePatch::default(),
            )
            .await
            .unwrap();
        assert!(won);

        // Second attempt from the same expected set loses.
        let won = repo
            .transition_node(
                &node.id,
                &[NodeStatus::Pending, NodeStatus::FailedRetry],
                NodeStatus::Running,
                NodePatch::default(),
            )
            .await
            .unwrap();
        assert!(!won);

        let stored = repo.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Running);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn test_transition_patch_applies_only_on_win() {
        let repo = InMemoryWorkflowRepository::new();
        let node = make_node(Uuid::now_v7(), None, None);
        repo.create_node(&node).await.unwrap();

        let won = repo
            .transition_node(
                &node.id,
                &[NodeStatus::Running],
                NodeStatus::Completed,
                NodePatch::completed(json!({"n": 1})),
            )
            .await
            .unwrap();
        assert!(!won);
        let stored = repo.get_node(&node.id).await.unwrap().unwrap();
        assert!(stored.output.is_none());
        assert_eq!(stored.status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_set_node_progress_overwrites_snapshot() {
        let repo = InMemoryWorkflowRepository::new();
        let node = make_node(Uuid::now_v7(), None, None);
        repo.create_node(&node).await.unwrap();

        repo.set_node_progress(&node.id, &json!({"done": 3}))
            .await
            .unwrap();
        repo.set_node_progress(&node.id, &json!({"done": 7}))
            .await
            .unwrap();

        let stored = repo.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(json!({"done": 7})));
        assert_eq!(stored.status, NodeStatus::Pending);

        let err = repo
            .set_node_progress(&Uuid::now_v7(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    // -- Expansion atomicity --

    #[tokio::test]
    async fn test_expand_node_atomic_under_injected_failure() {
        let repo = InMemoryWorkflowRepository::new();
        let instance_id = Uuid::now_v7();
        let mut parent = make_node(instance_id, None, None);
        parent.node_type = taskforge_types::workflow::NodeType::Loop;
        repo.create_node(&parent).await.unwrap();

        let children: Vec<_> = (0..3)
            .map(|i| make_node(instance_id, Some(parent.id), Some(i)))
            .collect();

        repo.fail_next_writes(1);
        let err = repo.expand_node(&parent.id, &children).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Query(_)));

        // Nothing landed: no children, parent untouched.
        assert!(repo.list_children(&parent.id).await.unwrap().is_empty());
        let stored = repo.get_node(&parent.id).await.unwrap().unwrap();
        assert!(stored.loop_progress.is_none());

        // Retry succeeds cleanly.
        repo.expand_node(&parent.id, &children).await.unwrap();
        assert_eq!(repo.list_children(&parent.id).await.unwrap().len(), 3);
        let progress = repo
            .get_node(&parent.id)
            .await
            .unwrap()
            .unwrap()
            .loop_progress
            .unwrap();
        assert_eq!(progress.status, LoopPhase::Executing);
        assert_eq!(progress.total_count, 3);
    }

    #[tokio::test]
    async fn test_increment_loop_progress() {
        let repo = InMemoryWorkflowRepository::new();
        let instance_id = Uuid::now_v7();
        let parent = make_node(instance_id, None, None);
        repo.create_node(&parent).await.unwrap();
        let children: Vec<_> = (0..2)
            .map(|i| make_node(instance_id, Some(parent.id), Some(i)))
            .collect();
        repo.expand_node(&parent.id, &children).await.unwrap();

        let p = repo.increment_loop_progress(&parent.id, 1, 0).await.unwrap();
        assert_eq!(p.completed_count, 1);
        let p = repo.increment_loop_progress(&parent.id, 0, 1).await.unwrap();
        assert_eq!(p.failed_count, 1);
        assert!(p.all_settled());
        assert!(p.is_consistent());
    }

    // -- Due nodes --

    #[tokio::test]
    async fn test_find_due_nodes_respects_run_after() {
        let repo = InMemoryWorkflowRepository::new();
        let instance_id = Uuid::now_v7();

        let mut due = make_node(instance_id, None, None);
        due.status = NodeStatus::FailedRetry;
        due.run_after = Some(Utc::now() - chrono::Duration::seconds(5));
        repo.create_node(&due).await.unwrap();

        let mut future = make_node(instance_id, None, None);
        future.status = NodeStatus::FailedRetry;
        future.run_after = Some(Utc::now() + chrono::Duration::hours(1));
        repo.create_node(&future).await.unwrap();

        let mut no_timer = make_node(instance_id, None, None);
        no_timer.status = NodeStatus::Pending;
        no_timer.run_after = None;
        repo.create_node(&no_timer).await.unwrap();

        let found = repo.find_due_nodes(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    // -- Claims --

    #[tokio::test]
    async fn test_claim_instance_conditional() {
        let repo = InMemoryWorkflowRepository::new();
        let mut instance = make_instance(None);
        instance.engine_id = Some("engine-a".to_string());
        instance.status = InstanceStatus::Running;
        repo.create_instance(&instance).await.unwrap();

        // Wrong previous owner loses.
        assert!(
            !repo
                .claim_instance(&instance.id, "engine-c", Some("engine-b"))
                .await
                .unwrap()
        );
        // Correct previous owner wins.
        assert!(
            repo.claim_instance(&instance.id, "engine-b", Some("engine-a"))
                .await
                .unwrap()
        );
        let stored = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.engine_id.as_deref(), Some("engine-b"));

        // Terminal instances cannot be claimed.
        repo.update_instance_status(&instance.id, InstanceStatus::Completed, None, None)
            .await
            .unwrap();
        assert!(
            !repo
                .claim_instance(&instance.id, "engine-d", None)
                .await
                .unwrap()
        );
    }
}
