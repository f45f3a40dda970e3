//! Scheduler service: one cooperative loop, three periodic passes.
//!
//! - **Schedule scan**: fire due schedules (cron or interval triggers).
//!   Occurrences missed while no engine was running collapse into a single
//!   fire; the next occurrence is always computed from now, never replayed
//!   one by one.
//! - **Dispatch**: pick up due node rows (durable retries and recovered
//!   work) and execute them, bounded by the engine's concurrency limit.
//! - **Recovery**: find stale engines, claim their non-terminal instances,
//!   and resume them here.
//!
//! All three passes are driven by timers in `run` and are also callable
//! individually, which is how the tests exercise them deterministically.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskforge_types::config::EngineConfig;
use taskforge_types::error::EngineError;
use taskforge_types::schedule::{ScheduleDefinition, TriggerSpec};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::repository::engine::EngineRepository;
use crate::repository::schedule::ScheduleRepository;
use crate::repository::workflow::WorkflowRepository;

use super::instance::{StartOptions, StartOutcome, WorkflowInstanceService};
use super::node::NodeExecutionService;

// ---------------------------------------------------------------------------
// Occurrence computation
// ---------------------------------------------------------------------------

/// The first occurrence of `trigger` strictly after `after`.
pub fn next_occurrence(
    trigger: &TriggerSpec,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    match trigger {
        TriggerSpec::Cron { expression } => {
            let cron = expression
                .parse::<croner::Cron>()
                .map_err(|e| EngineError::Validation(format!("cron '{expression}': {e}")))?;
            Ok(cron.iter_after(after).next())
        }
        TriggerSpec::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(EngineError::Validation("interval must be > 0".to_string()));
            }
            Ok(Some(after + Duration::seconds(*every_secs as i64)))
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerService
// ---------------------------------------------------------------------------

/// Runs the periodic passes for one engine process.
pub struct SchedulerService<R, S, E> {
    workflow_repo: Arc<R>,
    schedules: Arc<S>,
    engines: Arc<E>,
    instances: Arc<WorkflowInstanceService<R>>,
    nodes: Arc<NodeExecutionService<R>>,
    config: Arc<EngineConfig>,
    engine_id: String,
    dispatch_permits: Arc<Semaphore>,
}

impl<R, S, E> SchedulerService<R, S, E>
where
    R: WorkflowRepository + 'static,
    S: ScheduleRepository + 'static,
    E: EngineRepository + 'static,
{
    pub fn new(
        workflow_repo: Arc<R>,
        schedules: Arc<S>,
        engines: Arc<E>,
        instances: Arc<WorkflowInstanceService<R>>,
        nodes: Arc<NodeExecutionService<R>>,
        config: Arc<EngineConfig>,
        engine_id: impl Into<String>,
    ) -> Self {
        let dispatch_permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            workflow_repo,
            schedules,
            engines,
            instances,
            nodes,
            config,
            engine_id: engine_id.into(),
            dispatch_permits,
        }
    }

    /// Register a schedule, computing its first occurrence.
    pub async fn register_schedule(
        &self,
        mut schedule: ScheduleDefinition,
    ) -> Result<ScheduleDefinition, EngineError> {
        if schedule.next_run_at.is_none() {
            schedule.next_run_at = next_occurrence(&schedule.trigger, Utc::now())?;
        }
        self.schedules.save(&schedule).await?;
        tracing::info!(
            schedule = %schedule.name,
            next_run_at = ?schedule.next_run_at,
            "schedule registered"
        );
        Ok(schedule)
    }

    /// Run all passes on their intervals until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut scan = tokio::time::interval(std::time::Duration::from_secs(
            self.config.schedule_scan_interval_secs,
        ));
        let mut dispatch = tokio::time::interval(std::time::Duration::from_millis(
            self.config.dispatch_interval_ms,
        ));
        let mut recovery = tokio::time::interval(std::time::Duration::from_secs(
            self.config.recovery_interval_secs,
        ));
        for ticker in [&mut scan, &mut dispatch, &mut recovery] {
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        tracing::info!(engine_id = %self.engine_id, "scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = scan.tick() => {
                    if let Err(e) = self.scan_schedules().await {
                        tracing::error!(error = %e, "schedule scan pass failed");
                    }
                }
                _ = dispatch.tick() => {
                    if let Err(e) = self.dispatch_due_nodes().await {
                        tracing::error!(error = %e, "dispatch pass failed");
                    }
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.recover_stale_engines().await {
                        tracing::error!(error = %e, "recovery pass failed");
                    }
                }
            }
        }
        tracing::info!(engine_id = %self.engine_id, "scheduler stopped");
    }

    // -----------------------------------------------------------------------
    // Schedule scan pass
    // -----------------------------------------------------------------------

    /// Fire every due schedule once and advance its next occurrence.
    pub async fn scan_schedules(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        let due = self.schedules.find_due(now, 64).await?;
        for schedule in due {
            // One broken schedule must not starve the rest of the batch.
            let next = match next_occurrence(&schedule.trigger, now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(
                        schedule = %schedule.name,
                        error = %e,
                        "schedule trigger rejected, skipping"
                    );
                    continue;
                }
            };
            // Advance before firing so a crash mid-fire cannot replay the
            // occurrence; the run itself is guarded by the mutex key anyway.
            if let Err(e) = self.schedules.mark_fired(&schedule.id, now, next).await {
                tracing::error!(
                    schedule = %schedule.name,
                    error = %e,
                    "schedule advance failed, skipping"
                );
                continue;
            }

            let options = StartOptions {
                mutex_key: Some(schedule.effective_mutex_key().to_string()),
                business_key: None,
                scheduled_at: Some(now),
                max_instances: schedule.max_instances,
            };
            match self
                .instances
                .start(&schedule.workflow, schedule.input.clone(), options)
                .await
            {
                Ok(StartOutcome::Started(instance)) => {
                    tracing::info!(
                        schedule = %schedule.name,
                        instance_id = %instance.id,
                        "scheduled workflow fired"
                    );
                }
                Ok(StartOutcome::AlreadyRunning(holder)) => {
                    tracing::info!(
                        schedule = %schedule.name,
                        holder = %holder.id,
                        "scheduled fire skipped, previous run still active"
                    );
                }
                Err(EngineError::ConcurrencyConflict(msg)) => {
                    tracing::info!(schedule = %schedule.name, %msg, "scheduled fire refused");
                }
                Err(e) => {
                    tracing::error!(schedule = %schedule.name, error = %e, "scheduled fire failed");
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch pass
    // -----------------------------------------------------------------------

    /// Execute every due node, at most `max_concurrency` at a time.
    /// Returns the number of nodes dispatched.
    pub async fn dispatch_due_nodes(&self) -> Result<usize, EngineError> {
        let due = self
            .workflow_repo
            .find_due_nodes(Utc::now(), self.config.dispatch_batch_size)
            .await?;
        let count = due.len();
        if count == 0 {
            return Ok(0);
        }

        let mut tasks = JoinSet::new();
        for node in due {
            let permit = Arc::clone(&self.dispatch_permits)
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Transaction(e.to_string()))?;
            let nodes = Arc::clone(&self.nodes);
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = nodes.execute_node(node.id).await {
                    tracing::error!(
                        node_instance = %node.id,
                        error = %e,
                        "due node dispatch failed"
                    );
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Recovery pass
    // -----------------------------------------------------------------------

    /// Claim and resume instances owned by stale engines.
    /// Returns the number of instances this engine took over.
    pub async fn recover_stale_engines(&self) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - Duration::seconds(self.config.stale_engine_timeout_secs as i64);
        let stale = self.engines.find_stale(cutoff).await?;
        let mut recovered = 0;

        for engine in stale {
            tracing::warn!(
                stale_engine = %engine.instance_id,
                last_heartbeat = %engine.last_heartbeat,
                "stale engine detected"
            );
            let orphans = self
                .workflow_repo
                .list_active_owned_by(&engine.instance_id)
                .await?;
            for orphan in orphans {
                // Conditional claim: exactly one recovering engine wins.
                let claimed = self
                    .workflow_repo
                    .claim_instance(&orphan.id, &self.engine_id, Some(&engine.instance_id))
                    .await?;
                if !claimed {
                    continue;
                }
                tracing::info!(
                    instance_id = %orphan.id,
                    from = %engine.instance_id,
                    "orphaned instance claimed"
                );
                if let Err(e) = self.instances.resume(orphan.id).await {
                    tracing::error!(
                        instance_id = %orphan.id,
                        error = %e,
                        "recovered instance resume failed"
                    );
                } else {
                    recovered += 1;
                }
            }
            // Settled: stop re-scanning this engine every pass.
            self.engines
                .update_status(&engine.instance_id, taskforge_types::engine::EngineStatus::Inactive)
                .await?;
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_occurrence_interval() {
        let after = Utc::now();
        let trigger = TriggerSpec::Interval { every_secs: 300 };
        let next = next_occurrence(&trigger, after).unwrap().unwrap();
        assert_eq!(next - after, Duration::seconds(300));
    }

    #[test]
    fn test_next_occurrence_interval_zero_rejected() {
        let trigger = TriggerSpec::Interval { every_secs: 0 };
        assert!(next_occurrence(&trigger, Utc::now()).is_err());
    }

    #[test]
    fn test_next_occurrence_cron() {
        // Every minute at second 0.
        let trigger = TriggerSpec::Cron {
            expression: "0 * * * * *".to_string(),
        };
        let after = Utc::now();
        let next = next_occurrence(&trigger, after).unwrap().unwrap();
        assert!(next > after);
        assert!(next - after <= Duration::seconds(60));
    }

    #[test]
    fn test_next_occurrence_invalid_cron() {
        let trigger = TriggerSpec::Cron {
            expression: "not a cron".to_string(),
        };
        let err = next_occurrence(&trigger, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn test_missed_occurrences_collapse() {
        // next_run_at long in the past: the next occurrence computed from
        // now skips everything in between.
        let trigger = TriggerSpec::Interval { every_secs: 60 };
        let now = Utc::now();
        let next = next_occurrence(&trigger, now).unwrap().unwrap();
        assert!(next > now);
    }
}
