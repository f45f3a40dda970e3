//! Engine instance registry service.
//!
//! Registers this engine process in the shared store and keeps its
//! heartbeat fresh. Other engines read the registry to find stale peers;
//! there is no direct engine-to-engine communication.

use std::sync::Arc;

use chrono::{Duration, Utc};
use taskforge_types::config::EngineConfig;
use taskforge_types::engine::{EngineInstance, EngineLoad, EngineStatus};
use taskforge_types::error::EngineError;
use tokio_util::sync::CancellationToken;

use crate::repository::engine::EngineRepository;

/// Source of the load snapshot reported with each heartbeat.
pub type LoadProvider = Arc<dyn Fn() -> EngineLoad + Send + Sync>;

/// Registers and heartbeats one engine process.
pub struct EngineRegistryService<E> {
    repo: Arc<E>,
    instance_id: String,
    hostname: String,
    supported_executors: Vec<String>,
    config: Arc<EngineConfig>,
    load_provider: LoadProvider,
}

impl<E: EngineRepository + 'static> EngineRegistryService<E> {
    pub fn new(
        repo: Arc<E>,
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        supported_executors: Vec<String>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            repo,
            instance_id: instance_id.into(),
            hostname: hostname.into(),
            supported_executors,
            config,
            load_provider: Arc::new(EngineLoad::default),
        }
    }

    /// Use a custom load snapshot source for heartbeats.
    pub fn with_load_provider(mut self, provider: LoadProvider) -> Self {
        self.load_provider = provider;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register this engine as Active.
    pub async fn register(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        let engine = EngineInstance {
            instance_id: self.instance_id.clone(),
            hostname: self.hostname.clone(),
            status: EngineStatus::Active,
            supported_executors: self.supported_executors.clone(),
            load: (self.load_provider)(),
            started_at: now,
            last_heartbeat: now,
        };
        self.repo.register(&engine).await?;
        tracing::info!(engine_id = %self.instance_id, "engine registered");
        Ok(())
    }

    /// Publish one heartbeat with the current load snapshot.
    pub async fn heartbeat_once(&self) -> Result<(), EngineError> {
        self.repo
            .heartbeat(&self.instance_id, (self.load_provider)(), Utc::now())
            .await?;
        Ok(())
    }

    /// Mark this engine Inactive. Call on clean shutdown so peers skip the
    /// staleness wait and this engine's work can be handed off immediately.
    pub async fn deregister(&self) -> Result<(), EngineError> {
        self.repo
            .update_status(&self.instance_id, EngineStatus::Inactive)
            .await?;
        tracing::info!(engine_id = %self.instance_id, "engine deregistered");
        Ok(())
    }

    /// Stop accepting new work without deregistering.
    pub async fn enter_maintenance(&self) -> Result<(), EngineError> {
        self.repo
            .update_status(&self.instance_id, EngineStatus::Maintenance)
            .await?;
        Ok(())
    }

    /// Engines whose heartbeat exceeded the stale timeout.
    pub async fn stale_engines(&self) -> Result<Vec<EngineInstance>, EngineError> {
        let cutoff = Utc::now() - Duration::seconds(self.config.stale_engine_timeout_secs as i64);
        Ok(self.repo.find_stale(cutoff).await?)
    }

    /// Heartbeat until cancelled, then deregister.
    pub async fn run_heartbeat(&self, cancel: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.heartbeat_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        tracing::warn!(engine_id = %self.instance_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
        if let Err(e) = self.deregister().await {
            tracing::warn!(engine_id = %self.instance_id, error = %e, "deregistration failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
