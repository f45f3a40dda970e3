//! Engine registry repository trait definition.

use chrono::{DateTime, Utc};
use taskforge_types::engine::{EngineInstance, EngineLoad, EngineStatus};
use taskforge_types::error::RepositoryError;

/// Repository trait for the engine instance registry.
///
/// One row per engine process. Heartbeat staleness read from this table is
/// the recovery pass's only liveness signal.
pub trait EngineRepository: Send + Sync {
    /// Insert or replace an engine registration.
    fn register(
        &self,
        engine: &EngineInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record a heartbeat with the current load snapshot.
    fn heartbeat(
        &self,
        instance_id: &str,
        load: EngineLoad,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update an engine's lifecycle status.
    fn update_status(
        &self,
        instance_id: &str,
        status: EngineStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an engine by its instance ID.
    fn get(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<EngineInstance>, RepositoryError>> + Send;

    /// List all registered engines.
    fn list(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<EngineInstance>, RepositoryError>> + Send;

    /// Engines whose last heartbeat is older than `cutoff` and that are not
    /// Inactive.
    fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<EngineInstance>, RepositoryError>> + Send;

    /// Remove an engine registration. Returns `true` if it existed.
    fn delete(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
