//! Schedule repository trait definition.

use chrono::{DateTime, Utc};
use taskforge_types::error::RepositoryError;
use taskforge_types::schedule::ScheduleDefinition;
use uuid::Uuid;

/// Repository trait for durable schedules.
///
/// Schedules are rows with a precomputed `next_run_at`; the scheduler's
/// scan pass queries `find_due` instead of holding in-process timers.
pub trait ScheduleRepository: Send + Sync {
    /// Insert or replace a schedule by ID.
    fn save(
        &self,
        schedule: &ScheduleDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a schedule by its UUID.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ScheduleDefinition>, RepositoryError>> + Send;

    /// Get a schedule by its unique name.
    fn get_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<ScheduleDefinition>, RepositoryError>> + Send;

    /// List all schedules.
    fn list(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ScheduleDefinition>, RepositoryError>> + Send;

    /// Enabled schedules with `next_run_at <= now`, oldest first.
    fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ScheduleDefinition>, RepositoryError>> + Send;

    /// Record a fire: set `last_run_at` and the next occurrence.
    fn mark_fired(
        &self,
        id: &Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Enable or disable a schedule.
    fn set_enabled(
        &self,
        id: &Uuid,
        enabled: bool,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a schedule. Returns `true` if it existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
