//! Persistence for migrations and their jobs.
//!
//! Every write is a single-row, single-statement update so that concurrent
//! runners inspecting the same migration can only race at the statement
//! level, where the store's uniqueness rules decide the winner:
//!
//! - one job per `(migration_id, min_value)`: a second claimer of the same
//!   range gets `None` from `create_job`
//! - one running job per migration: a second claimer gets `None` from
//!   `mark_job_running`
//! - only the current claim completes a job: `mark_job_succeeded` and
//!   `mark_job_failed` take the attempt number returned by
//!   `mark_job_running` and return `None` once that claim is gone

mod memory;
mod postgres;

pub use memory::InMemoryMigrationStore;
pub use postgres::{run_schema_migrations, PostgresMigrationStore};

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::bounds::BatchRange;
use crate::models::{Migration, MigrationJob, MigrationStatus};

/// Error message recorded on jobs recovered by `fail_stuck_jobs`.
pub const STUCK_JOB_ERROR: &str = "stuck job";

#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Persist a new migration.
    async fn insert_migration(&self, migration: &Migration) -> Result<Migration>;

    async fn find_migration(&self, id: Uuid) -> Result<Migration>;

    /// All migrations, oldest first.
    async fn list_migrations(&self) -> Result<Vec<Migration>>;

    /// Migrations the runner may claim batches for, oldest first.
    async fn active_migrations(&self) -> Result<Vec<Migration>>;

    /// Move a migration to `to` if its current status is one of `from`.
    ///
    /// Returns `None` when the migration was in some other status.
    async fn transition_migration_status(
        &self,
        id: Uuid,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<Option<Migration>>;

    /// Jobs of a migration ordered by `min_value`.
    async fn jobs_for_migration(&self, migration_id: Uuid) -> Result<Vec<MigrationJob>>;

    async fn running_job(&self, migration_id: Uuid) -> Result<Option<MigrationJob>>;

    /// Highest `max_value` claimed by any job of the migration.
    async fn max_claimed_value(&self, migration_id: Uuid) -> Result<Option<i64>>;

    /// Lowest-range enqueued or failed job with attempts left.
    async fn next_runnable_job(
        &self,
        migration_id: Uuid,
        max_attempts: i32,
    ) -> Result<Option<MigrationJob>>;

    /// Insert an enqueued job for `range`; `None` if the range is taken.
    async fn create_job(&self, migration_id: Uuid, range: BatchRange)
        -> Result<Option<MigrationJob>>;

    /// Claim a job: enqueued/failed → running, `attempts + 1`.
    ///
    /// `None` if the job is not claimable or another job of the same
    /// migration is already running.
    async fn mark_job_running(&self, job_id: Uuid) -> Result<Option<MigrationJob>>;

    /// Record success of the claim identified by `attempt`.
    ///
    /// `None` if the job is no longer running under that attempt, i.e. it
    /// was recovered as stuck and claimed again. The stale outcome is dropped.
    async fn mark_job_succeeded(
        &self,
        job_id: Uuid,
        attempt: i32,
        rows_affected: u64,
    ) -> Result<Option<MigrationJob>>;

    /// Record failure of the claim identified by `attempt`; `None` as for
    /// `mark_job_succeeded`.
    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        attempt: i32,
        error_message: &str,
        error_backtrace: &str,
    ) -> Result<Option<MigrationJob>>;

    /// Fail jobs left running longer than `timeout`. Returns how many.
    async fn fail_stuck_jobs(&self, migration_id: Uuid, timeout: Duration) -> Result<u64>;

    /// Give failed jobs a fresh attempt budget. Returns how many.
    async fn reset_failed_jobs(&self, migration_id: Uuid) -> Result<u64>;
}
