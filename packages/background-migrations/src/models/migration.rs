//! Migration model.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::{MigrationJob, MigrationJobStatus};
use crate::bounds::{next_batch_bounds, BatchRange};
use crate::job_types::{JobArguments, JobType};

pub const DEFAULT_BATCH_SIZE: i64 = 20_000;
pub const DEFAULT_SUB_BATCH_SIZE: i64 = 1_000;
pub const DEFAULT_BATCH_PAUSE_SECS: i32 = 0;
pub const DEFAULT_SUB_BATCH_PAUSE_MS: i32 = 100;
pub const DEFAULT_BATCH_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "background_migration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    Enqueued,
    Running,
    /// Set by an operator; the runner stops before claiming the next batch
    Paused,
    Finished,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Whether the runner may claim batches for a migration in this status.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enqueued | Self::Running)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A background migration: one job type applied to a table range in batches.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Migration {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    // Identity
    pub job_type: String,
    pub arguments: serde_json::Value,
    pub table_name: String,
    #[builder(default = "id".to_string())]
    pub batch_column_name: String,

    // Range (inclusive)
    pub min_value: i64,
    pub max_value: i64,

    // Sizing
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: i64,
    #[builder(default = DEFAULT_SUB_BATCH_SIZE)]
    pub sub_batch_size: i64,

    // Throttling
    #[builder(default = DEFAULT_BATCH_PAUSE_SECS)]
    pub batch_pause: i32,
    #[builder(default = DEFAULT_SUB_BATCH_PAUSE_MS)]
    pub sub_batch_pause_ms: i32,

    // Retry
    #[builder(default = DEFAULT_BATCH_MAX_ATTEMPTS)]
    pub batch_max_attempts: i32,

    #[builder(default)]
    pub status: MigrationStatus,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Migration {
    pub fn range(&self) -> BatchRange {
        BatchRange::new(self.min_value, self.max_value)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_secs(self.batch_pause.max(0) as u64)
    }

    pub fn sub_batch_pause(&self) -> Duration {
        Duration::from_millis(self.sub_batch_pause_ms.max(0) as u64)
    }

    /// Parse the persisted job type name.
    pub fn job_type(&self) -> Result<JobType> {
        Ok(self.job_type.parse()?)
    }

    /// Decode the persisted argument document into its typed form.
    pub fn job_arguments(&self) -> Result<JobArguments> {
        JobArguments::from_parts(self.job_type()?, self.arguments.clone())
    }

    /// Next batch after `previous_max`, or `None` once the range is claimed.
    pub fn next_batch(&self, previous_max: Option<i64>) -> Option<BatchRange> {
        next_batch_bounds(self.range(), self.batch_size, previous_max)
    }

    /// Status implied by the migration's jobs.
    ///
    /// `Paused` is operator state and survives; everything else follows the
    /// jobs: an exhausted job fails the migration, a fully claimed range with
    /// every job succeeded finishes it.
    pub fn derive_status(&self, jobs: &[MigrationJob]) -> MigrationStatus {
        if self.status == MigrationStatus::Paused {
            return MigrationStatus::Paused;
        }

        if jobs
            .iter()
            .any(|job| job.attempts_exhausted(self.batch_max_attempts))
        {
            return MigrationStatus::Failed;
        }

        if jobs.is_empty() {
            return MigrationStatus::Enqueued;
        }

        let max_claimed = jobs.iter().map(|job| job.max_value).max();
        let all_succeeded = jobs
            .iter()
            .all(|job| job.status == MigrationJobStatus::Succeeded);

        if all_succeeded && self.next_batch(max_claimed).is_none() {
            MigrationStatus::Finished
        } else {
            MigrationStatus::Running
        }
    }

    /// Percentage of the range covered by succeeded jobs.
    pub fn progress(&self, jobs: &[MigrationJob]) -> f64 {
        let total = self.range().len();
        if total == 0 {
            return 100.0;
        }

        let done: u64 = jobs
            .iter()
            .filter(|job| job.status == MigrationJobStatus::Succeeded)
            .map(|job| job.range().len())
            .sum();

        (done as f64 / total as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_migration() -> Migration {
        Migration::builder()
            .job_type("backfill_column")
            .arguments(json!({"table": "users", "column_updates": {"admin": false}}))
            .table_name("users")
            .min_value(1)
            .max_value(100)
            .batch_size(30)
            .sub_batch_size(10)
            .batch_max_attempts(3)
            .build()
    }

    fn job(migration: &Migration, min: i64, max: i64, status: MigrationJobStatus, attempts: i32) -> MigrationJob {
        let mut job = MigrationJob::new(migration.id, BatchRange::new(min, max));
        job.status = status;
        job.attempts = attempts;
        job
    }

    #[test]
    fn builder_applies_defaults() {
        let migration = Migration::builder()
            .job_type("copy_column")
            .arguments(json!({}))
            .table_name("users")
            .min_value(1)
            .max_value(10)
            .build();

        assert_eq!(migration.batch_column_name, "id");
        assert_eq!(migration.batch_size, 20_000);
        assert_eq!(migration.sub_batch_size, 1_000);
        assert_eq!(migration.batch_pause, 0);
        assert_eq!(migration.sub_batch_pause_ms, 100);
        assert_eq!(migration.batch_max_attempts, 5);
        assert_eq!(migration.status, MigrationStatus::Enqueued);
    }

    #[test]
    fn no_jobs_is_enqueued() {
        let migration = sample_migration();
        assert_eq!(migration.derive_status(&[]), MigrationStatus::Enqueued);
    }

    #[test]
    fn partially_claimed_range_is_running() {
        let migration = sample_migration();
        let jobs = vec![job(&migration, 1, 30, MigrationJobStatus::Succeeded, 1)];
        assert_eq!(migration.derive_status(&jobs), MigrationStatus::Running);
    }

    #[test]
    fn fully_succeeded_range_is_finished() {
        let migration = sample_migration();
        let jobs = vec![
            job(&migration, 1, 30, MigrationJobStatus::Succeeded, 1),
            job(&migration, 31, 60, MigrationJobStatus::Succeeded, 2),
            job(&migration, 61, 90, MigrationJobStatus::Succeeded, 1),
            job(&migration, 91, 100, MigrationJobStatus::Succeeded, 1),
        ];
        assert_eq!(migration.derive_status(&jobs), MigrationStatus::Finished);
        assert_eq!(migration.progress(&jobs), 100.0);
    }

    #[test]
    fn failed_job_with_attempts_left_keeps_running() {
        let migration = sample_migration();
        let jobs = vec![job(&migration, 1, 30, MigrationJobStatus::Failed, 2)];
        assert_eq!(migration.derive_status(&jobs), MigrationStatus::Running);
    }

    #[test]
    fn exhausted_job_fails_migration() {
        let migration = sample_migration();
        let jobs = vec![
            job(&migration, 1, 30, MigrationJobStatus::Succeeded, 1),
            job(&migration, 31, 60, MigrationJobStatus::Failed, 3),
        ];
        assert_eq!(migration.derive_status(&jobs), MigrationStatus::Failed);
    }

    #[test]
    fn paused_survives_derivation() {
        let mut migration = sample_migration();
        migration.status = MigrationStatus::Paused;
        let jobs = vec![job(&migration, 1, 30, MigrationJobStatus::Succeeded, 1)];
        assert_eq!(migration.derive_status(&jobs), MigrationStatus::Paused);
    }

    #[test]
    fn progress_counts_only_succeeded_jobs() {
        let migration = sample_migration();
        let jobs = vec![
            job(&migration, 1, 30, MigrationJobStatus::Succeeded, 1),
            job(&migration, 31, 60, MigrationJobStatus::Failed, 1),
        ];
        assert_eq!(migration.progress(&jobs), 30.0);
    }

    #[test]
    fn job_arguments_round_trip_through_persisted_form() {
        let migration = sample_migration();
        let args = migration.job_arguments().unwrap();
        assert_eq!(args.job_type(), JobType::BackfillColumn);
    }

    #[test]
    fn unknown_job_type_is_rejected() {
        let mut migration = sample_migration();
        migration.job_type = "drop_everything".to_string();
        assert!(migration.job_arguments().is_err());
    }
}
