//! Job model: one batch range of a migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::bounds::BatchRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "background_migration_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationJobStatus {
    #[default]
    Enqueued,
    Running,
    Succeeded,
    Failed,
}

impl MigrationJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MigrationJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub migration_id: Uuid,

    // Range (inclusive)
    pub min_value: i64,
    pub max_value: i64,

    pub status: MigrationJobStatus,
    pub attempts: i32,
    pub rows_affected: Option<i64>,

    // Error tracking (cleared on success)
    pub error_message: Option<String>,
    pub error_backtrace: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationJob {
    /// A fresh enqueued job for `range`.
    pub fn new(migration_id: Uuid, range: BatchRange) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            migration_id,
            min_value: range.min_value,
            max_value: range.max_value,
            status: MigrationJobStatus::Enqueued,
            attempts: 0,
            rows_affected: None,
            error_message: None,
            error_backtrace: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn range(&self) -> BatchRange {
        BatchRange::new(self.min_value, self.max_value)
    }

    /// Whether this job may be (re)started under the given attempt budget.
    pub fn is_runnable(&self, max_attempts: i32) -> bool {
        matches!(
            self.status,
            MigrationJobStatus::Enqueued | MigrationJobStatus::Failed
        ) && self.attempts < max_attempts
    }

    /// Failed with no attempts left.
    pub fn attempts_exhausted(&self, max_attempts: i32) -> bool {
        self.status == MigrationJobStatus::Failed && self.attempts >= max_attempts
    }

    pub fn overlaps(&self, other: &MigrationJob) -> bool {
        self.min_value <= other.max_value && other.min_value <= self.max_value
    }
}
