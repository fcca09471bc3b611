//! Built-in job types.
//!
//! A migration names its job type as a string and stores its arguments as a
//! JSON document. Both are resolved into the closed `JobArguments` enum when
//! the migration is enqueued, so an unknown name or malformed argument
//! document never reaches the runner.
//!
//! Every job type turns a batch into a single range-bounded `UPDATE`
//! statement that is executed once per sub-batch:
//!
//! ```text
//! batch [1, 20000]
//!     ├─► sub-batch [1, 1000]      UPDATE ... WHERE id BETWEEN $1 AND $2
//!     ├─► sleep sub_batch_pause
//!     ├─► sub-batch [1001, 2000]
//!     └─► ...
//! ```

pub mod backfill_column;
pub mod copy_column;
pub mod sql;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use backfill_column::BackfillColumn;
pub use copy_column::CopyColumn;
pub use sql::ColumnValue;

use crate::bounds::BatchRange;
use crate::error::ConfigurationError;
use crate::models::Migration;
use crate::target::MigrationTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BackfillColumn,
    CopyColumn,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::BackfillColumn, JobType::CopyColumn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackfillColumn => "backfill_column",
            Self::CopyColumn => "copy_column",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::BackfillColumn => "Set columns to constant values",
            Self::CopyColumn => "Copy columns into other columns, casting if needed",
        }
    }
}

impl FromStr for JobType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backfill_column" => Ok(Self::BackfillColumn),
            "copy_column" => Ok(Self::CopyColumn),
            other => Err(ConfigurationError::UnknownJobType(other.to_string())),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed arguments of a migration, one variant per job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobArguments {
    BackfillColumn(BackfillColumn),
    CopyColumn(CopyColumn),
}

impl JobArguments {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::BackfillColumn(_) => JobType::BackfillColumn,
            Self::CopyColumn(_) => JobType::CopyColumn,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::BackfillColumn(args) => &args.table,
            Self::CopyColumn(args) => &args.table,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::BackfillColumn(args) => args.validate(),
            Self::CopyColumn(args) => args.validate(),
        }
    }

    /// Rebuild typed arguments from their persisted form.
    pub fn from_parts(job_type: JobType, value: serde_json::Value) -> Result<Self> {
        let args = match job_type {
            JobType::BackfillColumn => Self::BackfillColumn(
                serde_json::from_value(value)
                    .map_err(|e| ConfigurationError::InvalidOptions(e.to_string()))?,
            ),
            JobType::CopyColumn => Self::CopyColumn(
                serde_json::from_value(value)
                    .map_err(|e| ConfigurationError::InvalidOptions(e.to_string()))?,
            ),
        };
        Ok(args)
    }

    /// Persisted form of the arguments.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::BackfillColumn(args) => serde_json::to_value(args)?,
            Self::CopyColumn(args) => serde_json::to_value(args)?,
        };
        Ok(value)
    }

    /// The per-sub-batch statement for this job type.
    pub fn statement(&self, batch_column: &str) -> Result<String, ConfigurationError> {
        match self {
            Self::BackfillColumn(args) => args.statement(batch_column),
            Self::CopyColumn(args) => args.statement(batch_column),
        }
    }

    /// Process one batch, sub-batch by sub-batch. Returns the rows changed.
    pub async fn process_batch(
        &self,
        target: &dyn MigrationTarget,
        batch: &BatchContext,
    ) -> Result<u64> {
        let statement = self.statement(&batch.batch_column)?;
        run_sub_batches(target, &statement, batch).await
    }
}

impl From<BackfillColumn> for JobArguments {
    fn from(args: BackfillColumn) -> Self {
        Self::BackfillColumn(args)
    }
}

impl From<CopyColumn> for JobArguments {
    fn from(args: CopyColumn) -> Self {
        Self::CopyColumn(args)
    }
}

/// What a job type needs to know about the batch it is processing.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub range: BatchRange,
    pub batch_column: String,
    pub sub_batch_size: i64,
    pub sub_batch_pause: Duration,
}

impl BatchContext {
    pub fn for_migration(migration: &Migration, range: BatchRange) -> Self {
        Self {
            range,
            batch_column: migration.batch_column_name.clone(),
            sub_batch_size: migration.sub_batch_size,
            sub_batch_pause: migration.sub_batch_pause(),
        }
    }
}

/// Execute `statement` once per sub-batch of `batch.range`, pausing between
/// sub-batches.
pub async fn run_sub_batches(
    target: &dyn MigrationTarget,
    statement: &str,
    batch: &BatchContext,
) -> Result<u64> {
    let mut rows_affected = 0;

    for (index, sub_batch) in batch.range.split(batch.sub_batch_size).enumerate() {
        if index > 0 && !batch.sub_batch_pause.is_zero() {
            tokio::time::sleep(batch.sub_batch_pause).await;
        }

        debug!(
            min_value = sub_batch.min_value,
            max_value = sub_batch.max_value,
            "processing sub-batch"
        );

        rows_affected += target
            .execute_sub_batch(statement, sub_batch)
            .await
            .with_context(|| format!("Sub-batch {} failed", sub_batch))?;
    }

    Ok(rows_affected)
}

/// Executes one batch of a migration.
///
/// The runner only depends on this trait; `JobTypeProcessor` is the
/// production implementation.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, migration: &Migration, range: BatchRange) -> Result<u64>;
}

/// Dispatches batches to the built-in job types against a target database.
#[derive(Clone)]
pub struct JobTypeProcessor {
    target: Arc<dyn MigrationTarget>,
}

impl JobTypeProcessor {
    pub fn new(target: Arc<dyn MigrationTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl BatchProcessor for JobTypeProcessor {
    async fn process_batch(&self, migration: &Migration, range: BatchRange) -> Result<u64> {
        let args = migration.job_arguments()?;
        let batch = BatchContext::for_migration(migration, range);
        args.process_batch(self.target.as_ref(), &batch).await
    }
}
