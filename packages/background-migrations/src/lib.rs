//! Batched, resumable data migrations for large Postgres tables.
//!
//! A migration applies one job type (backfill a column, copy columns) to a
//! range of a table's batch column. The runner claims the range one batch at
//! a time, records every batch as a job, retries failed batches and throttles
//! between them, so no statement holds locks for long and a crashed run can
//! pick up where it stopped.

pub mod bounds;
pub mod config;
pub mod engine;
pub mod enqueue;
pub mod error;
pub mod job_types;
pub mod models;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod target;
pub mod testing;

pub use bounds::{next_batch_bounds, BatchRange};
pub use config::Config;
pub use engine::{BackgroundMigrations, MigrationReport};
pub use enqueue::{EnqueueOptions, ExecutionMode};
pub use error::ConfigurationError;
pub use job_types::{
    BackfillColumn, BatchProcessor, ColumnValue, CopyColumn, JobArguments, JobType,
    JobTypeProcessor,
};
pub use models::{Migration, MigrationJob, MigrationJobStatus, MigrationStatus};
pub use runner::{BatchOutcome, JobOutcome, MigrationRunner, RunnerConfig};
pub use scheduler::{ScheduledBatch, Scheduler};
pub use store::{InMemoryMigrationStore, MigrationStore, PostgresMigrationStore};
pub use target::{MigrationTarget, PostgresTarget};
