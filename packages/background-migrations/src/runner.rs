//! Migration runner.
//!
//! Drives a migration through its batches one job at a time:
//!
//! ```text
//! run_all_migration_jobs
//!     │
//!     └─► loop
//!           ├─► re-read migration (stop if paused/finished/failed)
//!           ├─► run_next_batch
//!           │     ├─► fail stuck jobs
//!           │     ├─► running job? → Busy
//!           │     ├─► failed job with attempts left? → retry that range
//!           │     ├─► else next bounds → create job (range taken? → Busy)
//!           │     └─► run_migration_job → mark running, process, persist
//!           └─► still active? sleep batch_pause : stop
//! ```
//!
//! Completion writes carry the attempt number of the claim. A runner whose
//! job was recovered as stuck and claimed again loses that claim, and its
//! late outcome is dropped instead of overwriting the new one.
//!
//! Failures never escape as errors: they are recorded on the job and
//! surface through the job and migration status. Errors returned from the
//! runner are store errors only.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::job_types::BatchProcessor;
use crate::models::{Migration, MigrationJob, MigrationJobStatus, MigrationStatus};
use crate::store::MigrationStore;

/// Configuration for the migration runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Running jobs older than this are assumed to belong to a dead runner
    pub stuck_job_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stuck_job_timeout: Duration::from_secs(3600),
        }
    }
}

impl From<&Config> for RunnerConfig {
    fn from(config: &Config) -> Self {
        Self {
            stuck_job_timeout: config.stuck_job_timeout,
        }
    }
}

/// Result of executing a single job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(MigrationJob),
    Failed(MigrationJob),
    /// The job could not be claimed (another job of the migration is running
    /// or this one was claimed by someone else), or the claim was lost to
    /// stuck-job recovery before the outcome could be recorded.
    Busy,
}

/// Result of one scheduling step for a migration.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "job", rename_all = "snake_case")]
pub enum BatchOutcome {
    Succeeded(MigrationJob),
    /// Failed with attempts left; the same range runs again next
    Retrying(MigrationJob),
    /// Failed with no attempts left; the migration is failed
    Exhausted(MigrationJob),
    /// The whole range is processed; the migration is finished
    Completed,
    /// Another runner holds the migration
    Busy,
    /// The migration is paused, finished or failed
    Inactive(MigrationStatus),
}

impl BatchOutcome {
    /// Whether a batch ran and more work may follow.
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Retrying(_))
    }
}

pub struct MigrationRunner {
    store: Arc<dyn MigrationStore>,
    processor: Arc<dyn BatchProcessor>,
    config: RunnerConfig,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn MigrationStore>, processor: Arc<dyn BatchProcessor>) -> Self {
        Self::with_config(store, processor, RunnerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn MigrationStore>,
        processor: Arc<dyn BatchProcessor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    /// Drive a migration until it finishes, fails, is paused, or another
    /// runner turns out to hold it.
    ///
    /// Sleeps `batch_pause` between batch executions: never before the
    /// first batch, and not after a batch that left the migration finished,
    /// failed or paused. The migration is re-read before every claim, so a
    /// pause takes effect between batches.
    pub async fn run_all_migration_jobs(&self, migration: &Migration) -> Result<Migration> {
        info!(
            migration_id = %migration.id,
            job_type = %migration.job_type,
            table = %migration.table_name,
            min_value = migration.min_value,
            max_value = migration.max_value,
            "running background migration"
        );

        let mut current = self.store.find_migration(migration.id).await?;
        let mut executed = 0usize;
        loop {
            let outcome = self.run_next_batch(&current).await?;
            if !outcome.should_continue() {
                debug!(migration_id = %migration.id, outcome = ?outcome, "background migration stopped");
                break;
            }
            executed += 1;

            current = self.store.find_migration(migration.id).await?;
            if !current.status.is_active() {
                break;
            }
            if !current.batch_pause().is_zero() {
                tokio::time::sleep(current.batch_pause()).await;
                current = self.store.find_migration(migration.id).await?;
            }
        }

        let migration = self.store.find_migration(migration.id).await?;
        info!(
            migration_id = %migration.id,
            status = %migration.status,
            batches = executed,
            "background migration run ended"
        );
        Ok(migration)
    }

    /// Claim and execute one batch of `migration`.
    pub async fn run_next_batch(&self, migration: &Migration) -> Result<BatchOutcome> {
        if !migration.status.is_active() {
            return Ok(BatchOutcome::Inactive(migration.status));
        }

        let recovered = self
            .store
            .fail_stuck_jobs(migration.id, self.config.stuck_job_timeout)
            .await?;
        if recovered > 0 {
            warn!(migration_id = %migration.id, count = recovered, "recovered stuck jobs");
        }

        // An exhausted job halts claims even if the status write was lost
        let migration = self.sync_status(migration).await?;
        if !migration.status.is_active() {
            return Ok(BatchOutcome::Inactive(migration.status));
        }

        if let Some(running) = self.store.running_job(migration.id).await? {
            debug!(
                migration_id = %migration.id,
                job_id = %running.id,
                "another job is running, deferring"
            );
            return Ok(BatchOutcome::Busy);
        }

        let job = match self
            .store
            .next_runnable_job(migration.id, migration.batch_max_attempts)
            .await?
        {
            Some(job) => job,
            None => {
                let previous_max = self.store.max_claimed_value(migration.id).await?;
                let Some(range) = migration.next_batch(previous_max) else {
                    let migration = self.sync_status(&migration).await?;
                    return Ok(match migration.status {
                        MigrationStatus::Finished => BatchOutcome::Completed,
                        status if status.is_active() => BatchOutcome::Busy,
                        status => BatchOutcome::Inactive(status),
                    });
                };

                match self.store.create_job(migration.id, range).await? {
                    Some(job) => job,
                    None => {
                        debug!(migration_id = %migration.id, range = %range, "range already claimed");
                        return Ok(BatchOutcome::Busy);
                    }
                }
            }
        };

        let job = match self.run_migration_job(&job).await? {
            JobOutcome::Succeeded(job) | JobOutcome::Failed(job) => job,
            JobOutcome::Busy => return Ok(BatchOutcome::Busy),
        };

        let migration = self.sync_status(&migration).await?;

        Ok(if job.status == MigrationJobStatus::Succeeded {
            if migration.status == MigrationStatus::Finished {
                info!(migration_id = %migration.id, "background migration finished");
            }
            BatchOutcome::Succeeded(job)
        } else if job.attempts_exhausted(migration.batch_max_attempts) {
            error!(
                migration_id = %migration.id,
                job_id = %job.id,
                min_value = job.min_value,
                max_value = job.max_value,
                attempts = job.attempts,
                error = job.error_message.as_deref().unwrap_or_default(),
                "job exhausted its attempts, background migration failed"
            );
            BatchOutcome::Exhausted(job)
        } else {
            BatchOutcome::Retrying(job)
        })
    }

    /// Execute exactly one job and persist its outcome.
    pub async fn run_migration_job(&self, job: &MigrationJob) -> Result<JobOutcome> {
        let migration = self.store.find_migration(job.migration_id).await?;

        let Some(job) = self.store.mark_job_running(job.id).await? else {
            return Ok(JobOutcome::Busy);
        };

        self.store
            .transition_migration_status(
                migration.id,
                &[MigrationStatus::Enqueued],
                MigrationStatus::Running,
            )
            .await?;

        info!(
            migration_id = %migration.id,
            job_id = %job.id,
            min_value = job.min_value,
            max_value = job.max_value,
            attempt = job.attempts,
            "processing batch"
        );

        let result = AssertUnwindSafe(self.processor.process_batch(&migration, job.range()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow!("Batch processor panicked: {}", panic_message(&panic))));

        match result {
            Ok(rows_affected) => {
                let Some(job) = self
                    .store
                    .mark_job_succeeded(job.id, job.attempts, rows_affected)
                    .await?
                else {
                    warn!(
                        migration_id = %migration.id,
                        job_id = %job.id,
                        attempt = job.attempts,
                        "claim lost before batch success was recorded, dropping outcome"
                    );
                    return Ok(JobOutcome::Busy);
                };
                info!(
                    migration_id = %migration.id,
                    job_id = %job.id,
                    rows_affected,
                    "batch succeeded"
                );
                Ok(JobOutcome::Succeeded(job))
            }
            Err(e) => {
                warn!(
                    migration_id = %migration.id,
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = migration.batch_max_attempts,
                    error = %e,
                    "batch failed"
                );
                let Some(job) = self
                    .store
                    .mark_job_failed(job.id, job.attempts, &e.to_string(), &format!("{:?}", e))
                    .await?
                else {
                    warn!(
                        migration_id = %migration.id,
                        job_id = %job.id,
                        attempt = job.attempts,
                        "claim lost before batch failure was recorded, dropping outcome"
                    );
                    return Ok(JobOutcome::Busy);
                };
                Ok(JobOutcome::Failed(job))
            }
        }
    }

    /// Persist the status implied by the migration's jobs.
    ///
    /// Only moves migrations that are still active, so an operator's pause
    /// is never overwritten.
    async fn sync_status(&self, migration: &Migration) -> Result<Migration> {
        let current = self.store.find_migration(migration.id).await?;
        let jobs = self.store.jobs_for_migration(migration.id).await?;
        let derived = current.derive_status(&jobs);

        if derived == current.status || !current.status.is_active() {
            return Ok(current);
        }

        let updated = self
            .store
            .transition_migration_status(
                migration.id,
                &[MigrationStatus::Enqueued, MigrationStatus::Running],
                derived,
            )
            .await?;

        match updated {
            Some(migration) => Ok(migration),
            None => self.store.find_migration(migration.id).await,
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
