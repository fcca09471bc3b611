//! Entry point for enqueuing and operating background migrations.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::enqueue::{build_migration, EnqueueOptions, ExecutionMode};
use crate::job_types::{BackfillColumn, ColumnValue, CopyColumn, JobArguments, JobTypeProcessor};
use crate::models::{Migration, MigrationJob, MigrationJobStatus, MigrationStatus};
use crate::runner::{MigrationRunner, RunnerConfig};
use crate::store::{MigrationStore, PostgresMigrationStore};
use crate::target::{MigrationTarget, PostgresTarget};

/// Store, target database and runner wired together.
pub struct BackgroundMigrations {
    store: Arc<dyn MigrationStore>,
    target: Arc<dyn MigrationTarget>,
    runner: Arc<MigrationRunner>,
}

impl BackgroundMigrations {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        target: Arc<dyn MigrationTarget>,
        config: RunnerConfig,
    ) -> Self {
        let processor = Arc::new(JobTypeProcessor::new(target.clone()));
        let runner = MigrationRunner::with_config(store.clone(), processor, config);
        Self::with_runner(store, target, Arc::new(runner))
    }

    /// Bookkeeping tables and migrated tables in the same database.
    pub fn postgres(pool: PgPool, config: RunnerConfig) -> Self {
        Self::new(
            Arc::new(PostgresMigrationStore::new(pool.clone())),
            Arc::new(PostgresTarget::new(pool)),
            config,
        )
    }

    pub fn with_runner(
        store: Arc<dyn MigrationStore>,
        target: Arc<dyn MigrationTarget>,
        runner: Arc<MigrationRunner>,
    ) -> Self {
        Self {
            store,
            target,
            runner,
        }
    }

    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    pub fn runner(&self) -> &Arc<MigrationRunner> {
        &self.runner
    }

    /// Validate and persist a migration, then run it now or leave it to the
    /// scheduler.
    ///
    /// Configuration problems come back as `ConfigurationError` before any
    /// row is written. In `Inline` mode the returned migration reflects the
    /// state after the run; a failed batch shows up as `Failed` status, not
    /// as an error.
    pub async fn enqueue(
        &self,
        args: impl Into<JobArguments>,
        options: EnqueueOptions,
        mode: ExecutionMode,
    ) -> Result<Migration> {
        let args = args.into();
        let migration = build_migration(self.target.as_ref(), &args, &options).await?;
        let migration = self.store.insert_migration(&migration).await?;

        info!(
            migration_id = %migration.id,
            job_type = %migration.job_type,
            table = %migration.table_name,
            min_value = migration.min_value,
            max_value = migration.max_value,
            batch_size = migration.batch_size,
            mode = ?mode,
            "background migration enqueued"
        );

        match mode {
            ExecutionMode::Inline => self.runner.run_all_migration_jobs(&migration).await,
            ExecutionMode::Deferred => Ok(migration),
        }
    }

    /// Set `column_updates` on every row of `table`.
    pub async fn backfill(
        &self,
        table: &str,
        column_updates: BTreeMap<String, ColumnValue>,
        options: EnqueueOptions,
        mode: ExecutionMode,
    ) -> Result<Migration> {
        let args = BackfillColumn {
            table: table.to_string(),
            column_updates,
        };
        self.enqueue(args, options, mode).await
    }

    /// Copy `from` columns into `to` columns on every row of `table`.
    pub async fn copy_columns(
        &self,
        table: &str,
        from: Vec<String>,
        to: Vec<String>,
        type_cast_functions: BTreeMap<String, String>,
        options: EnqueueOptions,
        mode: ExecutionMode,
    ) -> Result<Migration> {
        let args = CopyColumn {
            table: table.to_string(),
            from_columns: from,
            to_columns: to,
            type_cast_functions,
        };
        self.enqueue(args, options, mode).await
    }

    /// Stop claiming batches for a migration. A running batch finishes.
    pub async fn pause(&self, id: Uuid) -> Result<Migration> {
        let migration = self
            .transition(
                id,
                &[MigrationStatus::Enqueued, MigrationStatus::Running],
                MigrationStatus::Paused,
            )
            .await?;
        info!(migration_id = %id, "background migration paused");
        Ok(migration)
    }

    pub async fn resume(&self, id: Uuid) -> Result<Migration> {
        let migration = self
            .transition(id, &[MigrationStatus::Paused], MigrationStatus::Enqueued)
            .await?;
        info!(migration_id = %id, "background migration resumed");
        Ok(migration)
    }

    /// Give every failed job a fresh attempt budget and reactivate a failed
    /// migration.
    pub async fn retry_failed(&self, id: Uuid) -> Result<Migration> {
        let migration = self.store.find_migration(id).await?;
        if migration.status != MigrationStatus::Failed {
            return Err(anyhow!(
                "Background migration {} is {}, only failed migrations can be retried",
                id,
                migration.status
            ));
        }

        let reset = self.store.reset_failed_jobs(id).await?;
        let migration = self
            .transition(id, &[MigrationStatus::Failed], MigrationStatus::Enqueued)
            .await?;

        info!(migration_id = %id, jobs = reset, "background migration retried");
        Ok(migration)
    }

    pub async fn status(&self, id: Uuid) -> Result<MigrationReport> {
        let migration = self.store.find_migration(id).await?;
        let jobs = self.store.jobs_for_migration(id).await?;
        Ok(MigrationReport::new(migration, &jobs))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<Migration> {
        match self.store.transition_migration_status(id, from, to).await? {
            Some(migration) => Ok(migration),
            None => {
                let current = self.store.find_migration(id).await?;
                Err(anyhow!(
                    "Cannot move background migration {} from {} to {}",
                    id,
                    current.status,
                    to
                ))
            }
        }
    }
}

/// Summary of a migration and its jobs.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub migration: Migration,
    /// Percentage of the range covered by succeeded jobs
    pub progress: f64,
    pub jobs_total: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub rows_affected: i64,
    pub last_error: Option<String>,
}

impl MigrationReport {
    pub fn new(migration: Migration, jobs: &[MigrationJob]) -> Self {
        let count = |status: MigrationJobStatus| jobs.iter().filter(|job| job.status == status).count();

        Self {
            progress: migration.progress(jobs),
            jobs_total: jobs.len(),
            jobs_succeeded: count(MigrationJobStatus::Succeeded),
            jobs_failed: count(MigrationJobStatus::Failed),
            rows_affected: jobs.iter().filter_map(|job| job.rows_affected).sum(),
            last_error: jobs
                .iter()
                .filter(|job| job.error_message.is_some())
                .max_by_key(|job| job.updated_at)
                .and_then(|job| job.error_message.clone()),
            migration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::BatchRange;
    use crate::error::ConfigurationError;
    use crate::testing::{InMemoryMigrationStore, MockBatchProcessor, RecordingTarget};

    fn users_target() -> Arc<RecordingTarget> {
        Arc::new(RecordingTarget::with_rows_per_value(1).with_table(
            "users",
            Some(BatchRange::new(1, 100)),
            &[("id", "int8"), ("admin", "bool"), ("id_for_type_change", "text")],
        ))
    }

    fn small_batches() -> EnqueueOptions {
        EnqueueOptions::builder()
            .batch_size(30)
            .sub_batch_size(10)
            .sub_batch_pause_ms(0)
            .batch_max_attempts(2)
            .build()
    }

    fn engine(target: Arc<RecordingTarget>) -> (BackgroundMigrations, Arc<InMemoryMigrationStore>) {
        let store = Arc::new(InMemoryMigrationStore::new());
        let engine = BackgroundMigrations::new(store.clone(), target, RunnerConfig::default());
        (engine, store)
    }

    #[tokio::test]
    async fn inline_backfill_runs_every_sub_batch() {
        let target = users_target();
        let (engine, _store) = engine(target.clone());

        let migration = engine
            .backfill(
                "users",
                BTreeMap::from([("admin".to_string(), ColumnValue::Bool(false))]),
                small_batches(),
                ExecutionMode::Inline,
            )
            .await
            .unwrap();

        assert_eq!(migration.status, MigrationStatus::Finished);
        let ranges = target.executed_ranges();
        assert_eq!(ranges.len(), 10);
        assert!(ranges.iter().all(|range| range.len() <= 10));
        assert_eq!(ranges.first(), Some(&BatchRange::new(1, 10)));
        assert_eq!(ranges.last(), Some(&BatchRange::new(91, 100)));

        let report = engine.status(migration.id).await.unwrap();
        assert_eq!(report.progress, 100.0);
        assert_eq!(report.jobs_total, 4);
        assert_eq!(report.rows_affected, 100);
    }

    #[tokio::test]
    async fn deferred_enqueue_only_persists() {
        let target = users_target();
        let (engine, store) = engine(target.clone());

        let migration = engine
            .copy_columns(
                "users",
                vec!["id".to_string()],
                vec!["id_for_type_change".to_string()],
                BTreeMap::from([("id".to_string(), "::text".to_string())]),
                small_batches(),
                ExecutionMode::Deferred,
            )
            .await
            .unwrap();

        assert_eq!(migration.status, MigrationStatus::Enqueued);
        assert!(target.executed_ranges().is_empty());
        assert_eq!(
            store.list_migrations().await.unwrap().len(),
            1,
            "migration row is written"
        );
    }

    #[tokio::test]
    async fn configuration_errors_write_nothing() {
        let (engine, store) = engine(users_target());

        let err = engine
            .copy_columns(
                "users",
                vec!["id".to_string()],
                vec!["id_for_type_change".to_string()],
                BTreeMap::new(),
                small_batches(),
                ExecutionMode::Inline,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::MissingTypeCast { .. })
        ));
        assert!(store.list_migrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_sub_batch_fails_migration_inline() {
        let target = Arc::new(
            RecordingTarget::with_rows_per_value(1)
                .with_table(
                    "users",
                    Some(BatchRange::new(1, 100)),
                    &[("id", "int8"), ("admin", "bool")],
                )
                .failing_at(45),
        );
        let (engine, store) = engine(target);

        let migration = engine
            .enqueue(
                BackfillColumn::new("users", [("admin", true)]),
                small_batches(),
                ExecutionMode::Inline,
            )
            .await
            .unwrap();

        assert_eq!(migration.status, MigrationStatus::Failed);
        let jobs = store.jobs_for_migration(migration.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].attempts, 2);
        assert!(jobs[1]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("[41, 50]"));

        let report = engine.status(migration.id).await.unwrap();
        assert_eq!(report.jobs_failed, 1);
        assert!(report.last_error.is_some());
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let (engine, _store) = engine(users_target());
        let migration = engine
            .enqueue(
                BackfillColumn::new("users", [("admin", false)]),
                small_batches(),
                ExecutionMode::Deferred,
            )
            .await
            .unwrap();

        let paused = engine.pause(migration.id).await.unwrap();
        assert_eq!(paused.status, MigrationStatus::Paused);

        let still_paused = engine.runner().run_all_migration_jobs(&paused).await.unwrap();
        assert_eq!(still_paused.status, MigrationStatus::Paused);
        assert!(engine.resume(migration.id).await.is_ok());
        assert!(engine.resume(migration.id).await.is_err());

        let finished = engine.runner().run_all_migration_jobs(&migration).await.unwrap();
        assert_eq!(finished.status, MigrationStatus::Finished);
        assert!(engine.pause(migration.id).await.is_err());
    }

    #[tokio::test]
    async fn retry_failed_reruns_exhausted_range() {
        let target = users_target();
        let store = Arc::new(InMemoryMigrationStore::new());
        let processor = Arc::new(MockBatchProcessor::new().failing_batch(31, 2));
        let runner = Arc::new(MigrationRunner::new(store.clone(), processor.clone()));
        let engine = BackgroundMigrations::with_runner(store.clone(), target, runner);

        let failed = engine
            .enqueue(
                BackfillColumn::new("users", [("admin", false)]),
                small_batches(),
                ExecutionMode::Inline,
            )
            .await
            .unwrap();
        assert_eq!(failed.status, MigrationStatus::Failed);

        let retried = engine.retry_failed(failed.id).await.unwrap();
        assert_eq!(retried.status, MigrationStatus::Enqueued);
        assert!(engine.retry_failed(failed.id).await.is_err());

        let finished = engine.runner().run_all_migration_jobs(&retried).await.unwrap();
        assert_eq!(finished.status, MigrationStatus::Finished);

        let jobs = store.jobs_for_migration(failed.id).await.unwrap();
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[1].attempts, 1, "attempts restart after a retry");
        assert!(jobs.iter().all(|job| job.status == MigrationJobStatus::Succeeded));
    }
}
