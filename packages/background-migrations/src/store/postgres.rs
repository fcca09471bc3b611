//! Postgres-backed migration store.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{MigrationStore, STUCK_JOB_ERROR};
use crate::bounds::BatchRange;
use crate::models::{Migration, MigrationJob, MigrationStatus};

pub struct PostgresMigrationStore {
    pool: PgPool,
}

impl PostgresMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Apply this crate's schema migrations.
///
/// Versions recorded in `_sqlx_migrations` by the host application are
/// ignored, so the tables can live in a database with its own sqlx history.
pub async fn run_schema_migrations(pool: &PgPool) -> Result<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .context("Failed to run background migration schema migrations")
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[async_trait]
impl MigrationStore for PostgresMigrationStore {
    async fn insert_migration(&self, migration: &Migration) -> Result<Migration> {
        sqlx::query_as::<_, Migration>(
            r#"
            INSERT INTO background_migrations (
                id, job_type, arguments, table_name, batch_column_name,
                min_value, max_value, batch_size, sub_batch_size,
                batch_pause, sub_batch_pause_ms, batch_max_attempts, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(migration.id)
        .bind(&migration.job_type)
        .bind(&migration.arguments)
        .bind(&migration.table_name)
        .bind(&migration.batch_column_name)
        .bind(migration.min_value)
        .bind(migration.max_value)
        .bind(migration.batch_size)
        .bind(migration.sub_batch_size)
        .bind(migration.batch_pause)
        .bind(migration.sub_batch_pause_ms)
        .bind(migration.batch_max_attempts)
        .bind(migration.status)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert background migration")
    }

    async fn find_migration(&self, id: Uuid) -> Result<Migration> {
        sqlx::query_as::<_, Migration>("SELECT * FROM background_migrations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("Background migration {} not found", id))
    }

    async fn list_migrations(&self) -> Result<Vec<Migration>> {
        sqlx::query_as::<_, Migration>("SELECT * FROM background_migrations ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn active_migrations(&self) -> Result<Vec<Migration>> {
        sqlx::query_as::<_, Migration>(
            r#"
            SELECT *
            FROM background_migrations
            WHERE status IN ('enqueued', 'running')
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn transition_migration_status(
        &self,
        id: Uuid,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<Option<Migration>> {
        let from: Vec<&str> = from.iter().map(MigrationStatus::as_str).collect();

        sqlx::query_as::<_, Migration>(
            r#"
            UPDATE background_migrations
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status::TEXT = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn jobs_for_migration(&self, migration_id: Uuid) -> Result<Vec<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(
            "SELECT * FROM background_migration_jobs WHERE migration_id = $1 ORDER BY min_value",
        )
        .bind(migration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn running_job(&self, migration_id: Uuid) -> Result<Option<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(
            r#"
            SELECT *
            FROM background_migration_jobs
            WHERE migration_id = $1 AND status = 'running'
            LIMIT 1
            "#,
        )
        .bind(migration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn max_claimed_value(&self, migration_id: Uuid) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(max_value) FROM background_migration_jobs WHERE migration_id = $1",
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn next_runnable_job(
        &self,
        migration_id: Uuid,
        max_attempts: i32,
    ) -> Result<Option<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(
            r#"
            SELECT *
            FROM background_migration_jobs
            WHERE migration_id = $1
              AND status IN ('enqueued', 'failed')
              AND attempts < $2
            ORDER BY min_value
            LIMIT 1
            "#,
        )
        .bind(migration_id)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn create_job(
        &self,
        migration_id: Uuid,
        range: BatchRange,
    ) -> Result<Option<MigrationJob>> {
        let job = MigrationJob::new(migration_id, range);

        sqlx::query_as::<_, MigrationJob>(
            r#"
            INSERT INTO background_migration_jobs (id, migration_id, min_value, max_value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (migration_id, min_value) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.migration_id)
        .bind(job.min_value)
        .bind(job.max_value)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to create background migration job")
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<Option<MigrationJob>> {
        let result = sqlx::query_as::<_, MigrationJob>(
            r#"
            UPDATE background_migration_jobs
            SET status = 'running',
                attempts = attempts + 1,
                started_at = NOW(),
                finished_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('enqueued', 'failed')
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(job) => Ok(job),
            // Partial unique index: another job of this migration is running
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_job_succeeded(
        &self,
        job_id: Uuid,
        attempt: i32,
        rows_affected: u64,
    ) -> Result<Option<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(
            r#"
            UPDATE background_migration_jobs
            SET status = 'succeeded',
                rows_affected = $3,
                error_message = NULL,
                error_backtrace = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND attempts = $2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(attempt)
        .bind(i64::try_from(rows_affected).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark job as succeeded")
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        attempt: i32,
        error_message: &str,
        error_backtrace: &str,
    ) -> Result<Option<MigrationJob>> {
        sqlx::query_as::<_, MigrationJob>(
            r#"
            UPDATE background_migration_jobs
            SET status = 'failed',
                error_message = $3,
                error_backtrace = $4,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND attempts = $2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(attempt)
        .bind(error_message)
        .bind(error_backtrace)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark job as failed")
    }

    async fn fail_stuck_jobs(&self, migration_id: Uuid, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE background_migration_jobs
            SET status = 'failed',
                error_message = $3,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE migration_id = $1
              AND status = 'running'
              AND started_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(migration_id)
        .bind(timeout.as_secs_f64())
        .bind(STUCK_JOB_ERROR)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reset_failed_jobs(&self, migration_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE background_migration_jobs
            SET status = 'enqueued',
                attempts = 0,
                error_message = NULL,
                error_backtrace = NULL,
                updated_at = NOW()
            WHERE migration_id = $1 AND status = 'failed'
            "#,
        )
        .bind(migration_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
