//! In-memory migration store.
//!
//! Applies the same uniqueness rules as the Postgres schema, so runner
//! behavior (single-flight, range claiming, retries) can be exercised
//! without a database.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{MigrationStore, STUCK_JOB_ERROR};
use crate::bounds::BatchRange;
use crate::models::{Migration, MigrationJob, MigrationJobStatus, MigrationStatus};

#[derive(Default)]
struct State {
    migrations: HashMap<Uuid, Migration>,
    jobs: HashMap<Uuid, MigrationJob>,
}

#[derive(Default)]
pub struct InMemoryMigrationStore {
    state: RwLock<State>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

fn sorted_jobs(state: &State, migration_id: Uuid) -> Vec<MigrationJob> {
    let mut jobs: Vec<_> = state
        .jobs
        .values()
        .filter(|job| job.migration_id == migration_id)
        .cloned()
        .collect();
    jobs.sort_by_key(|job| job.min_value);
    jobs
}

fn update_job(
    state: &mut State,
    job_id: Uuid,
    f: impl FnOnce(&mut MigrationJob),
) -> Result<MigrationJob> {
    let job = state
        .jobs
        .get_mut(&job_id)
        .ok_or_else(|| anyhow!("Background migration job {} not found", job_id))?;
    f(job);
    job.updated_at = Utc::now();
    Ok(job.clone())
}

/// Update a job only while `attempt` still holds its running claim.
fn update_claimed_job(
    state: &mut State,
    job_id: Uuid,
    attempt: i32,
    f: impl FnOnce(&mut MigrationJob),
) -> Result<Option<MigrationJob>> {
    let job = state
        .jobs
        .get(&job_id)
        .ok_or_else(|| anyhow!("Background migration job {} not found", job_id))?;
    if job.status != MigrationJobStatus::Running || job.attempts != attempt {
        return Ok(None);
    }
    update_job(state, job_id, f).map(Some)
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn insert_migration(&self, migration: &Migration) -> Result<Migration> {
        self.write(|state| {
            if state.migrations.contains_key(&migration.id) {
                return Err(anyhow!("Background migration {} already exists", migration.id));
            }
            state.migrations.insert(migration.id, migration.clone());
            Ok(migration.clone())
        })
    }

    async fn find_migration(&self, id: Uuid) -> Result<Migration> {
        self.read(|state| {
            state
                .migrations
                .get(&id)
                .cloned()
                .ok_or_else(|| anyhow!("Background migration {} not found", id))
        })
    }

    async fn list_migrations(&self) -> Result<Vec<Migration>> {
        let mut migrations = self.read(|state| state.migrations.values().cloned().collect::<Vec<_>>());
        migrations.sort_by_key(|m| (m.created_at, m.id));
        Ok(migrations)
    }

    async fn active_migrations(&self) -> Result<Vec<Migration>> {
        let mut migrations = self.list_migrations().await?;
        migrations.retain(|m| m.status.is_active());
        Ok(migrations)
    }

    async fn transition_migration_status(
        &self,
        id: Uuid,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<Option<Migration>> {
        self.write(|state| {
            let migration = state
                .migrations
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Background migration {} not found", id))?;
            if !from.contains(&migration.status) {
                return Ok(None);
            }
            migration.status = to;
            migration.updated_at = Utc::now();
            Ok(Some(migration.clone()))
        })
    }

    async fn jobs_for_migration(&self, migration_id: Uuid) -> Result<Vec<MigrationJob>> {
        Ok(self.read(|state| sorted_jobs(state, migration_id)))
    }

    async fn running_job(&self, migration_id: Uuid) -> Result<Option<MigrationJob>> {
        Ok(self.read(|state| {
            state
                .jobs
                .values()
                .find(|job| {
                    job.migration_id == migration_id && job.status == MigrationJobStatus::Running
                })
                .cloned()
        }))
    }

    async fn max_claimed_value(&self, migration_id: Uuid) -> Result<Option<i64>> {
        Ok(self.read(|state| {
            state
                .jobs
                .values()
                .filter(|job| job.migration_id == migration_id)
                .map(|job| job.max_value)
                .max()
        }))
    }

    async fn next_runnable_job(
        &self,
        migration_id: Uuid,
        max_attempts: i32,
    ) -> Result<Option<MigrationJob>> {
        Ok(self.read(|state| {
            sorted_jobs(state, migration_id)
                .into_iter()
                .find(|job| job.is_runnable(max_attempts))
        }))
    }

    async fn create_job(
        &self,
        migration_id: Uuid,
        range: BatchRange,
    ) -> Result<Option<MigrationJob>> {
        self.write(|state| {
            let taken = state
                .jobs
                .values()
                .any(|job| job.migration_id == migration_id && job.min_value == range.min_value);
            if taken {
                return Ok(None);
            }

            let job = MigrationJob::new(migration_id, range);
            state.jobs.insert(job.id, job.clone());
            Ok(Some(job))
        })
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<Option<MigrationJob>> {
        self.write(|state| {
            let job = state
                .jobs
                .get(&job_id)
                .ok_or_else(|| anyhow!("Background migration job {} not found", job_id))?;

            let claimable = matches!(
                job.status,
                MigrationJobStatus::Enqueued | MigrationJobStatus::Failed
            );
            let migration_id = job.migration_id;
            let other_running = state.jobs.values().any(|other| {
                other.migration_id == migration_id && other.status == MigrationJobStatus::Running
            });
            if !claimable || other_running {
                return Ok(None);
            }

            update_job(state, job_id, |job| {
                job.status = MigrationJobStatus::Running;
                job.attempts += 1;
                job.started_at = Some(Utc::now());
                job.finished_at = None;
            })
            .map(Some)
        })
    }

    async fn mark_job_succeeded(
        &self,
        job_id: Uuid,
        attempt: i32,
        rows_affected: u64,
    ) -> Result<Option<MigrationJob>> {
        self.write(|state| {
            update_claimed_job(state, job_id, attempt, |job| {
                job.status = MigrationJobStatus::Succeeded;
                job.rows_affected = Some(i64::try_from(rows_affected).unwrap_or(i64::MAX));
                job.error_message = None;
                job.error_backtrace = None;
                job.finished_at = Some(Utc::now());
            })
        })
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        attempt: i32,
        error_message: &str,
        error_backtrace: &str,
    ) -> Result<Option<MigrationJob>> {
        self.write(|state| {
            update_claimed_job(state, job_id, attempt, |job| {
                job.status = MigrationJobStatus::Failed;
                job.error_message = Some(error_message.to_string());
                job.error_backtrace = Some(error_backtrace.to_string());
                job.finished_at = Some(Utc::now());
            })
        })
    }

    async fn fail_stuck_jobs(&self, migration_id: Uuid, timeout: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout)?;

        Ok(self.write(|state| {
            let mut failed = 0;
            for job in state.jobs.values_mut() {
                let stuck = job.migration_id == migration_id
                    && job.status == MigrationJobStatus::Running
                    && job.started_at.is_some_and(|started| started <= cutoff);
                if stuck {
                    job.status = MigrationJobStatus::Failed;
                    job.error_message = Some(STUCK_JOB_ERROR.to_string());
                    job.finished_at = Some(Utc::now());
                    job.updated_at = Utc::now();
                    failed += 1;
                }
            }
            failed
        }))
    }

    async fn reset_failed_jobs(&self, migration_id: Uuid) -> Result<u64> {
        Ok(self.write(|state| {
            let mut reset = 0;
            for job in state.jobs.values_mut() {
                if job.migration_id == migration_id && job.status == MigrationJobStatus::Failed {
                    job.status = MigrationJobStatus::Enqueued;
                    job.attempts = 0;
                    job.error_message = None;
                    job.error_backtrace = None;
                    job.updated_at = Utc::now();
                    reset += 1;
                }
            }
            reset
        }))
    }
}
