//! One scheduling step across all migrations.
//!
//! Meant to be invoked periodically (cron, a loop in a worker). Each call
//! runs at most one batch of the oldest active migration that is not held
//! by another runner, so the interval between calls is the effective batch
//! pause.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::runner::{BatchOutcome, MigrationRunner};

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledBatch {
    pub migration_id: Uuid,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

pub struct Scheduler {
    runner: Arc<MigrationRunner>,
}

impl Scheduler {
    pub fn new(runner: Arc<MigrationRunner>) -> Self {
        Self { runner }
    }

    /// Run one batch of the oldest enqueued or running migration.
    ///
    /// Migrations with a job running elsewhere are skipped so they cannot
    /// starve younger ones. Returns `None` when nothing is active, and a
    /// `Busy` outcome for the oldest migration when every one is held.
    pub async fn run_once(&self) -> Result<Option<ScheduledBatch>> {
        let active = self.runner.store().active_migrations().await?;
        if active.is_empty() {
            debug!("no active background migrations");
            return Ok(None);
        }

        let mut busy = None;
        for migration in active {
            let outcome = self.runner.run_next_batch(&migration).await?;
            if matches!(outcome, BatchOutcome::Busy) {
                debug!(migration_id = %migration.id, "background migration busy, trying next");
                busy.get_or_insert(migration.id);
                continue;
            }

            debug!(migration_id = %migration.id, outcome = ?outcome, "scheduled batch ran");
            return Ok(Some(ScheduledBatch {
                migration_id: migration.id,
                outcome,
            }));
        }

        Ok(busy.map(|migration_id| ScheduledBatch {
            migration_id,
            outcome: BatchOutcome::Busy,
        }))
    }
}
