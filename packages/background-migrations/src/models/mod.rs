pub mod job;
pub mod migration;

pub use job::{MigrationJob, MigrationJobStatus};
pub use migration::{
    Migration, MigrationStatus, DEFAULT_BATCH_MAX_ATTEMPTS, DEFAULT_BATCH_PAUSE_SECS,
    DEFAULT_BATCH_SIZE, DEFAULT_SUB_BATCH_PAUSE_MS, DEFAULT_SUB_BATCH_SIZE,
};
