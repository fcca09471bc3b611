//! Building migrations from job arguments and options.
//!
//! Everything here runs before a migration row is written: options are
//! checked, arguments validated against the target table, and omitted
//! bounds read from the batch column. Any problem is a
//! `ConfigurationError`.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::bounds::BatchRange;
use crate::error::ConfigurationError;
use crate::job_types::sql::validate_identifier;
use crate::job_types::JobArguments;
use crate::models::{
    Migration, DEFAULT_BATCH_MAX_ATTEMPTS, DEFAULT_BATCH_PAUSE_SECS, DEFAULT_BATCH_SIZE,
    DEFAULT_SUB_BATCH_PAUSE_MS, DEFAULT_SUB_BATCH_SIZE,
};
use crate::target::MigrationTarget;

/// Range used when the table is empty at enqueue time.
pub const EMPTY_TABLE_RANGE: BatchRange = BatchRange {
    min_value: 1,
    max_value: 1,
};

/// Whether `enqueue` drains the migration before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run every batch before returning
    Inline,
    /// Return once the migration is persisted; a scheduler runs it later
    #[default]
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields, default)]
pub struct EnqueueOptions {
    #[builder(default = "id".to_string(), setter(into))]
    pub batch_column_name: String,
    /// Defaults to the batch column's observed minimum
    #[builder(default, setter(strip_option))]
    pub min_value: Option<i64>,
    /// Defaults to the batch column's observed maximum
    #[builder(default, setter(strip_option))]
    pub max_value: Option<i64>,
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: i64,
    #[builder(default = DEFAULT_SUB_BATCH_SIZE)]
    pub sub_batch_size: i64,
    /// Seconds between batches
    #[builder(default = DEFAULT_BATCH_PAUSE_SECS)]
    pub batch_pause: i32,
    #[builder(default = DEFAULT_SUB_BATCH_PAUSE_MS)]
    pub sub_batch_pause_ms: i32,
    #[builder(default = DEFAULT_BATCH_MAX_ATTEMPTS)]
    pub batch_max_attempts: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

const OPTION_NAMES: [&str; 8] = [
    "batch_column_name",
    "min_value",
    "max_value",
    "batch_size",
    "sub_batch_size",
    "batch_pause",
    "sub_batch_pause_ms",
    "batch_max_attempts",
];

impl EnqueueOptions {
    /// Decode options from a JSON object, rejecting unknown keys.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigurationError> {
        let Some(object) = value.as_object() else {
            return Err(ConfigurationError::InvalidOptions(
                "options must be a JSON object".to_string(),
            ));
        };

        if let Some(unknown) = object.keys().find(|key| !OPTION_NAMES.contains(&key.as_str())) {
            return Err(ConfigurationError::UnknownOption(unknown.clone()));
        }

        serde_json::from_value(value).map_err(|e| ConfigurationError::InvalidOptions(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_identifier(&self.batch_column_name)?;

        positive("batch_size", self.batch_size)?;
        positive("sub_batch_size", self.sub_batch_size)?;
        positive("batch_max_attempts", i64::from(self.batch_max_attempts))?;

        if self.sub_batch_size > self.batch_size {
            return Err(ConfigurationError::SubBatchTooLarge {
                sub_batch_size: self.sub_batch_size,
                batch_size: self.batch_size,
            });
        }

        if self.batch_pause < 0 {
            return Err(ConfigurationError::InvalidOptions(format!(
                "batch_pause must not be negative, got {}",
                self.batch_pause
            )));
        }
        if self.sub_batch_pause_ms < 0 {
            return Err(ConfigurationError::InvalidOptions(format!(
                "sub_batch_pause_ms must not be negative, got {}",
                self.sub_batch_pause_ms
            )));
        }

        if let (Some(min_value), Some(max_value)) = (self.min_value, self.max_value) {
            check_range(min_value, max_value)?;
        }

        Ok(())
    }
}

fn positive(name: &'static str, value: i64) -> Result<(), ConfigurationError> {
    if value <= 0 {
        return Err(ConfigurationError::NotPositive { name, value });
    }
    Ok(())
}

fn check_range(min_value: i64, max_value: i64) -> Result<(), ConfigurationError> {
    if min_value > max_value {
        return Err(ConfigurationError::InvalidRange {
            min_value,
            max_value,
        });
    }
    Ok(())
}

/// Validate `args` and `options` against the target and build the migration
/// row to insert.
pub async fn build_migration(
    target: &dyn MigrationTarget,
    args: &JobArguments,
    options: &EnqueueOptions,
) -> Result<Migration> {
    options.validate()?;
    args.validate()?;

    let table = args.table();
    let column_types = target.column_types(table).await?;
    check_columns(args, &options.batch_column_name, &column_types)?;

    let range = match (options.min_value, options.max_value) {
        (Some(min_value), Some(max_value)) => BatchRange::new(min_value, max_value),
        (min_value, max_value) => {
            let observed = target
                .column_bounds(table, &options.batch_column_name)
                .await?
                .unwrap_or(EMPTY_TABLE_RANGE);
            BatchRange::new(
                min_value.unwrap_or(observed.min_value),
                max_value.unwrap_or(observed.max_value),
            )
        }
    };
    check_range(range.min_value, range.max_value)?;

    Ok(Migration::builder()
        .job_type(args.job_type().as_str())
        .arguments(args.to_value()?)
        .table_name(table)
        .batch_column_name(options.batch_column_name.as_str())
        .min_value(range.min_value)
        .max_value(range.max_value)
        .batch_size(options.batch_size)
        .sub_batch_size(options.sub_batch_size)
        .batch_pause(options.batch_pause)
        .sub_batch_pause_ms(options.sub_batch_pause_ms)
        .batch_max_attempts(options.batch_max_attempts)
        .build())
}

fn check_columns(
    args: &JobArguments,
    batch_column: &str,
    column_types: &HashMap<String, String>,
) -> Result<(), ConfigurationError> {
    let table = args.table();
    if column_types.is_empty() {
        return Err(ConfigurationError::InvalidOptions(format!(
            "table {} does not exist",
            table
        )));
    }

    let known = |column: &str| {
        if column_types.contains_key(column) {
            Ok(())
        } else {
            Err(ConfigurationError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    };

    known(batch_column)?;
    match args {
        JobArguments::BackfillColumn(backfill) => {
            for column in backfill.column_updates.keys() {
                known(column)?;
            }
            Ok(())
        }
        JobArguments::CopyColumn(copy) => copy.check_column_types(column_types),
    }
}
