use thiserror::Error;

/// Errors raised while enqueuing a migration.
///
/// These are returned before anything is written, so a rejected migration
/// never shows up as a failed row. Callers that need to tell them apart from
/// database errors can `downcast_ref::<ConfigurationError>()` the `anyhow`
/// error returned by `enqueue`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid range: min_value {min_value} is greater than max_value {max_value}")]
    InvalidRange { min_value: i64, max_value: i64 },

    #[error("{name} must be positive, got {value}")]
    NotPositive { name: &'static str, value: i64 },

    #[error("sub_batch_size ({sub_batch_size}) must not exceed batch_size ({batch_size})")]
    SubBatchTooLarge { sub_batch_size: i64, batch_size: i64 },

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Invalid type cast for {column}: {cast:?}")]
    InvalidTypeCast { column: String, cast: String },

    #[error("No column updates given for {0}")]
    NoColumns(String),

    #[error("from_columns has {from} entries but to_columns has {to}")]
    ColumnCountMismatch { from: usize, to: usize },

    #[error("Column {table}.{column} does not exist")]
    UnknownColumn { table: String, column: String },

    #[error(
        "Copying {from_column} ({from_type}) into {to_column} ({to_type}) needs a type cast; \
         pass one in type_cast_functions"
    )]
    MissingTypeCast {
        from_column: String,
        from_type: String,
        to_column: String,
        to_type: String,
    },
}
