//! Copy columns into new columns, optionally casting on the way.
//!
//! Typical use is changing a column's type online: add the new column, copy
//! in the background, swap names. Type compatibility is checked when the
//! migration is enqueued; a pair that Postgres would not assign implicitly
//! needs an explicit entry in `type_cast_functions`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::sql::{apply_type_cast, quote_ident, validate_identifier, validate_type_cast, TableName};
use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyColumn {
    pub table: String,
    pub from_columns: Vec<String>,
    pub to_columns: Vec<String>,
    /// Source column name to a cast (`"::text"`) or function (`"jsonb"`)
    #[serde(default)]
    pub type_cast_functions: BTreeMap<String, String>,
}

impl CopyColumn {
    pub fn new<F, T>(table: impl Into<String>, from_columns: F, to_columns: T) -> Self
    where
        F: IntoIterator,
        F::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            table: table.into(),
            from_columns: from_columns.into_iter().map(Into::into).collect(),
            to_columns: to_columns.into_iter().map(Into::into).collect(),
            type_cast_functions: BTreeMap::new(),
        }
    }

    pub fn with_type_cast(mut self, column: impl Into<String>, cast: impl Into<String>) -> Self {
        self.type_cast_functions.insert(column.into(), cast.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        TableName::parse(&self.table)?;

        if self.from_columns.is_empty() {
            return Err(ConfigurationError::NoColumns(self.table.clone()));
        }
        if self.from_columns.len() != self.to_columns.len() {
            return Err(ConfigurationError::ColumnCountMismatch {
                from: self.from_columns.len(),
                to: self.to_columns.len(),
            });
        }

        for column in self.from_columns.iter().chain(&self.to_columns) {
            validate_identifier(column)?;
        }

        for (column, cast) in &self.type_cast_functions {
            if !self.from_columns.contains(column) {
                return Err(ConfigurationError::InvalidOptions(format!(
                    "type cast given for {} which is not copied",
                    column
                )));
            }
            validate_type_cast(column, cast)?;
        }

        Ok(())
    }

    /// Check every column pair against the table's column types.
    ///
    /// `column_types` maps column name to Postgres type name as reported by
    /// `information_schema.columns.udt_name`.
    pub fn check_column_types(
        &self,
        column_types: &HashMap<String, String>,
    ) -> Result<(), ConfigurationError> {
        for (from, to) in self.from_columns.iter().zip(&self.to_columns) {
            let from_type = column_type(&self.table, from, column_types)?;
            let to_type = column_type(&self.table, to, column_types)?;

            if self.type_cast_functions.contains_key(from) {
                continue;
            }

            if !assignable_without_cast(from_type, to_type) {
                return Err(ConfigurationError::MissingTypeCast {
                    from_column: from.clone(),
                    from_type: from_type.to_string(),
                    to_column: to.clone(),
                    to_type: to_type.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Statement for one sub-batch; `$1`/`$2` are the sub-batch bounds.
    ///
    /// Rows whose destination already equals the (cast) source are skipped,
    /// so replaying a range changes nothing.
    pub fn statement(&self, batch_column: &str) -> Result<String, ConfigurationError> {
        self.validate()?;
        let table = TableName::parse(&self.table)?;
        validate_identifier(batch_column)?;

        let mut assignments = Vec::with_capacity(self.from_columns.len());
        let mut pending = Vec::with_capacity(self.from_columns.len());
        for (from, to) in self.from_columns.iter().zip(&self.to_columns) {
            let source = match self.type_cast_functions.get(from) {
                Some(cast) => apply_type_cast(&quote_ident(from), cast),
                None => quote_ident(from),
            };
            let to = quote_ident(to);
            assignments.push(format!("{} = {}", to, source));
            pending.push(format!("{} IS DISTINCT FROM {}", to, source));
        }

        Ok(format!(
            "UPDATE {table} SET {assignments} WHERE {batch_column} BETWEEN $1 AND $2 AND ({pending})",
            table = table.quoted(),
            assignments = assignments.join(", "),
            batch_column = quote_ident(batch_column),
            pending = pending.join(" OR "),
        ))
    }
}

fn column_type<'a>(
    table: &str,
    column: &str,
    column_types: &'a HashMap<String, String>,
) -> Result<&'a str, ConfigurationError> {
    column_types
        .get(column)
        .map(String::as_str)
        .ok_or_else(|| ConfigurationError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
}

/// Pairs Postgres assigns without loss and without an explicit cast.
fn assignable_without_cast(from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }

    matches!(
        (from, to),
        ("int2", "int4")
            | ("int2", "int8")
            | ("int4", "int8")
            | ("int2", "numeric")
            | ("int4", "numeric")
            | ("int8", "numeric")
            | ("float4", "float8")
            | ("varchar", "text")
            | ("bpchar", "text")
            | ("bpchar", "varchar")
    )
}
