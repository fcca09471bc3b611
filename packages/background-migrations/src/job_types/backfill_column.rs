//! Backfill one or more columns with constant values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::sql::{quote_ident, validate_identifier, ColumnValue, TableName};
use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackfillColumn {
    pub table: String,
    /// Column name to the value every row in range should end up with
    pub column_updates: BTreeMap<String, ColumnValue>,
}

impl BackfillColumn {
    pub fn new<I, K, V>(table: impl Into<String>, column_updates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ColumnValue>,
    {
        Self {
            table: table.into(),
            column_updates: column_updates
                .into_iter()
                .map(|(column, value)| (column.into(), value.into()))
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        TableName::parse(&self.table)?;

        if self.column_updates.is_empty() {
            return Err(ConfigurationError::NoColumns(self.table.clone()));
        }

        for (column, value) in &self.column_updates {
            validate_identifier(column)?;
            if let ColumnValue::Float(float) = value {
                if !float.is_finite() {
                    return Err(ConfigurationError::InvalidOptions(format!(
                        "{} must be a finite number",
                        column
                    )));
                }
            }
        }

        Ok(())
    }

    /// Statement for one sub-batch; `$1`/`$2` are the sub-batch bounds.
    ///
    /// Rows already holding the target values are left alone, so replaying a
    /// range changes nothing.
    pub fn statement(&self, batch_column: &str) -> Result<String, ConfigurationError> {
        let table = TableName::parse(&self.table)?;
        validate_identifier(batch_column)?;

        let mut assignments = Vec::with_capacity(self.column_updates.len());
        let mut pending = Vec::with_capacity(self.column_updates.len());
        for (column, value) in &self.column_updates {
            validate_identifier(column)?;
            let column = quote_ident(column);
            let literal = value.to_sql_literal();
            assignments.push(format!("{} = {}", column, literal));
            pending.push(format!("{} IS DISTINCT FROM {}", column, literal));
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
