//! SQL fragments shared by the built-in job types.
//!
//! Job arguments name tables and columns and carry literal values, none of
//! which can be bound as statement parameters. Everything that ends up in
//! statement text is validated here first and then quoted.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

lazy_static! {
    // Unquoted Postgres identifier, already case-folded
    static ref IDENTIFIER_REGEX: Regex = Regex::new(r"^[a-z_][a-z0-9_$]*$").unwrap();

    // "::text", "::varchar(255)", "::numeric(10, 2)", "::int[]",
    // "::timestamp with time zone", or a function name such as "jsonb"
    static ref TYPE_CAST_REGEX: Regex = Regex::new(
        r"^(::)?[A-Za-z_][A-Za-z0-9_]*( [A-Za-z_][A-Za-z0-9_]*)*(\(\d+(, ?\d+)?\))?(\[\])?$"
    ).unwrap();
}

/// Validate a bare identifier (column name or unqualified table name).
///
/// Identifiers are quoted when rendered, which makes them case-sensitive.
/// Only lowercase names are accepted, so `Users` is rejected rather than
/// quietly addressing a relation other than the `users` that unquoted SQL
/// would reach.
pub fn validate_identifier(name: &str) -> Result<(), ConfigurationError> {
    if IDENTIFIER_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote an identifier that already passed `validate_identifier`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn parse(table: &str) -> Result<Self, ConfigurationError> {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };

        if let Some(schema) = schema {
            validate_identifier(schema)
                .map_err(|_| ConfigurationError::InvalidIdentifier(table.to_string()))?;
        }
        validate_identifier(name)
            .map_err(|_| ConfigurationError::InvalidIdentifier(table.to_string()))?;

        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

/// A constant assigned by a backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ColumnValue {
    /// Render as a SQL literal.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => format!("{:?}", value),
            Self::Text(value) => format!("'{}'", value.replace('\'', "''")),
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Validate a type cast given for `column`.
pub fn validate_type_cast(column: &str, cast: &str) -> Result<(), ConfigurationError> {
    if TYPE_CAST_REGEX.is_match(cast.trim()) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidTypeCast {
            column: column.to_string(),
            cast: cast.to_string(),
        })
    }
}

/// Apply a validated cast to a quoted column expression.
///
/// Casts starting with `::` are appended; anything else is called as a
/// function.
pub fn apply_type_cast(quoted_column: &str, cast: &str) -> String {
    let cast = cast.trim();
    if cast.starts_with("::") {
        format!("{}{}", quoted_column, cast)
    } else {
        format!("{}({})", cast, quoted_column)
    }
}
