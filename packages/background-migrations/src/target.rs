//! The database being migrated.
//!
//! Job types never talk to a pool directly; they hand statements to a
//! `MigrationTarget`. The Postgres implementation runs every sub-batch as its
//! own auto-committed statement so no transaction spans more than one
//! sub-batch.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::bounds::BatchRange;
use crate::job_types::sql::{quote_ident, validate_identifier, TableName};

#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Observed `MIN`/`MAX` of `column`, or `None` for an empty table.
    async fn column_bounds(&self, table: &str, column: &str) -> Result<Option<BatchRange>>;

    /// Column name to Postgres type name (`udt_name`) for `table`.
    async fn column_types(&self, table: &str) -> Result<HashMap<String, String>>;

    /// Execute a range-bounded statement; `$1`/`$2` are bound to the range.
    async fn execute_sub_batch(&self, statement: &str, range: BatchRange) -> Result<u64>;
}

/// `MigrationTarget` backed by a Postgres pool.
#[derive(Clone)]
pub struct PostgresTarget {
    pool: PgPool,
}

impl PostgresTarget {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationTarget for PostgresTarget {
    async fn column_bounds(&self, table: &str, column: &str) -> Result<Option<BatchRange>> {
        let table = TableName::parse(table)?;
        validate_identifier(column)?;

        let column = quote_ident(column);
        let sql = format!(
            "SELECT MIN({column})::BIGINT, MAX({column})::BIGINT FROM {table}",
            column = column,
            table = table.quoted(),
        );

        let (min, max): (Option<i64>, Option<i64>) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to read bounds of {}", table.name))?;

        Ok(match (min, max) {
            (Some(min), Some(max)) => Some(BatchRange::new(min, max)),
            _ => None,
        })
    }

    async fn column_types(&self, table: &str) -> Result<HashMap<String, String>> {
        let table = TableName::parse(table)?;

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::TEXT, udt_name::TEXT
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1, current_schema())
              AND table_name = $2
            "#,
        )
        .bind(table.schema.as_deref())
        .bind(&table.name)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read columns of {}", table.name))?;

        Ok(rows.into_iter().collect())
    }

    async fn execute_sub_batch(&self, statement: &str, range: BatchRange) -> Result<u64> {
        let result = sqlx::query(statement)
            .bind(range.min_value)
            .bind(range.max_value)
            .execute(&self.pool)
            .await?;

        debug!(
            min_value = range.min_value,
            max_value = range.max_value,
            rows_affected = result.rows_affected(),
            "sub-batch committed"
        );

        Ok(result.rows_affected())
    }
}
