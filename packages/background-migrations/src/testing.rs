//! Test doubles for the store, the target database and batch processing.

pub use crate::store::InMemoryMigrationStore;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::bounds::BatchRange;
use crate::job_types::BatchProcessor;
use crate::models::Migration;
use crate::target::MigrationTarget;

/// Target that records statements instead of running them.
///
/// Every sub-batch "changes" `rows_per_value` rows per value in its range.
#[derive(Default)]
pub struct RecordingTarget {
    rows_per_value: u64,
    fail_at: Option<i64>,
    tables: HashMap<String, (Option<BatchRange>, HashMap<String, String>)>,
    executions: Mutex<Vec<(String, BatchRange)>>,
}

impl RecordingTarget {
    pub fn with_rows_per_value(rows_per_value: u64) -> Self {
        Self {
            rows_per_value,
            ..Default::default()
        }
    }

    /// Fail any sub-batch whose range contains `value`.
    pub fn failing_at(mut self, value: i64) -> Self {
        self.fail_at = Some(value);
        self
    }

    /// Declare a table with its batch column bounds and column types.
    pub fn with_table(
        mut self,
        table: &str,
        bounds: Option<BatchRange>,
        columns: &[(&str, &str)],
    ) -> Self {
        let columns = columns
            .iter()
            .map(|(name, ty)| (name.to_string(), ty.to_string()))
            .collect();
        self.tables.insert(table.to_string(), (bounds, columns));
        self
    }

    pub fn executed_ranges(&self) -> Vec<BatchRange> {
        self.lock().iter().map(|(_, range)| *range).collect()
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, BatchRange)>> {
        self.executions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn table(&self, table: &str) -> Result<&(Option<BatchRange>, HashMap<String, String>)> {
        self.tables
            .get(table)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))
    }
}

#[async_trait]
impl MigrationTarget for RecordingTarget {
    async fn column_bounds(&self, table: &str, column: &str) -> Result<Option<BatchRange>> {
        let (bounds, columns) = self.table(table)?;
        if !columns.contains_key(column) {
            return Err(anyhow!("column \"{}\" does not exist", column));
        }
        Ok(*bounds)
    }

    async fn column_types(&self, table: &str) -> Result<HashMap<String, String>> {
        Ok(self.table(table)?.1.clone())
    }

    async fn execute_sub_batch(&self, statement: &str, range: BatchRange) -> Result<u64> {
        self.lock().push((statement.to_string(), range));

        if let Some(value) = self.fail_at {
            if range.contains(value) {
                return Err(anyhow!("deadlock detected"));
            }
        }

        Ok(range.len() * self.rows_per_value)
    }
}

/// Batch processor with scripted failures.
#[derive(Default)]
pub struct MockBatchProcessor {
    rows_per_value: u64,
    always_fail: bool,
    panic_at: Option<i64>,
    /// Batch `min_value` to number of failures left before it succeeds
    failures: Mutex<HashMap<i64, u32>>,
    delay: Duration,
    calls: Mutex<Vec<BatchRange>>,
    started: Mutex<Vec<tokio::time::Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBatchProcessor {
    pub fn new() -> Self {
        Self {
            rows_per_value: 1,
            ..Default::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::new()
        }
    }

    /// Fail the batch starting at `min_value` this many times, then succeed.
    pub fn failing_batch(self, min_value: i64, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(min_value, times);
        self
    }

    /// Panic inside the batch starting at `min_value`.
    pub fn panicking_batch(mut self, min_value: i64) -> Self {
        self.panic_at = Some(min_value);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Ranges processed, in call order, including failed attempts.
    pub fn calls(&self) -> Vec<BatchRange> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// When each call started, in call order.
    pub fn call_instants(&self) -> Vec<tokio::time::Instant> {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Most batches ever processed at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, range: BatchRange) -> bool {
        if self.always_fail {
            return true;
        }
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get_mut(&range.min_value) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl BatchProcessor for MockBatchProcessor {
    async fn process_batch(&self, _migration: &Migration, range: BatchRange) -> Result<u64> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(range);
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tokio::time::Instant::now());

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_at == Some(range.min_value) {
            panic!("batch {} blew up", range);
        }
        if self.should_fail(range) {
            return Err(anyhow!("batch {} failed", range));
        }

        Ok(range.len() * self.rows_per_value)
    }
}
