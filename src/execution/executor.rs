//! Query Executor
//!
//! Runs a validated statement through an engine and enforces the result
//! contract: unique column names, rectangular rows, at most `max_rows` rows and
//! `truncated` set exactly when the cap was reached.

use crate::execution::engine::ExecutionEngine;
use crate::execution::result::{ExecuteOptions, ExecutionError, ExecutionResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Extra time an engine gets to honour its own cancellation before the executor gives up on it.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

pub struct QueryExecutor {
    engine: Arc<dyn ExecutionEngine>,
}

impl QueryExecutor {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    pub async fn execute(
        &self,
        sql: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutionError> {
        if options.max_rows == 0 {
            return Err(ExecutionError::result_shape("max_rows must be at least 1"));
        }
        debug!("Executing on {}: {}", self.engine.name(), sql);

        let started = Instant::now();
        let mut result = match tokio::time::timeout(
            options.timeout + CANCEL_GRACE,
            self.engine.run_query(sql, options),
        )
        .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!("{} did not stop within the grace period", self.engine.name());
                return Err(ExecutionError::timeout(options.timeout));
            }
        };

        check_shape(&result)?;
        if result.rows.len() > options.max_rows {
            result.rows.truncate(options.max_rows);
        }
        result.truncated = result.rows.len() == options.max_rows;
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            "Query returned {} rows x {} columns in {} ms{}",
            result.rows.len(),
            result.columns.len(),
            result.elapsed_ms,
            if result.truncated { " (truncated)" } else { "" }
        );
        Ok(result)
    }
}

fn check_shape(result: &ExecutionResult) -> Result<(), ExecutionError> {
    let mut seen = HashSet::new();
    for name in &result.columns {
        if !seen.insert(name.as_str()) {
            return Err(ExecutionError::result_shape(format!(
                "duplicate output column name {}; alias each column uniquely",
                name
            )));
        }
    }
    let width = result.columns.len();
    if let Some(bad) = result.rows.iter().position(|row| row.len() != width) {
        return Err(ExecutionError::result_shape(format!(
            "row {} has {} values for {} columns",
            bad,
            result.rows[bad].len(),
            width
        )));
    }
    Ok(())
}
