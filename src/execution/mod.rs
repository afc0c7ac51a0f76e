//! Query Execution
//!
//! Executors run an already-validated, sanitized query under a row and time
//! budget. Backend errors are data ([`ExecutionOutcome::Failed`]), not `Err`.

pub mod postgres;
pub mod result;

use async_trait::async_trait;
use std::time::Duration;

pub use postgres::PostgresExecutor;
pub use result::{ExecutionFailure, ExecutionOutcome, ResultSet, Row};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, sql: &str, row_limit: usize, time_budget: Duration) -> ExecutionOutcome;
}
