//! Execution Engine Trait - contract for backing stores
//!
//! An engine runs one admitted query on one scoped connection and maps every
//! row into [`ResultRow`]s. Timeouts are applied by the caller.

use crate::error::ExecutionError;
use crate::guard::AcceptedQuery;
use crate::value::ResultRow;
use async_trait::async_trait;

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Engine name (e.g., "postgres", "sqlite")
    fn name(&self) -> &'static str;

    /// Run the query once. The connection is released on every exit path,
    /// including when the returned future is dropped.
    async fn execute(&self, query: &AcceptedQuery) -> Result<Vec<ResultRow>, ExecutionError>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<(), ExecutionError>;
}
