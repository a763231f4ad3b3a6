use crate::error::ExecutionError;
use crate::execution::engine::ExecutionEngine;
use crate::guard::AcceptedQuery;
use crate::value::ResultRow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Runs admitted queries against an engine under a hard timeout. No retries.
#[derive(Clone)]
pub struct QueryExecutor {
    engine: Arc<dyn ExecutionEngine>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(engine: Arc<dyn ExecutionEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    pub async fn execute(&self, query: &AcceptedQuery) -> Result<Vec<ResultRow>, ExecutionError> {
        let start_time = Instant::now();

        // Dropping the engine future on timeout releases its connection.
        match tokio::time::timeout(self.timeout, self.engine.execute(query)).await {
            Ok(Ok(rows)) => {
                info!(
                    engine = self.engine.name(),
                    rows = rows.len(),
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Query executed"
                );
                Ok(rows)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(engine = self.engine.name(), timeout_secs = self.timeout.as_secs(), "Query timed out");
                Err(ExecutionError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::accepted_for_tests;
    use crate::value::SqlValue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowEngine {
        delay: Duration,
        calls: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    struct Release(Arc<AtomicUsize>);

    impl Drop for Release {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ExecutionEngine for SlowEngine {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn execute(&self, _query: &AcceptedQuery) -> Result<Vec<ResultRow>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _connection = Release(self.released.clone());
            tokio::time::sleep(self.delay).await;
            let columns: Arc<[String]> = vec!["n".to_string()].into();
            Ok(vec![ResultRow::new(columns, vec![SqlValue::Integer(1)])])
        }

        async fn health_check(&self) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn engine(delay: Duration) -> Arc<SlowEngine> {
        Arc::new(SlowEngine {
            delay,
            calls: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[tokio::test]
    async fn test_execute_within_timeout() {
        let engine = engine(Duration::from_millis(1));
        let executor = QueryExecutor::new(engine.clone(), Duration::from_secs(5));

        let rows = executor.execute(&accepted_for_tests("SELECT 1 AS n")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(engine.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_releases_connection_and_does_not_retry() {
        let engine = engine(Duration::from_secs(10));
        let executor = QueryExecutor::new(engine.clone(), Duration::from_millis(50));

        let err = executor.execute(&accepted_for_tests("SELECT 1 AS n")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.released.load(Ordering::SeqCst), 1);
    }
}
