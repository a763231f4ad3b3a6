//! Execution Module - guarded query execution against the backing store
//!
//! - ExecutionEngine trait for pluggable stores
//! - QueryExecutor applying the hard timeout
//! - Engine implementations (PostgreSQL, SQLite)

pub mod engine;
pub mod executor;

// Engine implementations
pub mod postgres_engine;
pub mod sqlite_engine;

pub use engine::ExecutionEngine;
pub use executor::QueryExecutor;
pub use postgres_engine::PostgresEngine;
pub use sqlite_engine::SqliteEngine;

use crate::config::{AppConfig, SqlDialect};
use crate::error::ExecutionError;
use std::sync::Arc;
use std::time::Duration;

/// Pick the engine for the configured database URL.
pub fn connect_engine(config: &AppConfig) -> Result<Arc<dyn ExecutionEngine>, ExecutionError> {
    match config.dialect {
        SqlDialect::Postgres => {
            // Leave room inside the query timeout to report a connection failure.
            let acquire_timeout = (config.query_timeout / 2).max(Duration::from_secs(1));
            let engine = PostgresEngine::connect_lazy(&config.database_url, acquire_timeout)?;
            Ok(Arc::new(engine))
        }
        SqlDialect::Sqlite => Ok(Arc::new(SqliteEngine::new(&config.database_url))),
    }
}
