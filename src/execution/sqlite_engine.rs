//! SQLite Execution Engine
//!
//! Opens the database file read-only for each query and runs the statement on
//! the blocking pool. If the caller stops waiting (timeout or cancellation),
//! the running statement is interrupted.

use crate::error::ExecutionError;
use crate::execution::engine::ExecutionEngine;
use crate::guard::AcceptedQuery;
use crate::value::{ResultRow, SqlValue};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;

pub struct SqliteEngine {
    path: PathBuf,
}

impl SqliteEngine {
    /// Accepts `sqlite://path`, `sqlite:path` or a bare path.
    pub fn new(database_url: &str) -> Self {
        let path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        Self {
            path: PathBuf::from(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_read_only(path: &Path) -> Result<Connection, ExecutionError> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|e| ExecutionError::Connection(format!("{}: {}", path.display(), e)))
}

/// Interrupts the statement unless disarmed first. The handle arrives from
/// the blocking task once the connection is open.
struct InterruptOnDrop(Option<oneshot::Receiver<InterruptHandle>>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(mut handle_rx) = self.0.take() {
            // After close the blocking task can no longer hand over a handle
            // and gives up before running the statement.
            handle_rx.close();
            if let Ok(handle) = handle_rx.try_recv() {
                handle.interrupt();
            }
        }
    }
}

fn open_and_run(
    path: &Path,
    sql: &str,
    handle_tx: oneshot::Sender<InterruptHandle>,
) -> Result<Vec<ResultRow>, ExecutionError> {
    let conn = open_read_only(path)?;
    if handle_tx.send(conn.get_interrupt_handle()).is_err() {
        return Err(ExecutionError::Statement("query cancelled before it started".to_string()));
    }
    run_query(&conn, sql)
}

#[async_trait]
impl ExecutionEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, query: &AcceptedQuery) -> Result<Vec<ResultRow>, ExecutionError> {
        let path = self.path.clone();
        let sql = query.as_str().to_string();
        let (handle_tx, handle_rx) = oneshot::channel();
        let guard = InterruptOnDrop(Some(handle_rx));

        let result = tokio::task::spawn_blocking(move || open_and_run(&path, &sql, handle_tx))
            .await
            .map_err(|e| ExecutionError::Statement(format!("query task failed: {}", e)))?;

        guard.disarm();
        result
    }

    async fn health_check(&self) -> Result<(), ExecutionError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path)?;
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| ExecutionError::Connection(e.to_string()))
        })
        .await
        .map_err(|e| ExecutionError::Connection(format!("health check task failed: {}", e)))?
    }
}

fn statement_error(e: rusqlite::Error) -> ExecutionError {
    ExecutionError::Statement(e.to_string())
}

fn run_query(conn: &Connection, sql: &str) -> Result<Vec<ResultRow>, ExecutionError> {
    let mut stmt = conn.prepare(sql).map_err(statement_error)?;
    let columns: Arc<[String]> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([]).map_err(statement_error)?;
    let mut result = Vec::new();
    while let Some(row) = rows.next().map_err(statement_error)? {
        let values = (0..columns.len())
            .map(|idx| row.get_ref(idx).map(to_sql_value))
            .collect::<Result<Vec<_>, _>>()
            .map_err(statement_error)?;
        result.push(ResultRow::new(columns.clone(), values));
    }
    Ok(result)
}

fn to_sql_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Text(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
    }
}
