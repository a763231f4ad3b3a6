//! PostgreSQL Execution Engine
//!
//! Each query borrows one pooled connection and runs inside a READ ONLY
//! transaction that is rolled back afterwards. Sessions also default to read
//! only. Queries go through the extended protocol as a single unnamed
//! statement, so the server refuses strings carrying more than one command.

use crate::error::ExecutionError;
use crate::execution::engine::ExecutionEngine;
use crate::guard::AcceptedQuery;
use crate::value::{ResultRow, SqlValue};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Decode, Postgres, Row, Type, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct PostgresEngine {
    pool: PgPool,
}

impl PostgresEngine {
    /// Build the pool without connecting; an unreachable server surfaces as
    /// a connection error on the first query.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self, ExecutionError> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| ExecutionError::Connection(e.to_string()))?
            .options([("default_transaction_read_only", "on")]);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }
}

#[async_trait]
impl ExecutionEngine for PostgresEngine {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn execute(&self, query: &AcceptedQuery) -> Result<Vec<ResultRow>, ExecutionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ExecutionError::Connection(e.to_string()))?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let rows = sqlx::query(query.as_str())
            .persistent(false)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "Rollback of read-only transaction failed");
        }

        decode_rows(&rows)
    }

    async fn health_check(&self) -> Result<(), ExecutionError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }
}

fn map_sqlx_error(e: sqlx::Error) -> ExecutionError {
    match e {
        sqlx::Error::Database(db_err) => ExecutionError::Statement(db_err.message().to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ExecutionError::Connection(e.to_string()),
        other => ExecutionError::Statement(other.to_string()),
    }
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<ResultRow>, ExecutionError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let columns: Arc<[String]> = first.columns().iter().map(|c| c.name().to_string()).collect();

    rows.iter()
        .map(|row| {
            let values = (0..columns.len())
                .map(|idx| decode_value(row, idx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ResultRow::new(columns.clone(), values))
        })
        .collect()
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Result<T, ExecutionError>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get(idx)
        .map_err(|e| ExecutionError::Statement(format!("column {} could not be decoded: {}", idx, e)))
}

/// Values arrive in binary format and are decoded by their column type.
/// Types without a mapping are passed through when their bytes are text.
fn decode_value(row: &PgRow, idx: usize) -> Result<SqlValue, ExecutionError> {
    let raw = row
        .try_get_raw(idx)
        .map_err(|e| ExecutionError::Statement(e.to_string()))?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => SqlValue::Boolean(get(row, idx)?),
        "INT2" => SqlValue::Integer(get::<i16>(row, idx)?.into()),
        "INT4" => SqlValue::Integer(get::<i32>(row, idx)?.into()),
        "INT8" => SqlValue::Integer(get(row, idx)?),
        "OID" => SqlValue::Integer(get::<Oid>(row, idx)?.0.into()),
        "FLOAT4" => SqlValue::Float(get::<f32>(row, idx)?.into()),
        "FLOAT8" => SqlValue::Float(get(row, idx)?),
        "NUMERIC" => SqlValue::Decimal(get::<Decimal>(row, idx)?.to_string()),
        "DATE" => SqlValue::Date(get::<NaiveDate>(row, idx)?),
        "TIMESTAMP" => SqlValue::Timestamp(get::<NaiveDateTime>(row, idx)?),
        "TIMESTAMPTZ" => SqlValue::TimestampTz(get::<DateTime<Utc>>(row, idx)?),
        "UUID" => SqlValue::Text(get::<uuid::Uuid>(row, idx)?.to_string()),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => SqlValue::Text(get(row, idx)?),
        _ => {
            let bytes = raw
                .as_bytes()
                .map_err(|e| ExecutionError::Statement(e.to_string()))?;
            match std::str::from_utf8(bytes) {
                Ok(text) => SqlValue::Text(text.to_string()),
                Err(_) => {
                    return Err(ExecutionError::Statement(format!(
                        "column {} has unsupported type {}",
                        idx, type_name
                    )))
                }
            }
        }
    };
    Ok(value)
}
