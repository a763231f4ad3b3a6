//! Loosely typed result values
//!
//! Stores hand back numbers, text, dates and NULLs per column per row. Each
//! adapter maps its native representation into [`SqlValue`] so serialization
//! at the channel boundary is explicit.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Exact numeric kept in its textual form.
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_unit(),
            SqlValue::Boolean(b) => serializer.serialize_bool(*b),
            SqlValue::Integer(i) => serializer.serialize_i64(*i),
            SqlValue::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            SqlValue::Float(f) => serializer.serialize_str(&f.to_string()),
            SqlValue::Decimal(d) => match d.parse::<f64>() {
                Ok(f) if f.is_finite() => serializer.serialize_f64(f),
                _ => serializer.serialize_str(d),
            },
            SqlValue::Text(s) => serializer.serialize_str(s),
            SqlValue::Date(d) => serializer.serialize_str(&d.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(ts) => serializer.serialize_str(&ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            SqlValue::TimestampTz(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

/// One row of a result set. Rows of the same set share their column list.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl ResultRow {
    /// `values` must line up with `columns`.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

impl Serialize for ResultRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}
