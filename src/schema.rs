//! Schema descriptor for the queryable entity
//!
//! The descriptor is static configuration text for the prompt. It is loaded
//! once and never changes for the lifetime of the process.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub sql_type: String,
    #[serde(default)]
    pub nullable: bool,
    /// Semantics and sample-data characteristics the model should know about.
    #[serde(default)]
    pub note: Option<String>,
}

impl ColumnDescriptor {
    fn new(name: &str, sql_type: &str, nullable: bool, note: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable,
            note: Some(note.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub entity: String,
    #[serde(default)]
    pub description: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
}

impl SchemaDescriptor {
    /// Built-in descriptor of the `orders` table.
    pub fn orders() -> Self {
        Self {
            entity: "orders".to_string(),
            description: Some("One row per customer order.".to_string()),
            columns: vec![
                ColumnDescriptor::new("order_id", "INTEGER", false, "primary key, ascending"),
                ColumnDescriptor::new("customer_name", "VARCHAR(100)", false, "full name, e.g. 'Maria Lopez'"),
                ColumnDescriptor::new("customer_email", "VARCHAR(255)", true, "may be missing for guest checkouts"),
                ColumnDescriptor::new("order_date", "DATE", false, "day the order was placed; data covers the last two years"),
                ColumnDescriptor::new("total_amount", "NUMERIC(10,2)", false, "order total in USD, between 5.00 and 5000.00"),
                ColumnDescriptor::new(
                    "status",
                    "VARCHAR(20)",
                    false,
                    "one of 'Pending', 'Shipped', 'Delivered', 'Cancelled'",
                ),
                ColumnDescriptor::new("shipping_city", "VARCHAR(100)", true, "destination city"),
                ColumnDescriptor::new("shipped_date", "DATE", true, "NULL until the order ships"),
            ],
        }
    }

    /// Read a descriptor from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let descriptor: SchemaDescriptor = serde_json::from_str(&raw)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.entity.trim().is_empty() {
            return Err(ConfigError::Schema("entity name is empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(ConfigError::Schema(format!("entity '{}' has no columns", self.entity)));
        }
        Ok(())
    }

    /// Text block embedded in the system prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Table: {}", self.entity);
        if let Some(description) = &self.description {
            let _ = writeln!(out, "Description: {}", description);
        }
        let _ = writeln!(out, "Columns:");
        for column in &self.columns {
            let nullability = if column.nullable { "NULL" } else { "NOT NULL" };
            let _ = write!(out, "- {} {} {}", column.name, column.sql_type, nullability);
            if let Some(note) = &column.note {
                let _ = write!(out, " -- {}", note);
            }
            out.push('\n');
        }
        out
    }
}
