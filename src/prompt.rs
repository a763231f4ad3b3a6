//! Prompt construction for query generation
//!
//! The system turn carries the schema, the rule list and a few worked
//! examples. The user's question is sent verbatim as its own turn.

use crate::config::SqlDialect;
use crate::schema::SchemaDescriptor;
use serde::{Deserialize, Serialize};

const SYSTEM_PREAMBLE: &str = r#"You are a SQL expert that translates questions written in English into a single {dialect} query.

## Schema

{schema}
## Rules

1. Generate only read-only SELECT statements. Never modify data or schema.
2. Use only the table and columns listed in the schema above.
3. {date_rule}
4. When the question asks for the "top N", "first N" or "N most/least" of something, end the query with LIMIT N.
5. Give aggregate columns a readable alias (for example `AS order_count`).
6. Return only the SQL statement. No explanations, no comments, no markdown code fences.
"#;

const POSTGRES_DATE_RULE: &str = "Use PostgreSQL date functions: CURRENT_DATE, NOW(), INTERVAL arithmetic such as CURRENT_DATE - INTERVAL '7 days', DATE_TRUNC and EXTRACT.";

const SQLITE_DATE_RULE: &str = "Use SQLite date functions: date('now'), date('now', '-7 days'), strftime('%Y-%m', order_date). Dates are stored as ISO-8601 text.";

const POSTGRES_EXAMPLES: &[(&str, &str)] = &[
    (
        "How many orders were placed in the last 7 days?",
        "SELECT COUNT(*) AS order_count FROM orders WHERE order_date >= CURRENT_DATE - INTERVAL '7 days'",
    ),
    (
        "Top 5 customers by total spend",
        "SELECT customer_name, SUM(total_amount) AS total_spent FROM orders GROUP BY customer_name ORDER BY total_spent DESC LIMIT 5",
    ),
    (
        "Which orders have not shipped yet?",
        "SELECT order_id, customer_name, order_date FROM orders WHERE shipped_date IS NULL ORDER BY order_date",
    ),
];

const SQLITE_EXAMPLES: &[(&str, &str)] = &[
    (
        "How many orders were placed in the last 7 days?",
        "SELECT COUNT(*) AS order_count FROM orders WHERE order_date >= date('now', '-7 days')",
    ),
    (
        "Top 5 customers by total spend",
        "SELECT customer_name, SUM(total_amount) AS total_spent FROM orders GROUP BY customer_name ORDER BY total_spent DESC LIMIT 5",
    ),
    (
        "Which orders have not shipped yet?",
        "SELECT order_id, customer_name, order_date FROM orders WHERE shipped_date IS NULL ORDER BY order_date",
    ),
];

/// Two-part payload for the completion backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder {
    dialect: SqlDialect,
}

impl PromptBuilder {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn build(&self, question: &str, schema: &SchemaDescriptor) -> Prompt {
        let (date_rule, examples) = match self.dialect {
            SqlDialect::Postgres => (POSTGRES_DATE_RULE, POSTGRES_EXAMPLES),
            SqlDialect::Sqlite => (SQLITE_DATE_RULE, SQLITE_EXAMPLES),
        };

        let mut system = SYSTEM_PREAMBLE
            .replace("{dialect}", self.dialect.name())
            .replace("{schema}", &schema.render())
            .replace("{date_rule}", date_rule);

        system.push_str("\n## Examples\n");
        for (question, sql) in examples {
            system.push_str(&format!("\nQuestion: {}\nSQL: {}\n", question, sql));
        }

        Prompt {
            system,
            user: question.to_string(),
        }
    }
}
