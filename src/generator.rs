//! Query generation
//!
//! Turns a prompt into a candidate query by calling the completion backend
//! once and cleaning up the raw text it returns.

use crate::config::SamplingConfig;
use crate::error::GenerationError;
use crate::llm::{CompletionBackend, CompletionRequest};
use crate::prompt::Prompt;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// A statement produced by the backend. Untrusted until the guard admits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery(String);

impl CandidateQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CandidateQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct QueryGenerator {
    backend: Arc<dyn CompletionBackend>,
    sampling: SamplingConfig,
}

impl QueryGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, sampling: SamplingConfig) -> Self {
        Self { backend, sampling }
    }

    pub async fn generate(&self, prompt: &Prompt) -> Result<CandidateQuery, GenerationError> {
        let request = CompletionRequest::new(prompt, self.sampling);
        let raw = self.backend.complete(&request).await?;
        debug!(raw = %raw, "Raw completion");

        let sql = clean_completion(&raw);
        if sql.is_empty() {
            return Err(GenerationError::Empty);
        }
        info!(sql = %sql, "Generated candidate query");
        Ok(CandidateQuery(sql))
    }
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    // A fence plus its language tag: any tag ended by a line break, or a SQL
    // tag followed directly by the query on the same line.
    FENCE.get_or_init(|| {
        Regex::new(r"(?i)```(?:[A-Za-z0-9_+-]*[ \t]*\r?\n|(?:sql|sqlite|postgresql|postgres|psql)\b[ \t]*)?")
            .expect("fence pattern is valid")
    })
}

/// Post-process a raw completion: trim, drop code fences, drop a leading
/// `SQL:` label.
pub fn clean_completion(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = fence_pattern().replace_all(trimmed, "");
    let unfenced = unfenced.trim();

    let unlabelled = match unfenced.get(..4) {
        Some(label) if label.eq_ignore_ascii_case("sql:") => &unfenced[4..],
        _ => unfenced,
    };
    unlabelled.trim().to_string()
}
