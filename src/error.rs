use std::time::Duration;
use thiserror::Error;

/// Failures talking to the completion backend or making sense of its answer.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("completion backend unavailable: {0}")]
    Unavailable(String),

    #[error("completion backend error ({status}): {body}")]
    Backend { status: u16, body: String },

    #[error("malformed completion response: {0}")]
    Malformed(String),

    #[error("completion backend returned an empty query")]
    Empty,
}

/// Why the guard refused a candidate query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardRejection {
    #[error("only SELECT queries are allowed")]
    MissingSelectPrefix,

    #[error("query contains forbidden keyword: {0}")]
    DeniedKeyword(&'static str),
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("could not connect to the database: {0}")]
    Connection(String),

    #[error("query timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("database rejected the query: {0}")]
    Statement(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("unsupported database url scheme: {0}")]
    UnsupportedDatabase(String),

    #[error("schema descriptor error: {0}")]
    Schema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything that can end a request. The orchestrator flattens these into a
/// single client-facing message.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("query rejected: {0}")]
    Rejected(#[from] GuardRejection),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("question is {len} characters long (max {max})")]
    QuestionTooLong { len: usize, max: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Message sent to the caller. Backend bodies and driver details stay in
    /// the logs.
    pub fn client_message(&self) -> String {
        match self {
            PipelineError::Generation(GenerationError::Empty) => {
                "Could not generate a query for this question.".to_string()
            }
            PipelineError::Generation(_) => {
                "The query generation service is unavailable. Please try again.".to_string()
            }
            PipelineError::Rejected(rejection) => format!("Query rejected: {}", rejection),
            PipelineError::Execution(ExecutionError::Connection(_)) => {
                "Could not connect to the database.".to_string()
            }
            PipelineError::Execution(ExecutionError::Timeout(limit)) => {
                format!("The query timed out after {} seconds.", limit.as_secs())
            }
            PipelineError::Execution(ExecutionError::Statement(detail)) => {
                format!("The database could not run the query: {}", detail)
            }
            PipelineError::QuestionTooLong { max, .. } => {
                format!("Question is too long (limit is {} characters).", max)
            }
            PipelineError::Internal(_) => "An internal error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_cites_keyword() {
        let err = PipelineError::from(GuardRejection::DeniedKeyword("DROP"));
        assert_eq!(err.client_message(), "Query rejected: query contains forbidden keyword: DROP");
    }

    #[test]
    fn backend_details_are_not_leaked() {
        let err = PipelineError::from(GenerationError::Backend {
            status: 401,
            body: "invalid api key sk-123".to_string(),
        });
        assert!(!err.client_message().contains("sk-123"));
        assert!(err.to_string().contains("sk-123"));
    }

    #[test]
    fn connection_failure_is_flattened() {
        let err = PipelineError::from(ExecutionError::Connection("tcp refused at 10.0.0.4".into()));
        assert_eq!(err.client_message(), "Could not connect to the database.");
    }
}
