//! Session orchestration
//!
//! One [`SessionOrchestrator`] per request sequences prompt building,
//! generation, guarding and execution, emits progress events and ends in
//! exactly one terminal outcome: results followed by a final status, or a
//! single error.

use crate::config::AppConfig;
use crate::error::{PipelineError, Result};
use crate::execution::{ExecutionEngine, QueryExecutor};
use crate::generator::QueryGenerator;
use crate::guard::QueryGuard;
use crate::llm::CompletionBackend;
use crate::prompt::PromptBuilder;
use crate::schema::SchemaDescriptor;
use crate::value::ResultRow;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

pub const STATUS_CONNECTED: &str = "Connected";
pub const STATUS_ANALYZING: &str = "Analyzing question...";
pub const STATUS_TRANSLATING: &str = "Translating to SQL...";
pub const STATUS_SQL_GENERATED: &str = "SQL query generated";
pub const STATUS_EXECUTING: &str = "Executing query...";

/// Events sent to the caller, tagged with the channel method names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    #[serde(rename = "ReceiveStatus")]
    Status(String),
    #[serde(rename = "ReceiveSqlQuery")]
    SqlGenerated(String),
    #[serde(rename = "ReceiveResults")]
    Results(Vec<ResultRow>),
    #[serde(rename = "ReceiveError")]
    Error(String),
}

impl SessionEvent {
    pub fn completed_status(rows: usize) -> Self {
        let noun = if rows == 1 { "result" } else { "results" };
        SessionEvent::Status(format!("Query completed: {} {}", rows, noun))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SchemaResolved,
    Generating,
    Generated,
    Guarding,
    Executing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, SchemaResolved)
            | (SchemaResolved, Generating)
            | (Generating, Generated)
            | (Generated, Guarding)
            | (Guarding, Executing)
            | (Executing, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Outbound side of a channel. Tracks whether a terminal event went out so a
/// late fault can never produce a second one.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    terminal_sent: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            tx,
            terminal_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fork a sink for a new request on the same channel.
    pub fn for_request(&self) -> Self {
        Self::new(self.tx.clone())
    }

    pub fn emit(&self, event: SessionEvent) {
        if matches!(event, SessionEvent::Error(_) | SessionEvent::Results(_)) {
            self.terminal_sent.store(true, Ordering::SeqCst);
        }
        if self.tx.send(event).is_err() {
            debug!("Caller went away, dropping event");
        }
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }
}

/// Shared, read-only components used by every request.
pub struct Pipeline {
    schema: Arc<SchemaDescriptor>,
    prompts: PromptBuilder,
    generator: QueryGenerator,
    guard: QueryGuard,
    executor: QueryExecutor,
    max_question_chars: usize,
}

impl Pipeline {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        prompts: PromptBuilder,
        generator: QueryGenerator,
        executor: QueryExecutor,
        max_question_chars: usize,
    ) -> Self {
        Self {
            schema,
            prompts,
            generator,
            guard: QueryGuard::new(),
            executor,
            max_question_chars,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        schema: Arc<SchemaDescriptor>,
        backend: Arc<dyn CompletionBackend>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self::new(
            schema,
            PromptBuilder::new(config.dialect),
            QueryGenerator::new(backend, config.llm.sampling),
            QueryExecutor::new(engine, config.query_timeout),
            config.max_question_chars,
        )
    }
}

pub struct SessionOrchestrator {
    pipeline: Arc<Pipeline>,
    events: EventSink,
    state: SessionState,
    request_id: Uuid,
}

impl SessionOrchestrator {
    pub fn new(pipeline: Arc<Pipeline>, events: EventSink) -> Self {
        Self {
            pipeline,
            events,
            state: SessionState::Idle,
            request_id: Uuid::new_v4(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Process one question to a terminal state. Never returns an error:
    /// every failure becomes a single Error event.
    pub async fn run(mut self, question: &str) -> SessionState {
        let span = info_span!("request", id = %self.request_id);
        async move {
            match self.drive(question).await {
                Ok(rows) => {
                    self.transition(SessionState::Completed);
                    info!(rows, "Request completed");
                }
                Err(err) => {
                    error!(stage = ?self.state, error = %err, "Request failed");
                    self.events.emit(SessionEvent::Error(err.client_message()));
                    self.transition(SessionState::Failed);
                }
            }
            self.state
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self, question: &str) -> Result<usize> {
        info!(question, "Processing question");
        self.transition(SessionState::SchemaResolved);
        self.events.emit(SessionEvent::Status(STATUS_ANALYZING.to_string()));

        let len = question.chars().count();
        if len > self.pipeline.max_question_chars {
            return Err(PipelineError::QuestionTooLong {
                len,
                max: self.pipeline.max_question_chars,
            });
        }
        let prompt = self.pipeline.prompts.build(question, &self.pipeline.schema);

        self.transition(SessionState::Generating);
        self.events.emit(SessionEvent::Status(STATUS_TRANSLATING.to_string()));
        let candidate = self.pipeline.generator.generate(&prompt).await?;

        self.transition(SessionState::Generated);
        self.events.emit(SessionEvent::Status(STATUS_SQL_GENERATED.to_string()));

        self.transition(SessionState::Guarding);
        let accepted = self.pipeline.guard.admit(candidate)?;

        // The query text is only echoed once the guard has admitted it.
        self.events.emit(SessionEvent::SqlGenerated(accepted.to_string()));
        self.transition(SessionState::Executing);
        self.events.emit(SessionEvent::Status(STATUS_EXECUTING.to_string()));

        let rows = self.pipeline.executor.execute(&accepted).await?;
        let count = rows.len();
        self.events.emit(SessionEvent::Results(rows));
        self.events.emit(SessionEvent::completed_status(count));
        Ok(count)
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }
}

/// Run one request on its own task. A panic anywhere in the pipeline is
/// turned into an Error event instead of reaching the channel.
pub async fn run_request(pipeline: Arc<Pipeline>, events: EventSink, question: String) -> SessionState {
    let orchestrator = SessionOrchestrator::new(pipeline, events.clone());
    let request_id = orchestrator.request_id();

    match tokio::spawn(async move { orchestrator.run(&question).await }).await {
        Ok(state) => state,
        Err(join_err) => {
            error!(id = %request_id, error = %join_err, "Request task aborted");
            if !events.terminal_sent() {
                let err = PipelineError::Internal(join_err.to_string());
                events.emit(SessionEvent::Error(err.client_message()));
            }
            SessionState::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplingConfig, SqlDialect};
    use crate::error::{ExecutionError, GenerationError};
    use crate::guard::AcceptedQuery;
    use crate::llm::CompletionRequest;
    use crate::value::SqlValue;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    enum Reply {
        Sql(&'static str),
        Unavailable,
        Panic,
    }

    struct ScriptedBackend(Reply);

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _request: &CompletionRequest) -> std::result::Result<String, GenerationError> {
            match self.0 {
                Reply::Sql(sql) => Ok(sql.to_string()),
                Reply::Unavailable => Err(GenerationError::Unavailable("connection refused".to_string())),
                Reply::Panic => panic!("backend exploded"),
            }
        }
    }

    enum Outcome {
        Count(i64),
        Unreachable,
        UnknownColumn,
    }

    struct FakeEngine {
        outcome: Outcome,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn execute(&self, _query: &AcceptedQuery) -> std::result::Result<Vec<ResultRow>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                Outcome::Count(n) => {
                    let columns: Arc<[String]> = vec!["order_count".to_string()].into();
                    Ok(vec![ResultRow::new(columns, vec![SqlValue::Integer(n)])])
                }
                Outcome::Unreachable => Err(ExecutionError::Connection("connection refused".to_string())),
                Outcome::UnknownColumn => Err(ExecutionError::Statement(
                    "column \"order_total\" does not exist".to_string(),
                )),
            }
        }

        async fn health_check(&self) -> std::result::Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn pipeline(reply: Reply, outcome: Outcome) -> (Arc<Pipeline>, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine {
            outcome,
            calls: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::new(
            Arc::new(SchemaDescriptor::orders()),
            PromptBuilder::new(SqlDialect::Postgres),
            QueryGenerator::new(Arc::new(ScriptedBackend(reply)), SamplingConfig::default()),
            QueryExecutor::new(engine.clone(), Duration::from_secs(30)),
            200,
        );
        (Arc::new(pipeline), engine)
    }

    async fn run(pipeline: Arc<Pipeline>, question: &str) -> (SessionState, Vec<SessionEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = run_request(pipeline, EventSink::new(tx), question.to_string()).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (state, events)
    }

    fn errors(events: &[SessionEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Error(msg) => Some(msg.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_request_event_sequence() {
        let sql = "SELECT COUNT(*) AS order_count FROM orders WHERE order_date >= CURRENT_DATE - INTERVAL '7 days'";
        let (pipeline, engine) = pipeline(Reply::Sql("```sql\nSELECT COUNT(*) AS order_count FROM orders WHERE order_date >= CURRENT_DATE - INTERVAL '7 days'\n```"), Outcome::Count(12));

        let (state, events) = run(pipeline, "How many orders in the last 7 days?").await;

        assert_eq!(state, SessionState::Completed);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.len(), 7);
        assert_eq!(events[0], SessionEvent::Status(STATUS_ANALYZING.to_string()));
        assert_eq!(events[1], SessionEvent::Status(STATUS_TRANSLATING.to_string()));
        assert_eq!(events[2], SessionEvent::Status(STATUS_SQL_GENERATED.to_string()));
        assert_eq!(events[3], SessionEvent::SqlGenerated(sql.to_string()));
        assert_eq!(events[4], SessionEvent::Status(STATUS_EXECUTING.to_string()));
        match &events[5] {
            SessionEvent::Results(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].values(), [SqlValue::Integer(12)]);
            }
            other => panic!("expected results, got {:?}", other),
        }
        assert_eq!(events[6], SessionEvent::Status("Query completed: 1 result".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_query_never_executes() {
        let (pipeline, engine) = pipeline(Reply::Sql("DROP TABLE orders"), Outcome::Count(0));

        let (state, events) = run(pipeline, "Drop all orders").await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(errors(&events), ["Query rejected: only SELECT queries are allowed"]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::SqlGenerated(_) | SessionEvent::Results(_))));
    }

    #[tokio::test]
    async fn test_rejection_cites_drop_keyword() {
        let (pipeline, engine) = pipeline(Reply::Sql("SELECT 1; DROP TABLE orders"), Outcome::Count(0));

        let (_, events) = run(pipeline, "Drop all orders").await;

        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(errors(&events), ["Query rejected: query contains forbidden keyword: DROP"]);
        assert!(matches!(events.last(), Some(SessionEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_unreachable_store_yields_one_error_and_no_results() {
        let (pipeline, _) = pipeline(Reply::Sql("SELECT COUNT(*) FROM orders"), Outcome::Unreachable);

        let (state, events) = run(pipeline, "How many orders?").await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(errors(&events), ["Could not connect to the database."]);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Results(_))));
    }

    #[tokio::test]
    async fn test_statement_error_is_reported() {
        let (pipeline, _) = pipeline(Reply::Sql("SELECT order_total FROM orders"), Outcome::UnknownColumn);

        let (_, events) = run(pipeline, "Show order totals").await;

        assert_eq!(
            errors(&events),
            ["The database could not run the query: column \"order_total\" does not exist"]
        );
    }

    #[tokio::test]
    async fn test_generation_failure() {
        let (pipeline, engine) = pipeline(Reply::Unavailable, Outcome::Count(0));

        let (state, events) = run(pipeline, "How many orders?").await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(events.len(), 3);
        assert_eq!(
            errors(&events),
            ["The query generation service is unavailable. Please try again."]
        );
    }

    #[tokio::test]
    async fn test_question_too_long() {
        let (pipeline, engine) = pipeline(Reply::Sql("SELECT 1"), Outcome::Count(1));

        let (state, events) = run(pipeline, &"x".repeat(201)).await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(errors(&events), ["Question is too long (limit is 200 characters)."]);
    }

    #[tokio::test]
    async fn test_panic_becomes_single_error() {
        let (pipeline, _) = pipeline(Reply::Panic, Outcome::Count(0));

        let (state, events) = run(pipeline, "How many orders?").await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(errors(&events), ["An internal error occurred."]);
    }

    #[tokio::test]
    async fn test_same_question_same_decision() {
        let (pipeline, _) = pipeline(Reply::Sql("SELECT COUNT(*) AS order_count FROM orders"), Outcome::Count(3));

        let (_, first) = run(pipeline.clone(), "How many orders?").await;
        let (_, second) = run(pipeline, "How many orders?").await;
        assert_eq!(first, second);
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(SchemaResolved));
        assert!(Guarding.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Generating.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(SessionEvent::SqlGenerated("SELECT 1".to_string())).unwrap();
        assert_eq!(json, serde_json::json!({"event": "ReceiveSqlQuery", "data": "SELECT 1"}));

        let columns: Arc<[String]> = vec!["shipped_date".to_string()].into();
        let rows = vec![ResultRow::new(columns, vec![SqlValue::Null])];
        let json = serde_json::to_value(SessionEvent::Results(rows)).unwrap();
        assert_eq!(json, serde_json::json!({"event": "ReceiveResults", "data": [{"shipped_date": null}]}));
    }
}
