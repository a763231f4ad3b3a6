pub mod channel;
pub mod config;
pub mod error;
pub mod execution;
pub mod generator;
pub mod guard;
pub mod llm;
pub mod prompt;
pub mod schema;
pub mod session;
pub mod value;

pub use config::{AppConfig, SqlDialect};
pub use error::{ExecutionError, GenerationError, GuardRejection, PipelineError};
pub use guard::{GuardDecision, QueryGuard};
pub use session::{Pipeline, SessionEvent, SessionOrchestrator, SessionState};
