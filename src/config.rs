//! Process configuration
//!
//! Read once at startup (`.env`, then the environment, then CLI overrides) and
//! shared as an immutable snapshot.

use crate::error::ConfigError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5080";

/// SQL flavour of the backing store, derived from the database URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Ok(SqlDialect::Postgres)
        } else if lower.starts_with("sqlite:") || !lower.contains("://") {
            Ok(SqlDialect::Sqlite)
        } else {
            let scheme = lower.split("://").next().unwrap_or_default().to_string();
            Err(ConfigError::UnsupportedDatabase(scheme))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::Postgres => "PostgreSQL",
            SqlDialect::Sqlite => "SQLite",
        }
    }
}

/// Sampling knobs sent with every completion request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.95,
            max_tokens: 500,
        }
    }
}

#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub sampling: SamplingConfig,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("sampling", &self.sampling)
            .finish()
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub dialect: SqlDialect,
    pub llm: LlmConfig,
    pub query_timeout: Duration,
    pub bind_addr: String,
    /// Questions longer than this are refused before generation.
    pub max_question_chars: usize,
    /// Requests allowed to run at once on one channel.
    pub max_inflight_per_connection: usize,
    /// Longest inbound channel line, in bytes.
    pub max_message_bytes: usize,
    pub schema_path: Option<PathBuf>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url", &redact_url(&self.database_url))
            .field("dialect", &self.dialect)
            .field("llm", &self.llm)
            .field("query_timeout", &self.query_timeout)
            .field("bind_addr", &self.bind_addr)
            .field("max_question_chars", &self.max_question_chars)
            .field("max_inflight_per_connection", &self.max_inflight_per_connection)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("schema_path", &self.schema_path)
            .finish()
    }
}

impl AppConfig {
    /// Build a configuration with defaults for everything except the database
    /// and the API key.
    pub fn new(database_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let database_url = database_url.into();
        let dialect = SqlDialect::from_url(&database_url)?;
        Ok(Self {
            database_url,
            dialect,
            llm: LlmConfig {
                api_key: api_key.into(),
                base_url: DEFAULT_LLM_BASE_URL.to_string(),
                model: DEFAULT_LLM_MODEL.to_string(),
                sampling: SamplingConfig::default(),
            },
            query_timeout: Duration::from_secs(30),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_question_chars: 2000,
            max_inflight_per_connection: 4,
            max_message_bytes: 64 * 1024,
            schema_path: None,
        })
    }

    /// Load from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let api_key = lookup("LLM_API_KEY")
            .or_else(|| lookup("OPENAI_API_KEY"))
            .ok_or(ConfigError::Missing("LLM_API_KEY"))?;

        let mut config = Self::new(database_url, api_key)?;

        if let Some(url) = lookup("LLM_BASE_URL") {
            config.llm.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Some(v) = lookup("LLM_TEMPERATURE") {
            config.llm.sampling.temperature = parse("LLM_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("LLM_TOP_P") {
            config.llm.sampling.top_p = parse("LLM_TOP_P", &v)?;
        }
        if let Some(v) = lookup("LLM_MAX_TOKENS") {
            config.llm.sampling.max_tokens = parse("LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("QUERY_TIMEOUT_SECS") {
            config.query_timeout = Duration::from_secs(parse("QUERY_TIMEOUT_SECS", &v)?);
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(v) = lookup("MAX_QUESTION_CHARS") {
            config.max_question_chars = parse("MAX_QUESTION_CHARS", &v)?;
        }
        if let Some(v) = lookup("MAX_INFLIGHT_PER_CONNECTION") {
            config.max_inflight_per_connection = parse("MAX_INFLIGHT_PER_CONNECTION", &v)?;
        }
        if let Some(v) = lookup("MAX_MESSAGE_BYTES") {
            config.max_message_bytes = parse("MAX_MESSAGE_BYTES", &v)?;
        }
        config.schema_path = lookup("SCHEMA_PATH").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sampling = &self.llm.sampling;
        if !(0.0..=2.0).contains(&sampling.temperature) {
            return Err(ConfigError::Invalid {
                key: "LLM_TEMPERATURE",
                reason: "must be between 0 and 2".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&sampling.top_p) || sampling.top_p == 0.0 {
            return Err(ConfigError::Invalid {
                key: "LLM_TOP_P",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if sampling.max_tokens == 0 {
            return Err(ConfigError::Invalid {
                key: "LLM_MAX_TOKENS",
                reason: "must be positive".to_string(),
            });
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "QUERY_TIMEOUT_SECS",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_inflight_per_connection == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_INFLIGHT_PER_CONNECTION",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_MESSAGE_BYTES",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

/// Hide credentials in a connection string before it reaches a log line.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_minimal_env() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://app:secret@db:5432/shop"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();

        assert_eq!(config.dialect, SqlDialect::Postgres);
        assert_eq!(config.llm.api_key, "sk-test");
        assert_eq!(config.llm.sampling, SamplingConfig::default());
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert_eq!(config.max_question_chars, 2000);
        assert_eq!(config.max_message_bytes, 64 * 1024);
    }

    #[test]
    fn test_missing_database_url() {
        let err = AppConfig::from_lookup(lookup(&[("LLM_API_KEY", "k")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite:shop.db"),
            ("LLM_API_KEY", "k"),
            ("QUERY_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "QUERY_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn test_dialect_detection() {
        assert_eq!(SqlDialect::from_url("postgresql://h/db").unwrap(), SqlDialect::Postgres);
        assert_eq!(SqlDialect::from_url("sqlite:data/shop.db").unwrap(), SqlDialect::Sqlite);
        assert_eq!(SqlDialect::from_url("./shop.db").unwrap(), SqlDialect::Sqlite);
        assert!(SqlDialect::from_url("mysql://h/db").is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = AppConfig::new("postgres://app:hunter2@db/shop", "sk-very-secret").unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("sk-very-secret"));
        assert!(printed.contains("@db/shop"));
    }
}
