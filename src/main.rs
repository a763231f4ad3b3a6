use sql_assistant::channel::ChannelServer;
use sql_assistant::config::AppConfig;
use sql_assistant::execution::{connect_engine, ExecutionEngine};
use sql_assistant::llm::LlmClient;
use sql_assistant::schema::SchemaDescriptor;
use sql_assistant::session::{run_request, EventSink, Pipeline, SessionState};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sql-assistant")]
#[command(about = "Answer English questions with guarded, read-only SQL")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: Overrides,
}

/// Settings that override the environment / .env file.
#[derive(ClapArgs)]
struct Overrides {
    /// Database URL (or set DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Completion API key (or set LLM_API_KEY / OPENAI_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Completion model name (or set LLM_MODEL)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Query timeout in seconds (or set QUERY_TIMEOUT_SECS)
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// JSON schema descriptor (or set SCHEMA_PATH)
    #[arg(long, global = true)]
    schema: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session channel server
    Serve {
        /// Address to listen on (or set BIND_ADDR)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Answer one question and print every event as a JSON line
    Ask {
        /// The question in English
        question: String,
    },
}

fn load_config(overrides: &Overrides) -> Result<AppConfig> {
    dotenv::dotenv().ok();
    let config = AppConfig::from_lookup(|key| {
        let value = match key {
            "DATABASE_URL" => overrides.database_url.clone(),
            "LLM_API_KEY" => overrides.api_key.clone(),
            "LLM_MODEL" => overrides.model.clone(),
            "QUERY_TIMEOUT_SECS" => overrides.timeout_secs.map(|s| s.to_string()),
            "SCHEMA_PATH" => overrides.schema.as_ref().map(|p| p.display().to_string()),
            _ => None,
        };
        value.or_else(|| std::env::var(key).ok())
    })?;
    Ok(config)
}

fn build_pipeline(config: &AppConfig, engine: Arc<dyn ExecutionEngine>) -> Result<Pipeline> {
    let schema = match &config.schema_path {
        Some(path) => SchemaDescriptor::load(path)
            .with_context(|| format!("loading schema descriptor from {}", path.display()))?,
        None => SchemaDescriptor::orders(),
    };
    let backend = Arc::new(LlmClient::from_config(&config.llm));
    Ok(Pipeline::from_config(config, Arc::new(schema), backend, engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = load_config(&args.overrides)?;

    match args.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            info!(config = ?config, "Starting channel server");

            let engine = connect_engine(&config).context("configuring the database engine")?;
            match tokio::time::timeout(Duration::from_secs(5), engine.health_check()).await {
                Ok(Ok(())) => info!(engine = engine.name(), "Database reachable"),
                Ok(Err(e)) => warn!(error = %e, "Database not reachable yet; requests will fail until it is"),
                Err(_) => warn!("Database health check timed out"),
            }
            let pipeline = Arc::new(build_pipeline(&config, engine)?);

            let listener = TcpListener::bind(&config.bind_addr)
                .await
                .with_context(|| format!("binding {}", config.bind_addr))?;
            let server = Arc::new(
                ChannelServer::new(pipeline, config.max_inflight_per_connection)
                    .with_max_line_bytes(config.max_message_bytes),
            );
            server.serve(listener).await?;
        }
        Commands::Ask { question } => {
            let engine = connect_engine(&config).context("configuring the database engine")?;
            let pipeline = Arc::new(build_pipeline(&config, engine)?);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(error = %e, "Failed to serialize event"),
                    }
                }
            });

            let state = run_request(pipeline, EventSink::new(tx), question).await;
            printer.await?;
            if state != SessionState::Completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
