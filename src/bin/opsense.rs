#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;

use opsense_rag::config::PipelineConfig;
use opsense_rag::evidence::{QdrantConfig, QdrantEvidenceStore};
use opsense_rag::gateway::openrouter::OpenRouterAdapter;
use opsense_rag::gateway::{GatewayConfig, ProviderGateway, TracingUsageSink};
use opsense_rag::pipeline::{Attachment, Gatekeeper, PipelineOrchestrator, Query};
use opsense_rag::store::{SqliteChunkResolver, SqliteSessionStore};
use opsense_rag::telemetry;
use opsense_rag::trace::{JsonlTraceSink, TraceSink};

#[derive(Parser)]
#[command(name = "opsense", version, about = "Agentic RAG over a tenant document corpus")]
struct Cli {
    /// TOML configuration file (defaults, then file, then OPSENSE_* env)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question against the tenant's corpus
    Ask {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        question: String,
        #[arg(long)]
        user: Option<String>,
        /// Context tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Attach an image, video or document, repeatable
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        /// Retrieval limit override (clamped to the configured maximum)
        #[arg(long)]
        limit: Option<usize>,
        /// SQLite chunk catalogue
        #[arg(long)]
        chunks_db: Option<PathBuf>,
        /// Persist completed sessions to this SQLite database
        #[arg(long)]
        sessions_db: Option<PathBuf>,
        /// Append trace steps as JSONL
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Write the result JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the admission check offline and print the decision
    Check {
        #[arg(long)]
        question: String,
    },
    /// List recent sessions for a tenant
    Sessions {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_json);
    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask {
            tenant,
            question,
            user,
            tags,
            attachments,
            limit,
            chunks_db,
            sessions_db,
            trace,
            out,
        } => {
            let mut query = Query::new(question, tenant).tags(tags);
            if let Some(user) = user {
                query = query.user(user);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            for path in &attachments {
                query = query.attach(read_attachment(path)?);
            }

            let backend = OpenRouterAdapter::from_env()?;
            let gateway = ProviderGateway::with_config(
                backend,
                Arc::new(TracingUsageSink),
                GatewayConfig {
                    max_retries: config.provider.max_retries,
                    retry_base_delay: Duration::from_millis(config.provider.retry_base_delay_ms),
                },
            );
            let qdrant = QdrantConfig::from_env().ok_or("QDRANT_URL not set")?;
            let store = QdrantEvidenceStore::new(qdrant)?;
            let chunks_path = chunks_db
                .or_else(|| std::env::var("OPSENSE_CHUNKS_DB").ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".opsense_chunks.sqlite"));
            let resolver = SqliteChunkResolver::new(chunks_path)?;

            let mut orchestrator = PipelineOrchestrator::from_config(
                &config,
                Arc::new(gateway),
                Arc::new(store),
                Arc::new(resolver),
            )?;
            if let Some(path) = sessions_db {
                orchestrator = orchestrator.with_persister(Arc::new(SqliteSessionStore::new(path)?));
            }
            let (trace_sink, trace_worker) = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    (Some(Arc::new(sink)), Some(worker))
                }
                None => (None, None),
            };
            if let Some(sink) = &trace_sink {
                orchestrator = orchestrator.with_trace_sink(sink.clone() as Arc<dyn TraceSink>);
            }

            let outcome = orchestrator.run_pipeline(&query).await;

            drop(orchestrator);
            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            match outcome {
                Ok(result) => emit(out.as_deref(), &result)?,
                Err(failure) => {
                    let body = json!({
                        "sessionId": failure.session_id,
                        "error": failure.error.code(),
                        "status": failure.error.status_code(),
                        "retryable": failure.error.is_retryable(),
                        "message": failure.error.to_string(),
                        "trace": failure.trace,
                    });
                    emit(out.as_deref(), &body)?;
                    return Err(failure.into());
                }
            }
        }
        Commands::Check { question } => {
            let gatekeeper = Gatekeeper::new(&config.gatekeeper)?;
            let decision = gatekeeper.evaluate(&question, &[]);
            emit(None, &decision)?;
        }
        Commands::Sessions { tenant, db, limit } => {
            let store = SqliteSessionStore::new(db.unwrap_or_else(SqliteSessionStore::default_path))?;
            let sessions = store.list_recent(&tenant, limit).await?;
            emit(None, &sessions)?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}

fn emit<T: serde::Serialize>(path: Option<&Path>, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => {
            std::fs::write(path, json)?;
            eprintln!("[opsense] result written to {}", path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{json}")?;
        }
    }
    Ok(())
}

fn read_attachment(path: &Path) -> Result<Attachment, io::Error> {
    let data = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Attachment::new(filename, mime_for_path(path), data))
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}
