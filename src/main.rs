use sqlgov::db::{HistorySink, LogHistory, SqliteHistory};
use sqlgov::execution::PostgresExecutor;
use sqlgov::intent::IntentClassifier;
use sqlgov::llm::{BoundedCompletion, CompletionEngine, OpenAiCompletion};
use sqlgov::question::{ExecutionPreferences, ExplanationStyle, Question};
use sqlgov::schema_context::{CachedSchemaProvider, SchemaContextProvider, StaticSchemaProvider};
use sqlgov::security::{QueryValidator, Role, UserContext, ValidationLevel, ValidatorPolicy};
use sqlgov::{Orchestrator, PipelineConfig, ResponseEnvelope};

use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqlgov")]
#[command(about = "Governed natural-language to SQL: generate, validate, repair, execute and explain")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs)]
struct Caller {
    /// Caller id recorded with the run
    #[arg(long, default_value = "cli")]
    user: String,

    /// Caller role (public, analyst, finance, admin)
    #[arg(long, default_value = "analyst")]
    role: String,

    /// Region the caller is restricted to
    #[arg(long)]
    region: Option<String>,

    /// Tables the caller may read (repeatable; default: all)
    #[arg(long = "table")]
    tables: Vec<String>,

    /// Extra permissions (repeatable)
    #[arg(long = "permission")]
    permissions: Vec<String>,

    /// Validation level override (strict, moderate, relaxed, admin)
    #[arg(long)]
    level: Option<String>,
}

impl Caller {
    fn context(&self) -> Result<UserContext> {
        let mut user = UserContext::new(self.user.clone(), Role::parse(&self.role));
        if let Some(region) = &self.region {
            user = user.with_region(region.clone());
        }
        if !self.tables.is_empty() {
            user = user.with_allowed_tables(self.tables.iter().cloned());
        }
        for permission in &self.permissions {
            user = user.with_permission(permission.clone());
        }
        if let Some(level) = &self.level {
            user = user.with_trust_tier(level.parse::<ValidationLevel>()?);
        }
        Ok(user)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Table,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question against the database
    Ask {
        /// The question in natural language
        question: String,

        /// Schema snapshot (JSON)
        #[arg(short, long, default_value = "schema.json")]
        schema: PathBuf,

        /// Validator policy (JSON; default: built-in policy)
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Explanation style (concise, detailed, technical)
        #[arg(long, default_value = "concise")]
        style: String,

        /// Row limit for this question
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,

        #[command(flatten)]
        caller: Caller,
    },
    /// Validate a SQL query without running it
    Validate {
        sql: String,

        #[arg(short, long)]
        policy: Option<PathBuf>,

        #[command(flatten)]
        caller: Caller,
    },
    /// Show how a question would be routed
    Classify {
        question: String,
    },
    /// Summarize recorded runs
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sqlgov=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = PipelineConfig::from_env()?;

    match args.command {
        Commands::Ask {
            question,
            schema,
            policy,
            style,
            limit,
            format,
            caller,
        } => run_ask(config, question, schema, policy, style, limit, format, caller).await,
        Commands::Validate { sql, policy, caller } => run_validate(&config, sql, policy, caller),
        Commands::Classify { question } => run_classify(&config, question).await,
        Commands::History { limit } => run_history(&config, limit),
    }
}

fn load_policy(path: Option<PathBuf>) -> Result<ValidatorPolicy> {
    Ok(match path {
        Some(path) => ValidatorPolicy::from_file(&path)?,
        None => ValidatorPolicy::default(),
    })
}

fn completion_engine(config: &PipelineConfig) -> Result<Arc<dyn CompletionEngine>> {
    let api_key = config
        .llm
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
    Ok(Arc::new(OpenAiCompletion::new(
        api_key,
        config.llm.model.clone(),
        config.llm.base_url.clone(),
    )))
}

#[allow(clippy::too_many_arguments)]
async fn run_ask(
    config: PipelineConfig,
    text: String,
    schema_path: PathBuf,
    policy: Option<PathBuf>,
    style: String,
    limit: Option<usize>,
    format: OutputFormat,
    caller: Caller,
) -> Result<()> {
    let policy = load_policy(policy)?;
    let engine = completion_engine(&config)?;

    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
    let executor = PostgresExecutor::connect(&database_url, 5).await?;

    let snapshot = StaticSchemaProvider::from_file(&schema_path)
        .with_context(|| format!("loading schema {}", schema_path.display()))?;
    let schema: Arc<dyn SchemaContextProvider> =
        Arc::new(CachedSchemaProvider::new(Arc::new(snapshot), config.schema_cache_ttl));

    let (history, exemplars) = match &config.history_db_path {
        Some(path) => {
            let store = SqliteHistory::open(path)?;
            let exemplars = store.recent_exemplars(config.max_exemplars * 4)?;
            info!("Loaded {} exemplars from {}", exemplars.len(), path.display());
            (Arc::new(store) as Arc<dyn HistorySink>, exemplars)
        }
        None => (Arc::new(LogHistory) as Arc<dyn HistorySink>, Vec::new()),
    };

    let orchestrator = Orchestrator::new(config, policy, engine, schema, Arc::new(executor))
        .with_history(history)
        .with_exemplars(exemplars);

    let question = Question::new(text)?
        .with_user(caller.context()?)
        .with_preferences(ExecutionPreferences {
            explanation_style: ExplanationStyle::parse(&style),
            row_limit: limit,
        })?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️  Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let envelope = orchestrator.process(question, &cancel).await;
    print_envelope(&envelope, format)?;

    // Give the history write a moment before the runtime shuts down.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}

fn print_envelope(envelope: &ResponseEnvelope, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(envelope)?),
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record(&envelope.columns)?;
            for row in &envelope.rows {
                writer.write_record(envelope.columns.iter().map(|c| cell(row.get(c))))?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            println!("\n=== {} ===", envelope.status);
            println!("{}", envelope.message);
            if let Some(sql) = &envelope.final_query {
                println!("\nSQL:\n  {}", sql);
            }
            if !envelope.columns.is_empty() {
                println!("\n{}", envelope.columns.join(" | "));
                for row in &envelope.rows {
                    let cells: Vec<String> = envelope.columns.iter().map(|c| cell(row.get(c))).collect();
                    println!("{}", cells.join(" | "));
                }
                println!(
                    "({} row{}{})",
                    envelope.row_count,
                    if envelope.row_count == 1 { "" } else { "s" },
                    if envelope.truncated { ", truncated" } else { "" }
                );
            }
            if let Some(explanation) = &envelope.explanation {
                println!("\n{}", explanation.text);
                for recommendation in &explanation.recommendations {
                    println!("  - {}", recommendation);
                }
            }
            if envelope.retry_count > 0 {
                println!("\nRepairs: {}", envelope.retry_count);
            }
        }
    }
    Ok(())
}

fn cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn run_validate(config: &PipelineConfig, sql: String, policy: Option<PathBuf>, caller: Caller) -> Result<()> {
    let mut policy = load_policy(policy)?;
    if let Some(ceiling) = config.cost_ceiling {
        policy = policy.with_cost_ceiling(ceiling);
    }
    let user = caller.context()?;
    let level = user.trust_tier.unwrap_or(config.default_validation_level);

    let verdict = QueryValidator::new(policy).validate_sql(&sql, &user, level);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if !verdict.is_valid {
        std::process::exit(2);
    }
    Ok(())
}

async fn run_classify(config: &PipelineConfig, text: String) -> Result<()> {
    let engine: Arc<dyn CompletionEngine> = Arc::new(BoundedCompletion::new(
        completion_engine(config)?,
        config.max_concurrent_completions,
        config.completion_timeout,
    ));
    let decision = IntentClassifier::new(engine).classify(&Question::new(text)?).await;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn run_history(config: &PipelineConfig, limit: usize) -> Result<()> {
    let path = config
        .history_db_path
        .as_ref()
        .ok_or_else(|| anyhow!("HISTORY_DB_PATH is not set"))?;
    let store = SqliteHistory::open(path)?;

    let stats = store.stats()?;
    println!(
        "{} runs, {:.0} ms average, {:.2} repairs average",
        stats.total_runs, stats.average_ms, stats.average_retries
    );
    for (status, count) in &stats.by_status {
        println!("  {:<18} {}", status, count);
    }
    println!();
    for entry in store.recent(limit)? {
        println!(
            "{}  {:<18} {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.status,
            entry.question
        );
    }
    Ok(())
}
