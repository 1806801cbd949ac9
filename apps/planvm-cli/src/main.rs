mod exit_codes;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use planvm_config::{Config, ModelEndpoint, StoreBackend};
use planvm_core::error::ErrorKind;
use planvm_core::store::{CommitStore, TaskStatus};
use planvm_core::tools::Namespace;
use planvm_core::types::ResponseFormat;
use planvm_engine::{Engine, EngineConfig};
use planvm_llm::{ClientTextGenerator, HttpLlmClient, HttpLlmClientConfig, LlmClient, LlmPlanner};
use planvm_stores::{FsStore, PostgresStore};
use planvm_tools::{base_registry, RetrievalConfig};

#[derive(Debug, Parser)]
#[command(name = "planvm", about = "Plan execution engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a goal to completion and print the final answer.
    Execute(ExecuteArgs),
    /// Manage tool namespaces.
    Namespace {
        #[command(subcommand)]
        command: NamespaceCommand,
    },
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[arg(long)]
    goal: String,
    /// Response-format options as JSON, e.g. '{"lang": "en"}'.
    #[arg(long)]
    response_format: Option<String>,
    #[arg(long)]
    namespace: Option<String>,
}

#[derive(Debug, Subcommand)]
enum NamespaceCommand {
    Create(NamespaceArgs),
    Update(NamespaceArgs),
    Delete { name: String },
    List,
    Show { name: String },
}

#[derive(Debug, Args)]
struct NamespaceArgs {
    name: String,
    #[arg(long = "allowed-tools", num_args = 1..)]
    allowed_tools: Vec<String>,
    #[arg(long)]
    description: Option<String>,
}

fn llm_client(endpoint: &ModelEndpoint, timeout_secs: u64) -> anyhow::Result<Arc<dyn LlmClient>> {
    Ok(Arc::new(HttpLlmClient::new(HttpLlmClientConfig {
        endpoint: endpoint.chat_url(),
        api_key: endpoint.api_key.clone(),
        model: endpoint.model.clone(),
        temperature: endpoint.temperature,
        timeout_secs,
    })?))
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn CommitStore>> {
    Ok(match &config.store {
        StoreBackend::Filesystem(root) => Arc::new(FsStore::new(root.clone())?),
        StoreBackend::Postgres(uri) => Arc::new(PostgresStore::connect(uri).await?),
    })
}

async fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let store = open_store(config).await?;
    let standard = llm_client(&config.standard, config.tool_call_timeout_secs)?;
    let reasoning = llm_client(&config.reasoning, config.tool_call_timeout_secs)?;

    let mut retrieval = RetrievalConfig::new(config.autoflow_base_url.clone());
    retrieval.api_key = config.autoflow_api_key.clone();
    retrieval.kb_id = config.kb_id.clone();

    Ok(Engine::new(
        store,
        Arc::new(base_registry(
            Arc::new(ClientTextGenerator::new(standard)),
            retrieval,
        )),
        Arc::new(LlmPlanner::new(reasoning.clone())),
        Arc::new(ClientTextGenerator::new(reasoning)),
        EngineConfig {
            max_recovery_attempts: config.max_recovery_attempts,
            max_validation_retries: config.max_validation_retries,
            tool_call_timeout: std::time::Duration::from_secs(config.tool_call_timeout_secs),
        },
    ))
}

async fn run_execute(config: &Config, args: ExecuteArgs) -> anyhow::Result<i32> {
    let response_format: ResponseFormat = match &args.response_format {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(format) => format,
            Err(e) => {
                eprintln!("invalid --response-format: {}", e);
                return Ok(exit_codes::VALIDATION_FAILURE);
            }
        },
        None => ResponseFormat::default(),
    };

    let engine = build_engine(config).await?;
    let task = engine
        .create_task(args.goal, args.namespace, response_format)
        .await?;
    println!("task_id: {}", task.task_id);

    // Ctrl-C flips the cancellation signal; the engine polls it before each
    // instruction and writes a terminal Manual commit.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested");
            signal_token.cancel();
        }
    });

    let outcome = engine.execute_task(task.task_id, cancel).await?;
    match outcome.status {
        TaskStatus::Completed => {
            match outcome.final_answer {
                Some(serde_json::Value::String(text)) => println!("{}", text),
                Some(value) => println!("{}", value),
                None => println!("(no final answer)"),
            }
            Ok(exit_codes::OK)
        }
        TaskStatus::Cancelled => {
            eprintln!("task cancelled");
            Ok(exit_codes::CANCELLED)
        }
        _ => {
            let code = match &outcome.error {
                Some(error) => {
                    eprintln!("task failed: {}", error);
                    if error.kind == ErrorKind::Validation {
                        exit_codes::VALIDATION_FAILURE
                    } else {
                        exit_codes::ENGINE_ERROR
                    }
                }
                None => {
                    eprintln!("task failed");
                    exit_codes::ENGINE_ERROR
                }
            };
            Ok(code)
        }
    }
}

async fn run_namespace(config: &Config, command: NamespaceCommand) -> anyhow::Result<i32> {
    let store = open_store(config).await?;
    match command {
        NamespaceCommand::Create(args) | NamespaceCommand::Update(args) => {
            if args.allowed_tools.is_empty() {
                eprintln!("--allowed-tools requires at least one tool name");
                return Ok(exit_codes::VALIDATION_FAILURE);
            }
            let mut namespace = Namespace::new(args.name, args.allowed_tools);
            if let Some(description) = args.description {
                namespace.description = description;
            }
            store.save_namespace(&namespace).await?;
            println!("saved namespace '{}'", namespace.name);
        }
        NamespaceCommand::Delete { name } => {
            if store.delete_namespace(&name).await? {
                println!("deleted namespace '{}'", name);
            } else {
                eprintln!("namespace '{}' not found", name);
                return Ok(exit_codes::VALIDATION_FAILURE);
            }
        }
        NamespaceCommand::List => {
            for namespace in store.list_namespaces().await? {
                println!("{}\t{}", namespace.name, namespace.allowed_tools.join(","));
            }
        }
        NamespaceCommand::Show { name } => match store.get_namespace(&name).await? {
            Some(namespace) => {
                println!("{}", serde_json::to_string_pretty(&namespace)?);
            }
            None => {
                eprintln!("namespace '{}' not found", name);
                return Ok(exit_codes::VALIDATION_FAILURE);
            }
        },
    }
    Ok(exit_codes::OK)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(exit_codes::VALIDATION_FAILURE as u8);
        }
    };

    let result = match cli.command {
        Command::Execute(args) => run_execute(&config, args).await,
        Command::Namespace { command } => run_namespace(&config, command).await,
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_codes::ENGINE_ERROR as u8)
        }
    }
}
