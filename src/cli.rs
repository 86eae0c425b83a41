use crate::agent::records::{RecordStore, SqliteInvocationLog};
use crate::agent::{MediaPreprocessor, Orchestrator, RunOutcome, RunRequest, ToolDispatcher};
use crate::config::{load_config, Config};
use crate::directory::{MemoryDirectory, StoredConversation};
use crate::models::{
    Agent, AgentToolBinding, ConversationKind, ConversationMeta, LastDirection, ToolDefinition,
};
use crate::providers::OpenAiProvider;
use crate::scheduler::IdleScheduler;
use crate::session::FileContextStore;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "concierge")]
#[command(about = "Conversational orchestration core for customer messaging")]
pub struct Cli {
    /// Config file path (defaults to ~/.concierge/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize concierge configuration
    Onboard,
    /// Run one message through the orchestration loop
    Message {
        #[arg(short, long)]
        message: String,
        #[arg(short = 'c', long, default_value = "cli:default")]
        conversation: String,
        #[arg(short, long, default_value = "default")]
        tenant: String,
        #[arg(long, default_value = "cli")]
        inbox: String,
        /// Agent id; omitted means the tenant default
        #[arg(long)]
        agent: Option<String>,
        /// Catalog file with agents, tools, and bindings
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Run the idle-conversation scheduler until interrupted
    Serve {
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Show configuration and store locations
    Status,
}

/// On-disk catalog consumed by the CLI in place of a live admin datastore.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Catalog {
    #[serde(default)]
    agents: Vec<Agent>,
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default)]
    bindings: Vec<AgentToolBinding>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Onboard => onboard(cli.config.clone()),
        Commands::Message {
            message,
            conversation,
            tenant,
            inbox,
            agent,
            catalog,
        } => run_message(&config, message, conversation, tenant, inbox, agent, catalog).await,
        Commands::Serve { catalog } => serve(&config, catalog).await,
        Commands::Status => status(&config),
    }
}

fn onboard(config_path: Option<PathBuf>) -> Result<()> {
    let path = match config_path {
        Some(path) => path,
        None => crate::config::get_config_path()?,
    };
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    let config = Config::default();
    crate::config::save_config(&config, Some(path.as_path()))?;
    println!("Created config at {}", path.display());
    println!("\nNext steps:");
    println!("  1. Add your API key under provider.apiKey");
    println!("  2. Describe agents and tools in catalog.json next to the config");
    println!("  3. Try: concierge message -m \"Hello!\"");
    Ok(())
}

fn load_catalog(path: Option<PathBuf>) -> Result<Catalog> {
    let path = match path {
        Some(path) => path,
        None => crate::utils::get_concierge_home()?.join("catalog.json"),
    };
    if !path.exists() {
        return Ok(Catalog::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read catalog from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse catalog JSON from {}", path.display()))
}

fn build_directory(catalog: Catalog) -> Arc<MemoryDirectory> {
    let directory = Arc::new(MemoryDirectory::new());
    for agent in catalog.agents {
        directory.insert_agent(agent);
    }
    for tool in catalog.tools {
        directory.insert_tool(tool);
    }
    for binding in catalog.bindings {
        directory.insert_binding(binding);
    }
    directory
}

fn build_orchestrator(
    config: &Config,
    directory: Arc<MemoryDirectory>,
) -> Result<Arc<Orchestrator>> {
    let provider = Arc::new(OpenAiProvider::new(
        config.provider.api_key.clone(),
        config.provider.base_url.clone(),
        config.provider.default_model.clone(),
    ));
    let store = Arc::new(FileContextStore::new(config.context_dir()?)?);
    let records = Arc::new(RecordStore::open(config.records_db()?)?);
    let log = Arc::new(SqliteInvocationLog::open(config.records_db()?)?);
    let dispatcher = Arc::new(ToolDispatcher::new(records, log, None, None));
    let media = Arc::new(MediaPreprocessor::new(provider.clone()));

    Ok(Arc::new(Orchestrator::new(
        provider,
        directory.clone(),
        directory,
        store,
        dispatcher,
        Some(media),
    )))
}

async fn run_message(
    config: &Config,
    message: String,
    conversation: String,
    tenant: String,
    inbox: String,
    agent: Option<String>,
    catalog: Option<PathBuf>,
) -> Result<()> {
    let directory = build_directory(load_catalog(catalog)?);
    // The CLI has no inbox backend; register the conversation as a plain
    // direct chat so the gate and scheduler have metadata to read.
    directory.insert_conversation(
        &conversation,
        StoredConversation {
            tenant_id: tenant.clone(),
            inbox_id: inbox.clone(),
            agent_id: agent.clone(),
            agent_controlled: true,
            meta: ConversationMeta {
                kind: ConversationKind::Direct,
                last_direction: LastDirection::Counterpart,
                last_message_at: Utc::now(),
                counterpart_name: None,
            },
            attachment: None,
        },
    );

    let orchestrator = build_orchestrator(config, directory)?;
    let outcome = orchestrator
        .run(RunRequest {
            tenant_id: tenant,
            conversation_id: conversation,
            inbox_id: inbox,
            agent_id: agent,
            text: message,
            context_values: serde_json::Map::new(),
        })
        .await?;

    match outcome {
        RunOutcome::Replied(reply) => {
            println!("{}", reply.reply);
            if let Some(usage) = reply.usage {
                tracing::debug!(
                    "model {} used {} tokens",
                    reply.model,
                    usage.total_tokens
                );
            }
        }
        RunOutcome::Skipped { reason } => {
            println!("(no reply: {})", reason);
        }
    }
    Ok(())
}

async fn serve(config: &Config, catalog: Option<PathBuf>) -> Result<()> {
    let directory = build_directory(load_catalog(catalog)?);
    let orchestrator = build_orchestrator(config, directory.clone())?;
    let scheduler = Arc::new(IdleScheduler::new(
        orchestrator,
        directory,
        config.scheduler.clone(),
    ));

    scheduler.start().await?;
    println!("concierge scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    scheduler.stop().await;
    println!("stopped");
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    println!("concierge v{}", crate::VERSION);
    println!("provider base url: {}", config.provider.base_url);
    println!("default model:     {}", config.provider.default_model);
    println!(
        "api key:           {}",
        if config.provider.api_key.is_empty() {
            "(not set)"
        } else {
            "configured"
        }
    );
    println!("context dir:       {}", config.context_dir()?.display());
    println!("records db:        {}", config.records_db()?.display());
    println!(
        "idle scheduler:    {} (every {}s, {}ms between candidates)",
        if config.scheduler.enabled {
            "enabled"
        } else {
            "disabled"
        },
        config.scheduler.scan_interval_secs,
        config.scheduler.candidate_delay_ms
    );
    Ok(())
}
