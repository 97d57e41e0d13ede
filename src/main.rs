use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowrun_core::config::AppConfig;
use flowrun_core::traits::{ApprovalStore, ExecutionStore, Notifier, ProgressObserver};
use flowrun_core::types::{ApprovalDecision, ExecutionId, ProgressEvent};
use flowrun_core::WorkflowDefinition;

use flowrun_clients::{create_oracle, HttpAgentClient, WebhookNotifier};
use flowrun_engine::{Collaborators, StaticProfiles, WorkflowExecutor};
use flowrun_store::SqliteStore;

#[derive(Parser)]
#[command(name = "flowrun", version, about = "Run agent workflow graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowrun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition (JSON or TOML)
    Run {
        workflow: PathBuf,
        /// Input value as JSON; plain text is taken as a string, `-` reads stdin
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Check a workflow definition without running it
    Validate { workflow: PathBuf },
    /// Continue an interrupted execution from its checkpoint
    Resume { execution_id: String },
    /// Show an execution record, or the most recent ones
    Status {
        execution_id: Option<String>,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// List pending approval requests
    Approvals,
    /// Approve a pending request
    Approve {
        /// Approval id or unique prefix
        id: String,
        /// Replacement data as JSON
        #[arg(long)]
        data: Option<String>,
    },
    /// Reject a pending request
    Reject {
        /// Approval id or unique prefix
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowrun=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "flowrun", &mut io::stdout());
            Ok(())
        }
        Commands::Validate { workflow } => {
            let wf = WorkflowDefinition::load(&workflow)?;
            let start = wf.start()?;
            println!(
                "{} ({}): {} nodes, {} edges, starts at '{}'",
                wf.name,
                wf.id,
                wf.nodes.len(),
                wf.edges.len(),
                start.id
            );
            Ok(())
        }
        command => {
            let config = load_config(&cli.config)?;
            run_command(command, config).await
        }
    }
}

async fn run_command(command: Commands, config: AppConfig) -> anyhow::Result<()> {
    let db_path = config.store_path();
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening store at {}", db_path.display()))?,
    );

    match command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run { workflow, input } => {
            let wf = WorkflowDefinition::load(&workflow)?;
            let input = parse_input(input.as_deref())?;
            let executor = build_executor(&config, store);
            let cancel = cancel_on_ctrl_c();

            let outcome = executor.run_until_cancelled(&wf, input, cancel).await?;
            info!(execution_id = %outcome.execution_id, "Execution finished");
            print_value(&outcome.output);
        }
        Commands::Resume { execution_id } => {
            let executor = build_executor(&config, store);
            let outcome = executor
                .resume_until_cancelled(&execution_id, cancel_on_ctrl_c())
                .await?;
            print_value(&outcome.output);
        }
        Commands::Status { execution_id, limit } => match execution_id {
            Some(id) => {
                let record = ExecutionStore::get(store.as_ref(), &ExecutionId::from_str(&id))
                    .await?
                    .with_context(|| format!("no execution {}", id))?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            None => {
                let records = store.recent_executions(limit)?;
                if records.is_empty() {
                    println!("No executions yet.");
                }
                for r in records {
                    println!(
                        "{}  {:<9}  {}  {}",
                        r.id,
                        r.status.as_str(),
                        r.started_at.format("%Y-%m-%d %H:%M:%S"),
                        r.workflow_name
                    );
                }
            }
        },
        Commands::Approvals => {
            let pending = store.list_pending().await?;
            if pending.is_empty() {
                println!("No pending approvals.");
            }
            for req in pending {
                println!(
                    "{}  execution {}  node {}  {}",
                    &req.id[..8.min(req.id.len())],
                    req.execution_id,
                    req.node_id,
                    req.message.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Approve { id, data } => {
            let id = resolve_approval(&store, &id)?;
            let reviewed_data = data
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .context("--data must be valid JSON")?;
            if !store
                .resolve(&id, ApprovalDecision::Approved { reviewed_data })
                .await?
            {
                bail!("approval {} is not pending", id);
            }
            println!("Approved {}", id);
        }
        Commands::Reject { id, reason } => {
            let id = resolve_approval(&store, &id)?;
            if !store
                .resolve(&id, ApprovalDecision::Rejected { reason })
                .await?
            {
                bail!("approval {} is not pending", id);
            }
            println!("Rejected {}", id);
        }
        Commands::Validate { .. } | Commands::Completions { .. } => {
            unreachable!("handled before config load")
        }
    }
    Ok(())
}

fn build_executor(config: &AppConfig, store: Arc<SqliteStore>) -> WorkflowExecutor {
    let observer: Arc<dyn ProgressObserver> = Arc::new(|event: &ProgressEvent| {
        eprintln!("  [{}] {}", event.node_id, describe(event));
    });
    let notifier = config
        .notify
        .as_ref()
        .map(|n| Arc::new(WebhookNotifier::new(n)) as Arc<dyn Notifier>);

    WorkflowExecutor::new(
        config,
        Collaborators {
            agents: Arc::new(HttpAgentClient::new(&config.agent_client)),
            executions: store.clone(),
            approvals: store.clone(),
            profiles: Arc::new(StaticProfiles::new(config.agents.clone())),
            oracle: config.oracle.as_ref().map(create_oracle),
            checkpoints: Some(store),
            notifier,
            observer,
        },
    )
}

fn describe(event: &ProgressEvent) -> String {
    let status = serde_json::to_value(event.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    if event.detail.is_empty() {
        status
    } else {
        format!("{} {}", status, Value::Object(event.detail.clone()))
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution");
            token.cancel();
        }
    });
    cancel
}

fn parse_input(raw: Option<&str>) -> anyhow::Result<Value> {
    let text = match raw {
        None => return Ok(Value::Null),
        Some("-") => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
        Some(text) => text.to_string(),
    };
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

fn print_value(value: &Value) {
    match value {
        Value::String(s) => println!("{}", s),
        other => println!(
            "{}",
            serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
        ),
    }
}

fn resolve_approval(store: &SqliteStore, id: &str) -> anyhow::Result<String> {
    store
        .find_approval(id)?
        .with_context(|| format!("no approval matching '{}'", id))
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".flowrun").join("config.toml"));
    match home_config {
        Some(ref p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(p)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
