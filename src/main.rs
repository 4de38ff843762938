#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

mod output;
mod simulate;

use agent_scheduler::config::load_settings;
use agent_scheduler::error::code as error_code;
use agent_scheduler::{
    AgentExecutionState, AgentState, AgentType, SchedulerDb, SchedulerError, SchedulerSettings,
    StateMachine, SystemClock,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use output::{emit_error, emit_output, OutputFormat};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-scheduler")]
#[command(about = "PostgreSQL-backed scheduling of recurring collection agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: .agent-scheduler/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the agent state table and work queue
    InitDb {
        /// Database URL (defaults to DATABASE_URL, then config)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// List agent state rows, least recently executed first
    Status {
        /// Only show agents in this state (e.g. RUNNING)
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Unschedule an agent by marking it DELETED
    Disable {
        agent_type: String,
    },

    /// Run the control loop and runners in memory against synthetic agents
    Simulate {
        #[arg(short, long, default_value = "6")]
        agents: usize,

        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::InitDb { .. } => "init-db",
            Self::Status { .. } => "status",
            Self::Disable { .. } => "disable",
            Self::Simulate { .. } => "simulate",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = OutputFormat::from_json_flag(cli.json);
    let command = cli.command.name();

    match run(cli, output).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let (code, exit_code) = err
                .downcast_ref::<SchedulerError>()
                .map_or((error_code::INTERNAL, 1), |e| (e.code(), e.exit_code()));
            emit_error(output, command, code, &format!("{err:#}"));
            ExitCode::from(u8::try_from(exit_code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli, output: OutputFormat) -> anyhow::Result<()> {
    let settings = load_settings(cli.config).await?;

    match cli.command {
        Commands::InitDb { url } => {
            let db = connect(&settings, url).await?;
            db.initialize_schema().await?;
            info!("agent scheduler schema initialized");
            emit_output(
                output,
                "init-db",
                &json!({ "message": "Schema initialized" }),
            );
            Ok(())
        }

        Commands::Status { state } => {
            let states = match state {
                Some(name) => vec![AgentExecutionState::try_from(name.to_uppercase().as_str())
                    .map_err(SchedulerError::ConfigError)?],
                None => AgentExecutionState::ALL.to_vec(),
            };
            let db = connect(&settings, None).await?;
            let rows = db.list_agent_states(&states).await?;
            let queued = db.queued_delivery_count().await?;
            match output {
                OutputFormat::Json => emit_output(
                    output,
                    "status",
                    &json!({ "agents": serde_json::to_value(&rows)?, "queued": queued }),
                ),
                OutputFormat::Text => print_rows(&rows, queued),
            }
            Ok(())
        }

        Commands::Disable { agent_type } => {
            let db = connect(&settings, None).await?;
            let state = StateMachine::new(Arc::new(db), Arc::new(SystemClock));
            let agent_type = AgentType::new(agent_type);
            let changed = state.disable(&agent_type).await? > 0;
            let message = if changed {
                format!("Agent {agent_type} marked DELETED")
            } else {
                format!("Agent {agent_type} was already disabled or unknown")
            };
            emit_output(
                output,
                "disable",
                &json!({ "message": message, "agent_type": agent_type, "changed": changed }),
            );
            Ok(())
        }

        Commands::Simulate { agents, seconds } => {
            let rows = simulate::run(&settings, agents, seconds).await?;
            match output {
                OutputFormat::Json => emit_output(
                    output,
                    "simulate",
                    &json!({ "agents": serde_json::to_value(&rows)? }),
                ),
                OutputFormat::Text => print_rows(&rows, 0),
            }
            Ok(())
        }
    }
}

async fn connect(settings: &SchedulerSettings, url: Option<String>) -> anyhow::Result<SchedulerDb> {
    let candidates = url.map_or_else(|| settings.database_url_candidates(), |url| vec![url]);
    let mut last_error = None;
    for candidate in candidates {
        match SchedulerDb::new(&candidate).await {
            Ok(db) => return Ok(db),
            Err(e) => {
                warn!(error = %e, "database candidate unreachable");
                last_error = Some(e);
            }
        }
    }
    Err::<SchedulerDb, _>(last_error
        .unwrap_or_else(|| SchedulerError::ConfigError("No database URL configured".to_string())))
    .context("Failed to connect to any configured database")
}

fn print_rows(rows: &[AgentState], queued: i64) {
    if rows.is_empty() {
        println!("No agents");
    } else {
        println!(
            "{:<32} {:<12} {:>16} {:>10}",
            "AGENT", "STATE", "LAST_DURATION_MS", "ITEMS"
        );
        println!("{}", "-".repeat(73));
        for row in rows {
            let duration = if row.has_completed_run() {
                row.last_duration.to_string()
            } else {
                "-".to_string()
            };
            println!(
                "{:<32} {:<12} {:>16} {:>10}",
                row.agent_type.value().chars().take(32).collect::<String>(),
                row.current_state,
                duration,
                row.data_processed
            );
        }
    }
    if queued > 0 {
        println!("\n{queued} deliveries waiting in the work queue");
    }
}
