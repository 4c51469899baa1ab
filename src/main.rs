use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use conductor::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Supervisor for autonomous coding sessions")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server with the progress WebSocket
    Serve,
    /// Create a session from a spec reference and a feature checklist
    Create {
        /// Specification reference driving the session
        spec: String,
        /// Feature description; repeat for each checklist entry
        #[arg(short, long = "feature")]
        features: Vec<String>,
        /// Opaque work-item reference to persist on the record
        #[arg(long)]
        work_item: Option<String>,
        /// Source-control branch reference to persist on the record
        #[arg(long)]
        branch: Option<String>,
    },
    /// List sessions, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one session's record and checklist
    Status { id: Uuid },
    /// Drive a session in-process until it reaches a terminal state
    Run { id: Uuid },
    /// Request a pause at the session's next safe checkpoint
    Pause { id: Uuid },
    /// Resume a paused session
    Resume { id: Uuid },
    /// Stop a session; in-flight agent work is applied first
    Stop { id: Uuid },
    /// Inspect resolved knowledge
    Knowledge {
        /// Show a single snippet by name
        name: Option<String>,
        /// Show every layer with its tier instead of the flattened view
        #[arg(long)]
        annotated: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "conductor=debug" } else { "conductor=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let config = Config::load(project_dir)?;

    match cli.command {
        Commands::Serve => cmd::cmd_serve(config).await,
        Commands::Create {
            spec,
            features,
            work_item,
            branch,
        } => cmd::cmd_create(config, spec, features, work_item, branch).await,
        Commands::List { status } => cmd::cmd_list(config, status).await,
        Commands::Status { id } => cmd::cmd_status(config, id).await,
        Commands::Run { id } => cmd::cmd_run(config, id).await,
        Commands::Pause { id } => cmd::cmd_pause(config, id).await,
        Commands::Resume { id } => cmd::cmd_resume(config, id).await,
        Commands::Stop { id } => cmd::cmd_stop(config, id).await,
        Commands::Knowledge { name, annotated } => {
            cmd::cmd_knowledge(config, name, annotated).await
        }
    }
}
