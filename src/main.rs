use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forge_exec::forge_config::ForgeConfig;
use forge_exec::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-exec")]
#[command(version, about = "Validate task plans, track phase state and run plans through an agent")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a plan, the phase template and the plan's state if present
    Validate { plan_id: String },
    /// Create the initial state for a plan
    Init {
        plan_id: String,
        /// Overwrite an existing state
        #[arg(long)]
        force: bool,
    },
    /// Show task and phase progress
    Status { plan_id: String },
    /// Print the next runnable task and phase
    Next { plan_id: String },
    /// Truncate over-long notes in the stored state
    Normalize { plan_id: String },
    /// Run the checks of one phase
    Check {
        plan_id: String,
        task_id: String,
        phase_id: String,
    },
    /// Run the plan's phases with the configured agent until done or paused
    Run { plan_id: String },
    /// List plans under the plans directory, newest first
    Plans,
    /// Remove state and generated progress files (the plan is kept)
    Clean { plan_id: String },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default forge.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = ForgeConfig::with_cli_args(project_dir, cli.verbose)?;

    match cli.command {
        Commands::Validate { plan_id } => cmd::cmd_validate(&config, &plan_id)?,
        Commands::Init { plan_id, force } => cmd::cmd_init(&config, &plan_id, force)?,
        Commands::Status { plan_id } => cmd::cmd_status(&config, &plan_id)?,
        Commands::Next { plan_id } => cmd::cmd_next(&config, &plan_id)?,
        Commands::Normalize { plan_id } => cmd::cmd_normalize(&config, &plan_id)?,
        Commands::Check {
            plan_id,
            task_id,
            phase_id,
        } => cmd::cmd_check(&config, &plan_id, &task_id, &phase_id).await?,
        Commands::Run { plan_id } => cmd::cmd_run(&config, &plan_id).await?,
        Commands::Plans => cmd::cmd_plans(&config)?,
        Commands::Clean { plan_id } => cmd::cmd_clean(&config, &plan_id)?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
