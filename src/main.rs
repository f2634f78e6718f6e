use anyhow::Result;
use clap::{Parser, Subcommand};
use slotflow::config::SlotflowConfig;
use slotflow::telemetry::{self, LogFormat};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "slotflow")]
#[command(version, about = "Resumable, checkpointed pipeline orchestrator for slot game generation")]
pub struct Cli {
    /// Show worker output and state transitions
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Approve every review gate automatically
    #[arg(long, global = true)]
    pub yes: bool,

    /// State directory (defaults to $SLOTFLOW_STATE_DIR, then ./.slotflow)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Format of log lines written to stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a game run and follow it in the foreground
    Start {
        /// Game theme handed to every stage
        #[arg(short, long)]
        theme: String,
        /// Target jurisdiction (repeatable)
        #[arg(short, long = "jurisdiction", required = true)]
        jurisdictions: Vec<String>,
        /// Wait for a decision at each review gate
        #[arg(short, long)]
        interactive: bool,
    },
    /// Research one jurisdiction into the knowledge cache
    Recon { jurisdiction: String },
    /// Re-attach every unfinished run and drive it to the end
    ///
    /// Resumed runs progress concurrently but are followed one run at a time,
    /// in the order they were resumed. A review gate on a later run is
    /// prompted once every run before it has finished.
    Resume,
    /// List known runs
    List,
    /// Show a run's record
    Status { run_id: String },
    /// Print a run's event log
    Events {
        run_id: String,
        /// Print raw JSON records
        #[arg(long)]
        json: bool,
    },
    /// Delete finished runs past the retention window
    Purge {
        /// Override the configured retention window
        #[arg(long)]
        older_than_days: Option<u64>,
    },
    /// Inspect the jurisdiction knowledge cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum CacheCommands {
    /// List the latest entry per jurisdiction
    List,
    /// Show the latest entry for a jurisdiction
    Show {
        jurisdiction: String,
        /// Also list superseded entries
        #[arg(long)]
        history: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default slotflow.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = SlotflowConfig::with_cli_args(cli.state_dir.clone(), cli.verbose, cli.yes)?;
    let _log_guard = telemetry::init_logging(&config.log_dir(), cli.log_format, cli.verbose)?;

    match &cli.command {
        Commands::Start {
            theme,
            jurisdictions,
            interactive,
        } => cmd::cmd_start(config, theme, jurisdictions, *interactive).await?,
        Commands::Recon { jurisdiction } => cmd::cmd_recon(config, jurisdiction).await?,
        Commands::Resume => cmd::cmd_resume(config).await?,
        Commands::List => cmd::cmd_list(&config)?,
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id)?,
        Commands::Events { run_id, json } => cmd::cmd_events(&config, run_id, *json)?,
        Commands::Purge { older_than_days } => cmd::cmd_purge(config, *older_than_days)?,
        Commands::Cache { command } => cmd::cmd_cache(&config, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
