use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(version, about = "Push a spec through ordered quality gates")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit log events as JSON on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Attempts per gate. Overrides gauntlet.toml and GAUNTLET_MAX_RETRIES.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run for a spec and drive it through the gates
    Start {
        /// Path to the spec, relative to the project directory
        spec: String,
    },
    /// Continue a run from its last persisted state
    Resume { run_id: String },
    /// Show one run, or list all runs
    Status { run_id: Option<String> },
    /// Cancel a run between gates
    Cancel { run_id: String },
    /// Mark an escalated run as fixed so `resume` retries the gate
    Remediate {
        run_id: String,
        /// What the operator changed
        #[arg(short, long, default_value = "remediated by operator")]
        note: String,
    },
    /// List the gate table in execution order
    Gates,
    /// Inspect the invariant registry
    Invariants {
        #[command(subcommand)]
        command: Option<InvariantsCommands>,
    },
    /// Submit an operator learning to the promotion engine
    Learn {
        observation: String,

        #[arg(short, long, default_value = "0.8")]
        confidence: f64,

        /// Gate the learning was observed in
        #[arg(short, long, default_value = "operator")]
        gate: String,

        /// Gate id the invariant applies to, or "global"
        #[arg(short, long, default_value = "global")]
        scope: String,

        /// Regex the spec must not match once this is an invariant
        #[arg(long)]
        forbid: Option<String>,

        /// Promote regardless of confidence
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum InvariantsCommands {
    /// List all invariants
    List,
    /// Show one invariant with its version history
    Show { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = gauntlet::config::GauntletConfig::new(project_dir)?.with_max_retries(cli.max_retries);

    let _guard = gauntlet::telemetry::init(
        &gauntlet::telemetry::TelemetryOptions {
            verbose: cli.verbose,
            json: cli.log_json,
        },
        Some(&config.log_dir()),
    );

    match &cli.command {
        Commands::Start { spec } => cmd::cmd_start(&config, spec).await,
        Commands::Resume { run_id } => cmd::cmd_resume(&config, run_id).await,
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id.as_deref()),
        Commands::Cancel { run_id } => cmd::cmd_cancel(&config, run_id),
        Commands::Remediate { run_id, note } => cmd::cmd_remediate(&config, run_id, note),
        Commands::Gates => cmd::cmd_gates(&config),
        Commands::Invariants { command } => cmd::cmd_invariants(&config, command.clone()),
        Commands::Learn {
            observation,
            confidence,
            gate,
            scope,
            forbid,
            force,
        } => cmd::cmd_learn(
            &config,
            observation,
            *confidence,
            gate,
            scope,
            forbid.as_deref(),
            *force,
        ),
        Commands::Config { command } => cmd::cmd_config(&config, command.clone()),
    }
}
