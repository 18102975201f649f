use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use stagehand::observability::{self, ObservabilityConfig};
use stagehand::ui::UiMode;

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Dependency-aware parallel stage scheduler")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file. Defaults to ./stagehand.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,

    /// Override processing.max_concurrent_stages
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Stage names, from arguments or a file with one name per line.
#[derive(Args, Clone, Debug)]
pub struct StageInput {
    /// Stage names in declaration order
    pub stages: Vec<String>,

    /// Read stage names from a file (blank lines and `#` comments ignored)
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Infer the dependency graph for a stage list
    Analyze {
        #[command(flatten)]
        input: StageInput,
    },
    /// Partition a stage list into execution phases
    Plan {
        #[command(flatten)]
        input: StageInput,
    },
    /// Run a stage list against a simulated executor
    Simulate {
        #[command(flatten)]
        input: StageInput,

        /// Text handed to every stage
        #[arg(long, default_value = "sample case")]
        input_text: String,

        /// Simulated latency of every attempt
        #[arg(long, default_value = "50")]
        latency_ms: u64,

        /// Stage index that always fails (repeatable)
        #[arg(long)]
        fail: Vec<usize>,

        /// Stage index whose first response cannot be decoded (repeatable)
        #[arg(long)]
        flaky: Vec<usize>,

        /// Override processing.retry_attempts
        #[arg(long)]
        retry_attempts: Option<u32>,

        /// Override processing.failure_handling: abort, continue, retry
        #[arg(long)]
        failure_handling: Option<String>,

        /// UI output mode
        #[arg(long, value_enum, default_value = "full")]
        ui: UiMode,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default stagehand.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init(ObservabilityConfig::for_cli(cli.verbose))?;

    match &cli.command {
        Commands::Analyze { input } => cmd::cmd_analyze(&cli, input)?,
        Commands::Plan { input } => cmd::cmd_plan(&cli, input)?,
        Commands::Simulate {
            input,
            input_text,
            latency_ms,
            fail,
            flaky,
            retry_attempts,
            failure_handling,
            ui,
        } => {
            let options = cmd::SimulateOptions {
                input_text: input_text.clone(),
                latency_ms: *latency_ms,
                fail: fail.clone(),
                flaky: flaky.clone(),
                retry_attempts: *retry_attempts,
                failure_handling: failure_handling.clone(),
                ui: *ui,
            };
            cmd::cmd_simulate(&cli, input, options).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
