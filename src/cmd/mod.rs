//! CLI command implementations.
//!
//! | Module     | Commands handled    |
//! |------------|---------------------|
//! | `analyze`  | `Analyze`, `Plan`   |
//! | `simulate` | `Simulate`          |
//! | `config`   | `Config`            |

pub mod analyze;
pub mod config;
pub mod simulate;

pub use analyze::{cmd_analyze, cmd_plan};
pub use config::cmd_config;
pub use simulate::{SimulateOptions, cmd_simulate};

use std::path::PathBuf;

use anyhow::{Context, Result};
use stagehand::config::{CONFIG_FILE, StagehandToml};

use super::{Cli, StageInput};

/// Config file path: `--config`, else `stagehand.toml` in the working directory.
pub fn config_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(CONFIG_FILE)),
    }
}

/// Effective configuration: file, then environment, then command-line flags.
pub fn load_config(cli: &Cli) -> Result<StagehandToml> {
    let path = config_path(cli)?;
    if cli.config.is_some() && !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    let mut toml = StagehandToml::load_or_default(&path)?;
    toml.apply_env_overrides()?;
    if let Some(n) = cli.max_concurrent {
        toml.processing.max_concurrent_stages = n;
    }
    Ok(toml)
}

pub fn read_stages(input: &StageInput) -> Result<Vec<String>> {
    let mut stages = input.stages.clone();
    if let Some(path) = &input.file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stage file {}", path.display()))?;
        stages.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }
    if stages.is_empty() {
        anyhow::bail!("No stages given. Pass stage names as arguments or use --file.");
    }
    Ok(stages)
}
