//! Configuration view and validation commands - `stagehand config`.

use anyhow::{Context, Result};

use super::{config_path, load_config};
use crate::{Cli, ConfigCommands};
use stagehand::config::StagehandToml;

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(cli)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = load_config(cli)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }

            println!();
            println!("Stagehand Configuration");
            println!("=======================");
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No config file at {}; using defaults", path.display());
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let config = load_config(cli)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for w in &warnings {
                    println!("  - {}", w);
                }
            }
            // A bad [[rules]] pattern is an error, not a warning
            config.rule_set()?;
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite.",
                    path.display()
                );
            }
            StagehandToml::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}
