//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries call [`init`] once.
//! `RUST_LOG` directives are honoured on top of the configured level.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Maximum level for this crate's events.
    pub level: Level,
    pub target: LogTarget,
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            target: LogTarget::default(),
            json: false,
        }
    }
}

impl ObservabilityConfig {
    /// `WARN` normally, `DEBUG` with `verbose`.
    pub fn for_cli(verbose: bool) -> Self {
        Self {
            level: if verbose { Level::DEBUG } else { Level::WARN },
            target: LogTarget::Stderr,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogTarget {
    /// stdout
    #[default]
    Console,
    /// Keeps stdout clean for command output.
    Stderr,
    File(PathBuf),
}

/// Install the global subscriber. Fails if one is already set.
pub fn init(config: ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(
        format!("stagehand={}", config.level)
            .parse()
            .context("Invalid log directive")?,
    );
    let registry = tracing_subscriber::registry().with(filter);

    match (config.target, config.json) {
        (LogTarget::Console, false) => registry
            .with(fmt::layer().with_writer(std::io::stdout))
            .try_init(),
        (LogTarget::Console, true) => registry
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .try_init(),
        (LogTarget::Stderr, false) => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        (LogTarget::Stderr, true) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (LogTarget::File(path), json) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            if json {
                registry
                    .with(fmt::layer().json().with_ansi(false).with_writer(file))
                    .try_init()
            } else {
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(file))
                    .try_init()
            }
        }
    }
    .context("Failed to install tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_levels() {
        assert_eq!(ObservabilityConfig::for_cli(false).level, Level::WARN);
        assert_eq!(ObservabilityConfig::for_cli(true).level, Level::DEBUG);
        assert_eq!(ObservabilityConfig::for_cli(true).target, LogTarget::Stderr);
    }

    #[test]
    fn test_init_to_file_then_reject_second_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let config = ObservabilityConfig {
            target: LogTarget::File(path.clone()),
            json: true,
            ..ObservabilityConfig::default()
        };
        init(config).unwrap();
        tracing::info!(stage = 0, "hello");
        assert!(path.exists());

        assert!(init(ObservabilityConfig::default()).is_err());
    }
}
