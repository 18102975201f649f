//! Typed error hierarchy for the scheduler.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `SchedulerError`: fatal graph/plan construction defects
//! - `StageError`: a single failed attempt of one stage
//! - `ConfigError`: configuration file loading and parsing

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::stage::StageIndex;

/// Errors raised while building a dependency graph or an execution plan.
///
/// These indicate a construction defect (bad rule table, bad explicit
/// dependency list) and are surfaced to the caller before any stage runs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Dependency cycle detected involving stages {stages:?}")]
    DependencyCycle { stages: Vec<StageIndex> },

    #[error("Planner made no progress; stages {remaining:?} have unsatisfiable dependencies")]
    UnsatisfiableDependencies { remaining: Vec<StageIndex> },

    #[error("Stage {stage} depends on unknown stage {dependency}")]
    UnknownDependency {
        stage: StageIndex,
        dependency: StageIndex,
    },

    #[error("Stage {stage} depends on itself")]
    SelfDependency { stage: StageIndex },

    #[error("Invalid dependency rule pattern '{pattern}': {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of one failed stage attempt, before recovery is consulted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("stage timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("{0}")]
    Cancelled(String),
}

impl StageError {
    /// Human-readable message used for classification and for the result's `error` field.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Errors from loading or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("Invalid value '{value}' for {key}: {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_error_cycle_lists_stages() {
        let err = SchedulerError::DependencyCycle {
            stages: vec![1, 2],
        };
        match &err {
            SchedulerError::DependencyCycle { stages } => assert_eq!(stages, &vec![1, 2]),
            _ => panic!("Expected DependencyCycle"),
        }
        assert!(err.to_string().contains("[1, 2]"));
    }

    #[test]
    fn scheduler_error_invalid_rule_carries_pattern() {
        let source = regex::Regex::new("(unclosed").unwrap_err();
        let err = SchedulerError::InvalidRule {
            pattern: "(unclosed".into(),
            source,
        };
        assert!(err.to_string().contains("(unclosed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn stage_error_timeout_message_mentions_timeout() {
        let err = StageError::TimedOut(Duration::from_secs(120));
        let msg = err.message();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("120"));
    }

    #[test]
    fn stage_error_failed_is_passthrough() {
        let err = StageError::Failed("429 rate limit".into());
        assert_eq!(err.message(), "429 rate limit");
    }

    #[test]
    fn config_error_invalid_value_is_descriptive() {
        let err = ConfigError::InvalidValue {
            key: "failure_handling".into(),
            value: "explode".into(),
            message: "expected abort, continue or retry".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("failure_handling"));
        assert!(msg.contains("explode"));
    }

    #[test]
    fn scheduler_error_converts_from_anyhow() {
        let err: SchedulerError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, SchedulerError::Other(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SchedulerError::SelfDependency { stage: 0 });
        assert_std_error(&StageError::Cancelled("stopped".into()));
        assert_std_error(&ConfigError::Other(anyhow::anyhow!("x")));
    }
}
