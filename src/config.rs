//! Configuration for the scheduler.
//!
//! Two layers:
//! - [`ProcessingConfig`]: the engine options every run needs
//! - [`StagehandToml`]: the `stagehand.toml` file, which wraps the engine
//!   options together with every tunable heuristic
//!
//! Environment variables override the file:
//! `STAGEHAND_MAX_CONCURRENT_STAGES`, `STAGEHAND_RETRY_ATTEMPTS`,
//! `STAGEHAND_TIMEOUT_MS`, `STAGEHAND_FAILURE_HANDLING`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [processing]
//! max_concurrent_stages = 3
//! enable_dynamic_scaling = true
//! failure_handling = "continue"
//! retry_attempts = 2
//! timeout_per_stage_ms = 120000
//!
//! [analyzer]
//! max_group_size = 3
//! use_default_rules = true
//!
//! [planner]
//! high_complexity_cap = 2
//!
//! [resources.limits]
//! max_cpu_usage = 80.0
//!
//! [resources.scaling]
//! hard_shrink_factor = 0.7
//!
//! [progress]
//! alert_dedup_window_secs = 30
//!
//! [[rules]]
//! name_pattern = "summary"
//! depends_on_pattern = "."
//! ```

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dag::{
    DependencyAnalyzer, DependencyRule, ParallelEngine, PlannerSettings, RuleSet, StageExecutor,
    StageVocabulary,
};
use crate::errors::{ConfigError, SchedulerError};
use crate::progress::ProgressSettings;
use crate::resources::{ResourceLimits, ScalingPolicy};
use crate::util::duration_millis;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "stagehand.toml";

/// What the engine does after a stage fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureHandling {
    /// Stop dispatching and skip everything not yet started.
    Abort,
    /// Keep going with the next phase (default).
    #[default]
    Continue,
    /// Same phase-level behavior as `Continue`; retries are bounded per call
    /// by `retry_attempts`.
    Retry,
}

impl std::fmt::Display for FailureHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureHandling::Abort => write!(f, "abort"),
            FailureHandling::Continue => write!(f, "continue"),
            FailureHandling::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for FailureHandling {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(FailureHandling::Abort),
            "continue" => Ok(FailureHandling::Continue),
            "retry" => Ok(FailureHandling::Retry),
            _ => anyhow::bail!(
                "Invalid failure handling '{}'. Valid values: abort, continue, retry",
                s
            ),
        }
    }
}

/// Engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Hard upper bound on stages in flight.
    pub max_concurrent_stages: usize,
    /// Let the resource manager move concurrency within `[1, max_concurrent_stages]`.
    pub enable_dynamic_scaling: bool,
    pub failure_handling: FailureHandling,
    /// Retries after the first attempt; a stage gets `retry_attempts + 1` attempts.
    pub retry_attempts: u32,
    #[serde(rename = "timeout_per_stage_ms", with = "duration_millis")]
    pub timeout_per_stage: Duration,
    pub enable_progress_tracking: bool,
    pub enable_efficiency_monitoring: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 3,
            enable_dynamic_scaling: true,
            failure_handling: FailureHandling::Continue,
            retry_attempts: 2,
            timeout_per_stage: Duration::from_millis(120_000),
            enable_progress_tracking: true,
            enable_efficiency_monitoring: true,
        }
    }
}

impl ProcessingConfig {
    pub fn with_max_concurrent_stages(mut self, n: usize) -> Self {
        self.max_concurrent_stages = n;
        self
    }

    pub fn with_dynamic_scaling(mut self, enabled: bool) -> Self {
        self.enable_dynamic_scaling = enabled;
        self
    }

    pub fn with_failure_handling(mut self, policy: FailureHandling) -> Self {
        self.failure_handling = policy;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_stage = timeout;
        self
    }

    pub fn with_progress_tracking(mut self, enabled: bool) -> Self {
        self.enable_progress_tracking = enabled;
        self
    }

    pub fn with_efficiency_monitoring(mut self, enabled: bool) -> Self {
        self.enable_efficiency_monitoring = enabled;
        self
    }

    /// Effective concurrency bound (never below 1).
    pub fn concurrency_cap(&self) -> usize {
        self.max_concurrent_stages.max(1)
    }
}

/// Dependency analyzer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSection {
    /// Members per parallel sub-group.
    pub max_group_size: usize,
    /// Start from the built-in legal-analysis rule table before adding `[[rules]]`.
    pub use_default_rules: bool,
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            max_group_size: 3,
            use_default_rules: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub limits: ResourceLimits,
    pub scaling: ScalingPolicy,
}

/// Contents of `stagehand.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagehandToml {
    pub processing: ProcessingConfig,
    pub analyzer: AnalyzerSection,
    pub planner: PlannerSettings,
    pub resources: ResourcesSection,
    pub progress: ProgressSettings,
    pub vocabulary: StageVocabulary,
    pub rules: Vec<DependencyRule>,
}

impl StagehandToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).context("Failed to serialize stagehand.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STAGEHAND_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let p = &mut self.processing;
        if let Some(v) = lookup("STAGEHAND_MAX_CONCURRENT_STAGES") {
            p.max_concurrent_stages = parse_value("STAGEHAND_MAX_CONCURRENT_STAGES", &v)?;
        }
        if let Some(v) = lookup("STAGEHAND_RETRY_ATTEMPTS") {
            p.retry_attempts = parse_value("STAGEHAND_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("STAGEHAND_TIMEOUT_MS") {
            p.timeout_per_stage = Duration::from_millis(parse_value("STAGEHAND_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("STAGEHAND_FAILURE_HANDLING") {
            p.failure_handling = v.parse().map_err(|e: anyhow::Error| ConfigError::InvalidValue {
                key: "STAGEHAND_FAILURE_HANDLING".into(),
                value: v.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Rule table: the built-in rules (unless disabled) followed by `[[rules]]`.
    pub fn rule_set(&self) -> Result<RuleSet, SchedulerError> {
        let mut rules = if self.analyzer.use_default_rules {
            RuleSet::legal_analysis()
        } else {
            RuleSet::empty()
        };
        for rule in &self.rules {
            rules.push(rule.clone())?;
        }
        Ok(rules)
    }

    pub fn analyzer(&self) -> Result<DependencyAnalyzer, SchedulerError> {
        Ok(DependencyAnalyzer::new(self.rule_set()?, self.vocabulary.clone())
            .with_max_group_size(self.analyzer.max_group_size))
    }

    /// Engine wired with every section of this file.
    pub fn engine(&self, executor: Arc<dyn StageExecutor>) -> Result<ParallelEngine, SchedulerError> {
        Ok(ParallelEngine::new(executor, self.processing.clone())
            .with_analyzer(self.analyzer()?)
            .with_planner_settings(self.planner.clone())
            .with_resource_limits(self.resources.limits.clone())
            .with_scaling_policy(self.resources.scaling.clone())
            .with_progress_settings(self.progress.clone()))
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let p = &self.processing;

        if p.max_concurrent_stages == 0 {
            warnings.push("processing.max_concurrent_stages is 0; 1 will be used".to_string());
        }
        if p.timeout_per_stage.is_zero() {
            warnings.push("processing.timeout_per_stage_ms is 0; every stage will time out".to_string());
        }
        if p.retry_attempts > 10 {
            warnings.push(format!(
                "processing.retry_attempts is {}; failing stages will be retried for a long time",
                p.retry_attempts
            ));
        }
        if self.analyzer.max_group_size < 2 {
            warnings.push("analyzer.max_group_size below 2 disables parallel groups".to_string());
        }

        let s = &self.resources.scaling;
        if !(s.grow_below < s.soft_shrink_above && s.soft_shrink_above < s.hard_shrink_above) {
            warnings.push(
                "resources.scaling thresholds should satisfy grow_below < soft_shrink_above < hard_shrink_above"
                    .to_string(),
            );
        }
        for (key, factor) in [
            ("hard_shrink_factor", s.hard_shrink_factor),
            ("soft_shrink_factor", s.soft_shrink_factor),
        ] {
            if !(0.0..=1.0).contains(&factor) {
                warnings.push(format!("resources.scaling.{} should be within 0..=1, got {}", key, factor));
            }
        }
        if s.grow_factor < 1.0 {
            warnings.push(format!(
                "resources.scaling.grow_factor should be at least 1, got {}",
                s.grow_factor
            ));
        }

        let l = &self.resources.limits;
        if l.max_cpu_usage <= 0.0 || l.max_memory_usage <= 0.0 || l.max_network_latency_ms <= 0.0 {
            warnings.push("resources.limits must be positive".to_string());
        }
        if self.progress.ideal_concurrency == 0 {
            warnings.push("progress.ideal_concurrency is 0; efficiency will read 0".to_string());
        }

        for rule in &self.rules {
            if let Err(e) = RuleSet::new([rule.clone()]) {
                warnings.push(e.to_string());
            }
        }

        warnings
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // =========================================
    // FailureHandling tests
    // =========================================

    #[test]
    fn test_failure_handling_display_and_parse() {
        assert_eq!(FailureHandling::Abort.to_string(), "abort");
        assert_eq!("CONTINUE".parse::<FailureHandling>().unwrap(), FailureHandling::Continue);
        assert_eq!(" retry ".parse::<FailureHandling>().unwrap(), FailureHandling::Retry);
        let err = "explode".parse::<FailureHandling>().unwrap_err();
        assert!(err.to_string().contains("Invalid failure handling"));
    }

    #[test]
    fn test_processing_defaults() {
        let config = ProcessingConfig::default();
        assert_eq!(config.max_concurrent_stages, 3);
        assert!(config.enable_dynamic_scaling);
        assert_eq!(config.failure_handling, FailureHandling::Continue);
        assert_eq!(config.retry_attempts, 2);
        assert_eq!(config.timeout_per_stage, Duration::from_secs(120));
        assert!(config.enable_progress_tracking);
        assert!(config.enable_efficiency_monitoring);
    }

    #[test]
    fn test_processing_builders() {
        let config = ProcessingConfig::default()
            .with_max_concurrent_stages(0)
            .with_failure_handling(FailureHandling::Abort)
            .with_retry_attempts(5)
            .with_timeout(Duration::from_secs(1));
        assert_eq!(config.concurrency_cap(), 1);
        assert_eq!(config.failure_handling, FailureHandling::Abort);
        assert_eq!(config.retry_attempts, 5);
    }

    // =========================================
    // StagehandToml parsing tests
    // =========================================

    #[test]
    fn test_parse_empty() {
        let toml = StagehandToml::parse("").unwrap();
        assert_eq!(toml, StagehandToml::default());
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[processing]
max_concurrent_stages = 5
failure_handling = "abort"
timeout_per_stage_ms = 3000

[analyzer]
max_group_size = 4
use_default_rules = false

[planner]
high_complexity_cap = 1

[resources.limits]
max_cpu_usage = 60.0

[resources.scaling]
grow_factor = 2.0

[progress]
alert_dedup_window_secs = 10

[[rules]]
name_pattern = "review"
depends_on_pattern = "draft"
"#;
        let toml = StagehandToml::parse(content).unwrap();
        assert_eq!(toml.processing.max_concurrent_stages, 5);
        assert_eq!(toml.processing.failure_handling, FailureHandling::Abort);
        assert_eq!(toml.processing.timeout_per_stage, Duration::from_secs(3));
        assert_eq!(toml.processing.retry_attempts, 2);
        assert_eq!(toml.analyzer.max_group_size, 4);
        assert_eq!(toml.planner.high_complexity_cap, 1);
        assert_eq!(toml.resources.limits.max_cpu_usage, 60.0);
        assert_eq!(toml.resources.limits.max_memory_usage, 75.0);
        assert_eq!(toml.resources.scaling.grow_factor, 2.0);
        assert_eq!(toml.progress.alert_dedup_window, Duration::from_secs(10));
        assert_eq!(toml.rules.len(), 1);

        let rules = toml.rule_set().unwrap();
        assert_eq!(rules.len(), 1);
        let graph = toml.analyzer().unwrap().analyze(&["Draft", "Review"]);
        assert_eq!(graph.stages[1].dependencies.iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_parse_invalid() {
        let err = StagehandToml::parse("[processing]\nmax_concurrent_stages = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_default_rules_are_extended() {
        let toml = StagehandToml {
            rules: vec![DependencyRule::new("summary", ".")],
            ..StagehandToml::default()
        };
        assert_eq!(toml.rule_set().unwrap().len(), RuleSet::legal_analysis().len() + 1);
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = StagehandToml::default();
        toml.processing.max_concurrent_stages = 0;
        toml.resources.scaling.grow_below = 0.9;
        toml.rules.push(DependencyRule::new("(", "x"));
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("max_concurrent_stages"));
        assert!(warnings[1].contains("thresholds"));
        assert!(warnings[2].contains("Invalid dependency rule"));
        assert!(toml.rule_set().is_err());
    }

    // =========================================
    // File and environment tests
    // =========================================

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = StagehandToml::default();
        toml.processing.retry_attempts = 4;
        toml.rules.push(DependencyRule::exact("b", "a"));
        toml.save(&path).unwrap();

        let loaded = StagehandToml::load(&path).unwrap();
        assert_eq!(loaded, toml);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = StagehandToml::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(toml, StagehandToml::default());

        let err = StagehandToml::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }

    #[test]
    fn test_overrides() {
        let mut toml = StagehandToml::default();
        toml.apply_overrides(lookup(&[
            ("STAGEHAND_MAX_CONCURRENT_STAGES", "6"),
            ("STAGEHAND_RETRY_ATTEMPTS", "0"),
            ("STAGEHAND_TIMEOUT_MS", "2500"),
            ("STAGEHAND_FAILURE_HANDLING", "abort"),
        ]))
        .unwrap();
        assert_eq!(toml.processing.max_concurrent_stages, 6);
        assert_eq!(toml.processing.retry_attempts, 0);
        assert_eq!(toml.processing.timeout_per_stage, Duration::from_millis(2500));
        assert_eq!(toml.processing.failure_handling, FailureHandling::Abort);
    }

    #[test]
    fn test_invalid_override() {
        let mut toml = StagehandToml::default();
        let err = toml
            .apply_overrides(lookup(&[("STAGEHAND_RETRY_ATTEMPTS", "lots")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "STAGEHAND_RETRY_ATTEMPTS");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: serialized by ENV_MUTEX
        unsafe { std::env::set_var("STAGEHAND_MAX_CONCURRENT_STAGES", "2") };
        let mut toml = StagehandToml::default();
        let result = toml.apply_env_overrides();
        unsafe { std::env::remove_var("STAGEHAND_MAX_CONCURRENT_STAGES") };
        result.unwrap();
        assert_eq!(toml.processing.max_concurrent_stages, 2);
    }
}
