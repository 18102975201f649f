//! Dependency rules and keyword vocabulary used to infer stage metadata.
//!
//! The analyzer itself knows nothing about any particular stage naming
//! scheme. Everything name-dependent lives here:
//! - [`RuleSet`]: `{name_pattern, depends_on_pattern}` regex pairs deciding
//!   which earlier stages a stage depends on
//! - [`StageVocabulary`]: keyword tables for complexity, priority, duration
//!   and parallel eligibility
//!
//! Both have a default instance tuned for a legal case-analysis pipeline
//! (facts, parties, dispute, applicable law, precedents, ...).

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::SchedulerError;
use crate::stage::{Complexity, Priority};
use crate::util::contains_any;

/// A stage whose name matches `name_pattern` depends on every earlier stage
/// whose name matches `depends_on_pattern`. Patterns are case-insensitive regexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRule {
    pub name_pattern: String,
    pub depends_on_pattern: String,
}

impl DependencyRule {
    pub fn new(name_pattern: impl Into<String>, depends_on_pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: name_pattern.into(),
            depends_on_pattern: depends_on_pattern.into(),
        }
    }

    /// Rule matching two stage names literally (whole name, case-insensitive).
    pub fn exact(name: &str, depends_on: &str) -> Self {
        Self::new(
            format!("^{}$", regex::escape(name)),
            format!("^{}$", regex::escape(depends_on)),
        )
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: DependencyRule,
    name: Regex,
    depends_on: Regex,
}

fn compile(pattern: &str) -> Result<Regex, SchedulerError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| SchedulerError::InvalidRule {
            pattern: pattern.to_string(),
            source,
        })
}

impl CompiledRule {
    fn new(rule: DependencyRule) -> Result<Self, SchedulerError> {
        Ok(Self {
            name: compile(&rule.name_pattern)?,
            depends_on: compile(&rule.depends_on_pattern)?,
            rule,
        })
    }
}

/// Ordered table of dependency rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// A rule set that infers no dependencies at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a rule table, failing on the first invalid pattern.
    pub fn new(rules: impl IntoIterator<Item = DependencyRule>) -> Result<Self, SchedulerError> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Append a rule.
    pub fn push(&mut self, rule: DependencyRule) -> Result<(), SchedulerError> {
        self.rules.push(CompiledRule::new(rule)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &DependencyRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// Whether a stage named `name` depends on an earlier stage named `earlier`.
    pub fn depends(&self, name: &str, earlier: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.name.is_match(name) && r.depends_on.is_match(earlier))
    }

    /// Default rule table for the legal case-analysis pipeline.
    ///
    /// The first block is the known stage ordering; the last three rules are
    /// the implicit ones (analysis needs identification/research, strategy
    /// needs analysis, final evaluation needs everything before it).
    pub fn legal_analysis() -> Self {
        let rules = [
            ("parties", "facts"),
            ("dispute", "parties"),
            ("applicable law|law ?search", "dispute"),
            ("precedent", "applicable law|law ?search"),
            ("evidence", "precedent"),
            ("strength", "evidence"),
            ("weakness", "strength"),
            ("strategy", "weakness"),
            ("risk", "strategy"),
            ("pleading", "risk"),
            ("success probability", "pleading"),
            ("analy[sz]", "identif|search"),
            ("strategy|plan", "analy[sz]"),
            ("evaluat|final", "."),
        ];

        let mut set = Self::empty();
        for (name, depends_on) in rules {
            if let Err(e) = set.push(DependencyRule::new(name, depends_on)) {
                warn!(error = %e, "Skipping invalid built-in dependency rule");
            }
        }
        set
    }
}

/// Multiply the base duration of any stage whose name contains one of `keywords`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMultiplier {
    pub keywords: Vec<String>,
    pub factor: f64,
}

/// Base duration in seconds per complexity level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseDurations {
    pub low_secs: u64,
    pub medium_secs: u64,
    pub high_secs: u64,
}

impl Default for BaseDurations {
    fn default() -> Self {
        Self {
            low_secs: 30,
            medium_secs: 60,
            high_secs: 120,
        }
    }
}

impl BaseDurations {
    pub fn for_complexity(&self, complexity: Complexity) -> u64 {
        match complexity {
            Complexity::Low => self.low_secs,
            Complexity::Medium => self.medium_secs,
            Complexity::High => self.high_secs,
        }
    }
}

/// Keyword tables that classify stages by name. Matching is a
/// case-insensitive substring test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageVocabulary {
    pub high_complexity: Vec<String>,
    pub medium_complexity: Vec<String>,
    pub low_complexity: Vec<String>,
    pub critical_priority: Vec<String>,
    pub high_priority: Vec<String>,
    /// Stages with more dependencies than this get `low` priority
    /// unless a priority keyword matched.
    pub low_priority_dependency_threshold: usize,
    /// Always eligible for parallel execution.
    pub independent: Vec<String>,
    /// Never eligible for parallel execution.
    pub must_be_last: Vec<String>,
    pub base_durations: BaseDurations,
    pub duration_multipliers: Vec<DurationMultiplier>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for StageVocabulary {
    fn default() -> Self {
        Self {
            high_complexity: words(&["precedent", "strategy", "risk", "evaluat"]),
            medium_complexity: words(&["analy", "search", "identif"]),
            low_complexity: words(&["facts", "parties"]),
            critical_priority: words(&["facts", "parties", "dispute"]),
            high_priority: words(&["applicable law", "law search", "precedent", "strategy"]),
            low_priority_dependency_threshold: 3,
            independent: words(&["basic facts", "applicable law", "precedent"]),
            must_be_last: words(&["success probability", "final"]),
            base_durations: BaseDurations::default(),
            duration_multipliers: vec![
                DurationMultiplier {
                    keywords: words(&["search", "precedent"]),
                    factor: 1.5,
                },
                DurationMultiplier {
                    keywords: words(&["strategy", "plan"]),
                    factor: 1.3,
                },
                DurationMultiplier {
                    keywords: words(&["evaluat", "probability"]),
                    factor: 1.4,
                },
            ],
        }
    }
}

impl StageVocabulary {
    /// A vocabulary with no keywords: every stage is medium/medium/60s.
    pub fn neutral() -> Self {
        Self {
            high_complexity: Vec::new(),
            medium_complexity: Vec::new(),
            low_complexity: Vec::new(),
            critical_priority: Vec::new(),
            high_priority: Vec::new(),
            independent: Vec::new(),
            must_be_last: Vec::new(),
            duration_multipliers: Vec::new(),
            ..Self::default()
        }
    }

    /// First matching table wins, checked high → medium → low.
    pub fn complexity(&self, name: &str) -> Complexity {
        if contains_any(name, &self.high_complexity) {
            Complexity::High
        } else if contains_any(name, &self.medium_complexity) {
            Complexity::Medium
        } else if contains_any(name, &self.low_complexity) {
            Complexity::Low
        } else {
            Complexity::Medium
        }
    }

    /// Estimated duration in whole seconds.
    pub fn duration_secs(&self, name: &str, complexity: Complexity) -> u64 {
        let base = self.base_durations.for_complexity(complexity) as f64;
        let scaled = self
            .duration_multipliers
            .iter()
            .filter(|m| contains_any(name, &m.keywords))
            .fold(base, |acc, m| acc * m.factor);
        scaled.round().max(0.0) as u64
    }

    pub fn priority(&self, name: &str, dependency_count: usize) -> Priority {
        if contains_any(name, &self.critical_priority) {
            Priority::Critical
        } else if contains_any(name, &self.high_priority) {
            Priority::High
        } else if dependency_count > self.low_priority_dependency_threshold {
            Priority::Low
        } else {
            Priority::Medium
        }
    }

    pub fn can_run_in_parallel(&self, name: &str, dependency_count: usize) -> bool {
        if contains_any(name, &self.must_be_last) {
            return false;
        }
        dependency_count <= 1 || contains_any(name, &self.independent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_rule_matches_whole_name_only() {
        let rules = RuleSet::new([DependencyRule::exact("parties", "facts")]).unwrap();
        assert!(rules.depends("parties", "facts"));
        assert!(rules.depends("PARTIES", "Facts"));
        assert!(!rules.depends("parties list", "facts"));
        assert!(!rules.depends("facts", "parties"));
    }

    #[test]
    fn test_exact_rule_escapes_metacharacters() {
        let rules = RuleSet::new([DependencyRule::exact("step (2)", "step.1")]).unwrap();
        assert!(rules.depends("step (2)", "step.1"));
        assert!(!rules.depends("step (2)", "stepX1"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = RuleSet::new([DependencyRule::new("(", "x")]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRule { .. }));
    }

    #[test]
    fn test_legal_rules_all_compile() {
        let rules = RuleSet::legal_analysis();
        assert_eq!(rules.len(), 14);
    }

    #[test]
    fn test_legal_rules_implicit_classes() {
        let rules = RuleSet::legal_analysis();
        assert!(rules.depends("Analyze the legal dispute", "Identify legal parties"));
        assert!(rules.depends("Draft legal strategy", "Analyze legal strength"));
        assert!(rules.depends("Final legal brief", "anything at all"));
        assert!(!rules.depends("Identify legal parties", "Search applicable law"));
    }

    #[test]
    fn test_complexity_table_order() {
        let vocab = StageVocabulary::default();
        assert_eq!(vocab.complexity("Analyze judicial precedents"), Complexity::High);
        assert_eq!(vocab.complexity("Analyze basic facts"), Complexity::Medium);
        assert_eq!(vocab.complexity("Basic facts"), Complexity::Low);
        assert_eq!(vocab.complexity("Something else"), Complexity::Medium);
    }

    #[test]
    fn test_duration_multipliers_compound() {
        let vocab = StageVocabulary::default();
        // medium 60s * 1.5 (search)
        assert_eq!(vocab.duration_secs("Search applicable law", Complexity::Medium), 90);
        // high 120s * 1.5 (precedent)
        assert_eq!(vocab.duration_secs("Analyze judicial precedents", Complexity::High), 180);
        // high 120s * 1.3 (strategy) = 156
        assert_eq!(vocab.duration_secs("Draft legal strategy", Complexity::High), 156);
        // high 120s * 1.4 (evaluat) * 1.4 (probability) = 235.2
        assert_eq!(
            vocab.duration_secs("Evaluate success probability", Complexity::High),
            235
        );
    }

    #[test]
    fn test_priority_keywords_win_over_dependency_count() {
        let vocab = StageVocabulary::default();
        assert_eq!(vocab.priority("Analyze basic facts", 9), Priority::Critical);
        assert_eq!(vocab.priority("Draft legal strategy", 9), Priority::High);
        assert_eq!(vocab.priority("Identify weaknesses", 4), Priority::Low);
        assert_eq!(vocab.priority("Identify weaknesses", 3), Priority::Medium);
    }

    #[test]
    fn test_parallel_eligibility() {
        let vocab = StageVocabulary::default();
        assert!(vocab.can_run_in_parallel("anything", 0));
        assert!(vocab.can_run_in_parallel("anything", 1));
        assert!(!vocab.can_run_in_parallel("anything", 2));
        assert!(vocab.can_run_in_parallel("Analyze judicial precedents", 5));
        assert!(!vocab.can_run_in_parallel("Final legal brief", 0));
    }

    #[test]
    fn test_neutral_vocabulary() {
        let vocab = StageVocabulary::neutral();
        assert_eq!(vocab.complexity("precedent"), Complexity::Medium);
        assert_eq!(vocab.priority("facts", 0), Priority::Medium);
        assert_eq!(vocab.duration_secs("search", Complexity::Medium), 60);
    }

    #[test]
    fn test_vocabulary_toml_roundtrip_uses_defaults() {
        let vocab: StageVocabulary = toml::from_str("must_be_last = [\"wrap up\"]").unwrap();
        assert_eq!(vocab.must_be_last, vec!["wrap up".to_string()]);
        assert_eq!(vocab.base_durations.high_secs, 120);
        assert_eq!(vocab.duration_multipliers.len(), 3);
    }
}
