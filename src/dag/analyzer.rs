//! Dependency analysis: stage names in, annotated graph out.
//!
//! Analysis is a pure function of the stage-name list. Dependencies come from
//! the [`RuleSet`], are restricted to earlier stages, and everything else
//! (complexity, priority, duration, parallel groups, critical path) is derived
//! from the [`StageVocabulary`] and the resulting edges.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::builder::DependencyGraph;
use super::rules::{RuleSet, StageVocabulary};
use crate::stage::{Complexity, Priority, Stage, StageIndex};
use crate::util::duration_secs;

/// Stages at the same dependency level that may be batched together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub group_id: usize,
    pub stages: BTreeSet<StageIndex>,
    #[serde(rename = "estimated_duration_secs", with = "duration_secs")]
    pub estimated_duration: Duration,
    pub max_concurrency: usize,
    /// Union of the members' dependencies.
    pub prerequisites: BTreeSet<StageIndex>,
}

/// Summary numbers for a graph, suitable for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub total_stages: usize,
    pub parallelizable_stages: usize,
    pub serial_stages: usize,
    pub parallel_groups: usize,
    pub critical_path_length: usize,
    pub efficiency_gain_percent: f64,
    pub complexity_distribution: BTreeMap<Complexity, usize>,
    pub priority_distribution: BTreeMap<Priority, usize>,
}

impl AnalysisStats {
    pub fn of(graph: &DependencyGraph) -> Self {
        let parallelizable = graph
            .stages
            .iter()
            .filter(|s| s.can_run_in_parallel)
            .count();
        let mut complexity_distribution = BTreeMap::new();
        let mut priority_distribution = BTreeMap::new();
        for stage in &graph.stages {
            *complexity_distribution.entry(stage.complexity).or_insert(0) += 1;
            *priority_distribution.entry(stage.priority).or_insert(0) += 1;
        }

        Self {
            total_stages: graph.len(),
            parallelizable_stages: parallelizable,
            serial_stages: graph.len() - parallelizable,
            parallel_groups: graph.parallel_groups.len(),
            critical_path_length: graph.critical_path.len(),
            efficiency_gain_percent: graph.efficiency_gain_percent(),
            complexity_distribution,
            priority_distribution,
        }
    }
}

/// Infers a [`DependencyGraph`] from an ordered list of stage names.
#[derive(Debug, Clone)]
pub struct DependencyAnalyzer {
    rules: RuleSet,
    vocabulary: StageVocabulary,
    max_group_size: usize,
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new(RuleSet::legal_analysis(), StageVocabulary::default())
    }
}

impl DependencyAnalyzer {
    pub fn new(rules: RuleSet, vocabulary: StageVocabulary) -> Self {
        Self {
            rules,
            vocabulary,
            max_group_size: 3,
        }
    }

    /// Cap on members per parallel sub-group (minimum 1).
    pub fn with_max_group_size(mut self, size: usize) -> Self {
        self.max_group_size = size.max(1);
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn vocabulary(&self) -> &StageVocabulary {
        &self.vocabulary
    }

    /// Build the graph. An empty list yields an empty graph.
    pub fn analyze<S: AsRef<str>>(&self, names: &[S]) -> DependencyGraph {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();

        let dependencies: Vec<BTreeSet<StageIndex>> = names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                names[..index]
                    .iter()
                    .enumerate()
                    .filter(|(_, earlier)| self.rules.depends(name, earlier))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        let graph = derive_graph(names, dependencies, &self.vocabulary, self.max_group_size);
        debug!(
            stages = graph.len(),
            groups = graph.parallel_groups.len(),
            critical_path = graph.critical_path.len(),
            gain = graph.efficiency_gain,
            "Analyzed stage dependencies"
        );
        graph
    }
}

/// Derive every stage attribute and graph-level metric from names and edges.
///
/// `dependencies` must be acyclic.
pub(crate) fn derive_graph(
    names: Vec<String>,
    dependencies: Vec<BTreeSet<StageIndex>>,
    vocabulary: &StageVocabulary,
    max_group_size: usize,
) -> DependencyGraph {
    let mut stages: Vec<Stage> = names
        .into_iter()
        .zip(dependencies)
        .enumerate()
        .map(|(index, (name, dependencies))| {
            let complexity = vocabulary.complexity(&name);
            let estimated_duration =
                Duration::from_secs(vocabulary.duration_secs(&name, complexity));
            let priority = vocabulary.priority(&name, dependencies.len());
            let can_run_in_parallel = vocabulary.can_run_in_parallel(&name, dependencies.len());
            Stage {
                index,
                name,
                estimated_duration,
                complexity,
                priority,
                dependencies,
                dependents: BTreeSet::new(),
                can_run_in_parallel,
            }
        })
        .collect();

    let edges: Vec<(StageIndex, StageIndex)> = stages
        .iter()
        .flat_map(|s| s.dependencies.iter().map(move |&d| (d, s.index)))
        .collect();
    for (from, to) in edges {
        if let Some(stage) = stages.get_mut(from) {
            stage.dependents.insert(to);
        }
    }

    let parallel_groups = parallel_groups(&stages, max_group_size.max(1));
    let critical_path = critical_path(&stages);
    let total_sequential_time: Duration = stages.iter().map(|s| s.estimated_duration).sum();
    let parallel_estimated_time = weighted_span(&stages);
    let efficiency_gain = if total_sequential_time.is_zero() {
        0.0
    } else {
        total_sequential_time
            .saturating_sub(parallel_estimated_time)
            .as_secs_f64()
            / total_sequential_time.as_secs_f64()
    };

    DependencyGraph {
        stages,
        parallel_groups,
        critical_path,
        total_sequential_time,
        parallel_estimated_time,
        efficiency_gain,
    }
}

fn can_group(a: &Stage, b: &Stage) -> bool {
    a.priority == b.priority
        && a.complexity.rank().abs_diff(b.complexity.rank()) <= 1
        && !a.dependencies.contains(&b.index)
        && !b.dependencies.contains(&a.index)
}

/// Bucket parallel-eligible stages by dependency count, then greedily split
/// each bucket into compatible sub-groups of at most `cap` members.
fn parallel_groups(stages: &[Stage], cap: usize) -> Vec<ParallelGroup> {
    let mut levels: BTreeMap<usize, Vec<&Stage>> = BTreeMap::new();
    for stage in stages.iter().filter(|s| s.can_run_in_parallel) {
        levels
            .entry(stage.dependencies.len())
            .or_default()
            .push(stage);
    }

    let mut groups = Vec::new();
    for eligible in levels.values().filter(|l| l.len() > 1) {
        let mut used = BTreeSet::new();
        for seed in eligible {
            if !used.insert(seed.index) {
                continue;
            }
            let mut members = vec![*seed];
            for other in eligible {
                if members.len() >= cap {
                    break;
                }
                if used.contains(&other.index) {
                    continue;
                }
                if members.iter().all(|m| can_group(m, other)) {
                    used.insert(other.index);
                    members.push(*other);
                }
            }
            if members.len() > 1 {
                groups.push(ParallelGroup {
                    group_id: groups.len(),
                    stages: members.iter().map(|s| s.index).collect(),
                    estimated_duration: members
                        .iter()
                        .map(|s| s.estimated_duration)
                        .max()
                        .unwrap_or_default(),
                    max_concurrency: members.len().min(cap),
                    prerequisites: members
                        .iter()
                        .flat_map(|s| s.dependencies.iter().copied())
                        .collect(),
                });
            }
        }
    }
    groups
}

/// Kahn order over derived stages: every stage follows its dependencies.
fn dependency_order(stages: &[Stage]) -> Vec<StageIndex> {
    let mut waiting: Vec<usize> = stages.iter().map(|s| s.dependencies.len()).collect();
    let mut ready: Vec<StageIndex> = stages
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .map(|s| s.index)
        .collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(index) = ready.pop() {
        order.push(index);
        for &next in &stages[index].dependents {
            waiting[next] -= 1;
            if waiting[next] == 0 {
                ready.push(next);
            }
        }
    }
    order
}

/// Longest chain (by stage count) starting at any root. Ties keep the
/// first root in index order and the lowest-indexed dependent.
fn critical_path(stages: &[Stage]) -> Vec<StageIndex> {
    let mut length = vec![0usize; stages.len()];
    let mut next: Vec<Option<StageIndex>> = vec![None; stages.len()];
    for &index in dependency_order(stages).iter().rev() {
        let mut tail = 0;
        for &dependent in &stages[index].dependents {
            if length[dependent] > tail {
                tail = length[dependent];
                next[index] = Some(dependent);
            }
        }
        length[index] = tail + 1;
    }

    let start = stages
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .map(|s| s.index)
        .fold(None, |best: Option<StageIndex>, i| match best {
            Some(b) if length[b] >= length[i] => Some(b),
            _ => Some(i),
        });
    let Some(mut cursor) = start else {
        return Vec::new();
    };
    let mut path = vec![cursor];
    while let Some(step) = next[cursor] {
        path.push(step);
        cursor = step;
    }
    path
}

/// Finish time of the last stage when every stage starts as soon as its
/// dependencies finish.
fn weighted_span(stages: &[Stage]) -> Duration {
    let mut finish = vec![Duration::ZERO; stages.len()];
    for index in dependency_order(stages) {
        let start = stages[index]
            .dependencies
            .iter()
            .map(|&d| finish[d])
            .max()
            .unwrap_or_default();
        finish[index] = start + stages[index].estimated_duration;
    }
    finish.into_iter().max().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::rules::DependencyRule;

    fn chain_analyzer() -> DependencyAnalyzer {
        let rules = RuleSet::new([
            DependencyRule::exact("parties", "facts"),
            DependencyRule::exact("dispute", "parties"),
            DependencyRule::exact("final", "dispute"),
        ])
        .unwrap();
        DependencyAnalyzer::new(rules, StageVocabulary::neutral())
    }

    fn diamond_analyzer() -> DependencyAnalyzer {
        let rules = RuleSet::new([
            DependencyRule::exact("lawSearch", "facts"),
            DependencyRule::exact("precedents", "facts"),
            DependencyRule::exact("strategy", "lawSearch"),
            DependencyRule::exact("strategy", "precedents"),
        ])
        .unwrap();
        DependencyAnalyzer::new(rules, StageVocabulary::neutral())
    }

    #[test]
    fn test_empty_input_gives_empty_graph() {
        let graph = DependencyAnalyzer::default().analyze::<&str>(&[]);
        assert!(graph.is_empty());
        assert!(graph.critical_path.is_empty());
        assert!(graph.parallel_groups.is_empty());
        assert_eq!(graph.efficiency_gain, 0.0);
    }

    #[test]
    fn test_chain_has_no_gain() {
        let graph = chain_analyzer().analyze(&["facts", "parties", "dispute", "final"]);
        assert_eq!(graph.dependencies(1), Some(&BTreeSet::from([0])));
        assert_eq!(graph.dependencies(3), Some(&BTreeSet::from([2])));
        assert_eq!(graph.critical_path, vec![0, 1, 2, 3]);
        assert_eq!(graph.total_sequential_time, Duration::from_secs(240));
        assert_eq!(graph.parallel_estimated_time, Duration::from_secs(240));
        assert_eq!(graph.efficiency_gain, 0.0);
    }

    #[test]
    fn test_diamond_gain_and_groups() {
        let graph = diamond_analyzer().analyze(&["facts", "lawSearch", "precedents", "strategy"]);
        assert_eq!(graph.dependencies(3), Some(&BTreeSet::from([1, 2])));
        assert_eq!(graph.dependents(0), Some(&BTreeSet::from([1, 2])));
        // 4 x 60s sequential, 3 x 60s along the longest chain
        assert_eq!(graph.parallel_estimated_time, Duration::from_secs(180));
        assert!((graph.efficiency_gain - 0.25).abs() < 1e-9);

        assert_eq!(graph.parallel_groups.len(), 1);
        let group = &graph.parallel_groups[0];
        assert_eq!(group.stages, BTreeSet::from([1, 2]));
        assert_eq!(group.prerequisites, BTreeSet::from([0]));
        assert_eq!(group.max_concurrency, 2);
        // strategy has two deps: not parallel-eligible
        assert!(!graph.stages[3].can_run_in_parallel);
    }

    #[test]
    fn test_dependencies_only_point_backwards() {
        // "final" rule matches everything, but only earlier stages count.
        let rules = RuleSet::new([DependencyRule::new("final", ".")]).unwrap();
        let analyzer = DependencyAnalyzer::new(rules, StageVocabulary::neutral());
        let graph = analyzer.analyze(&["final", "a", "b"]);
        assert!(graph.stages.iter().all(|s| s.dependencies.is_empty()));
    }

    #[test]
    fn test_sub_groups_are_capped() {
        let analyzer = DependencyAnalyzer::new(RuleSet::empty(), StageVocabulary::neutral());
        let graph = analyzer.analyze(&["a", "b", "c", "d", "e"]);
        let sizes: Vec<usize> = graph.parallel_groups.iter().map(|g| g.stages.len()).collect();
        assert_eq!(sizes, vec![3, 2]);
        assert!(graph.parallel_groups.iter().all(|g| g.max_concurrency <= 3));

        let wide = analyzer.with_max_group_size(5).analyze(&["a", "b", "c", "d", "e"]);
        assert_eq!(wide.parallel_groups.len(), 1);
    }

    #[test]
    fn test_groups_require_matching_priority() {
        let mut vocab = StageVocabulary::neutral();
        vocab.critical_priority = vec!["urgent".into()];
        let analyzer = DependencyAnalyzer::new(RuleSet::empty(), vocab);
        let graph = analyzer.analyze(&["urgent a", "b", "c"]);
        assert_eq!(graph.parallel_groups.len(), 1);
        assert_eq!(graph.parallel_groups[0].stages, BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_default_vocabulary_legal_pipeline() {
        let names = [
            "Analyze basic facts",
            "Identify legal parties",
            "Analyze the legal dispute",
            "Search applicable law",
            "Analyze judicial precedents",
            "Draft legal strategy",
            "Final legal brief",
        ];
        let graph = DependencyAnalyzer::default().analyze(&names);

        assert_eq!(graph.stages[0].priority, Priority::Critical);
        assert_eq!(graph.stages[1].dependencies, BTreeSet::from([0]));
        assert!(graph.stages[2].dependencies.contains(&1));
        assert_eq!(graph.stages[4].complexity, Complexity::High);
        assert_eq!(graph.stages[6].dependencies.len(), 6);
        assert!(!graph.stages[6].can_run_in_parallel);
        assert_eq!(graph.critical_path.first(), Some(&0));
        assert_eq!(graph.critical_path.last(), Some(&6));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let names = ["Analyze basic facts", "Identify legal parties", "Final legal brief"];
        let analyzer = DependencyAnalyzer::default();
        let a = analyzer.analyze(&names);
        let b = analyzer.analyze(&names);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_stats() {
        let graph = diamond_analyzer().analyze(&["facts", "lawSearch", "precedents", "strategy"]);
        let stats = AnalysisStats::of(&graph);
        assert_eq!(stats.total_stages, 4);
        assert_eq!(stats.parallelizable_stages, 3);
        assert_eq!(stats.serial_stages, 1);
        assert_eq!(stats.complexity_distribution.get(&Complexity::Medium), Some(&4));
        assert!((stats.efficiency_gain_percent - 25.0).abs() < 1e-9);
    }

    /// `n` stages where stage `i` depends on stage `i - 1`.
    fn long_chain(n: usize) -> Vec<Stage> {
        (0..n)
            .map(|i| Stage {
                index: i,
                name: format!("stage {}", i),
                estimated_duration: Duration::from_secs(1),
                complexity: Complexity::Medium,
                priority: Priority::Medium,
                dependencies: i.checked_sub(1).into_iter().collect(),
                dependents: (i + 1 < n).then_some(i + 1).into_iter().collect(),
                can_run_in_parallel: false,
            })
            .collect()
    }

    #[test]
    fn test_deep_chain_path_and_span() {
        let stages = long_chain(200_000);
        let path = critical_path(&stages);
        assert_eq!(path.len(), 200_000);
        assert_eq!(path.first(), Some(&0));
        assert_eq!(path.last(), Some(&199_999));
        assert_eq!(weighted_span(&stages), Duration::from_secs(200_000));
    }

    #[test]
    fn test_critical_path_tie_keeps_lowest_branch() {
        let graph = diamond_analyzer().analyze(&["facts", "lawSearch", "precedents", "strategy"]);
        assert_eq!(graph.critical_path, vec![0, 1, 3]);
    }
}
