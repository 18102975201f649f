//! Dependency graph type and a builder for caller-supplied dependency lists.
//!
//! Most callers go through [`DependencyAnalyzer`](super::DependencyAnalyzer),
//! which only ever draws dependencies from earlier stages and so cannot
//! produce a cycle. [`GraphBuilder`] is for callers that already know their
//! edges: it accepts arbitrary indices and rejects unknown targets, self
//! edges and cycles before any metadata is derived.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::analyzer::{ParallelGroup, derive_graph};
use super::rules::StageVocabulary;
use crate::errors::SchedulerError;
use crate::stage::{Stage, StageIndex};
use crate::util::duration_secs;

/// A fully analysed stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub stages: Vec<Stage>,
    pub parallel_groups: Vec<ParallelGroup>,
    /// Longest dependency chain by stage count.
    pub critical_path: Vec<StageIndex>,
    #[serde(rename = "total_sequential_time_secs", with = "duration_secs")]
    pub total_sequential_time: Duration,
    /// Weighted critical-path length: earliest finish of the last stage with
    /// unlimited concurrency.
    #[serde(rename = "parallel_estimated_time_secs", with = "duration_secs")]
    pub parallel_estimated_time: Duration,
    /// Fractional time saved by running in parallel, in `[0, 1]`.
    pub efficiency_gain: f64,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: StageIndex) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn dependencies(&self, index: StageIndex) -> Option<&BTreeSet<StageIndex>> {
        self.stages.get(index).map(|s| &s.dependencies)
    }

    pub fn dependents(&self, index: StageIndex) -> Option<&BTreeSet<StageIndex>> {
        self.stages.get(index).map(|s| &s.dependents)
    }

    /// Stages with no dependencies (entry points).
    pub fn root_stages(&self) -> Vec<StageIndex> {
        self.stages
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.index)
            .collect()
    }

    /// Stages nothing else depends on (exit points).
    pub fn leaf_stages(&self) -> Vec<StageIndex> {
        self.stages
            .iter()
            .filter(|s| s.dependents.is_empty())
            .map(|s| s.index)
            .collect()
    }

    pub fn efficiency_gain_percent(&self) -> f64 {
        self.efficiency_gain * 100.0
    }
}

/// A stage name with its explicit dependency indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<StageIndex>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, depends_on: impl IntoIterator<Item = StageIndex>) -> Self {
        Self {
            name: name.into(),
            depends_on: depends_on.into_iter().collect(),
        }
    }
}

/// Builder for graphs whose edges are supplied explicitly.
pub struct GraphBuilder {
    specs: Vec<StageSpec>,
    vocabulary: StageVocabulary,
    max_group_size: usize,
}

impl GraphBuilder {
    pub fn new(specs: Vec<StageSpec>) -> Self {
        Self {
            specs,
            vocabulary: StageVocabulary::default(),
            max_group_size: 3,
        }
    }

    pub fn with_vocabulary(mut self, vocabulary: StageVocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn with_max_group_size(mut self, size: usize) -> Self {
        self.max_group_size = size;
        self
    }

    /// Build the graph.
    ///
    /// This validates the edge list:
    /// - every dependency must reference an existing stage
    /// - no stage may depend on itself
    /// - no cycles are allowed
    pub fn build(self) -> Result<DependencyGraph, SchedulerError> {
        let len = self.specs.len();
        let mut dependencies: Vec<BTreeSet<StageIndex>> = Vec::with_capacity(len);

        for (index, spec) in self.specs.iter().enumerate() {
            let mut deps = BTreeSet::new();
            for &dep in &spec.depends_on {
                if dep == index {
                    return Err(SchedulerError::SelfDependency { stage: index });
                }
                if dep >= len {
                    return Err(SchedulerError::UnknownDependency {
                        stage: index,
                        dependency: dep,
                    });
                }
                deps.insert(dep);
            }
            dependencies.push(deps);
        }

        validate_no_cycles(&dependencies)?;
        debug!(stages = len, "Validated explicit stage dependencies");

        let names = self.specs.into_iter().map(|s| s.name).collect();
        Ok(derive_graph(
            names,
            dependencies,
            &self.vocabulary,
            self.max_group_size,
        ))
    }
}

/// Reject cyclic edge lists using Kahn's algorithm.
fn validate_no_cycles(dependencies: &[BTreeSet<StageIndex>]) -> Result<(), SchedulerError> {
    let mut dependents: Vec<Vec<StageIndex>> = vec![Vec::new(); dependencies.len()];
    for (to, deps) in dependencies.iter().enumerate() {
        for &from in deps {
            dependents[from].push(to);
        }
    }

    let mut in_degree: Vec<usize> = dependencies.iter().map(|d| d.len()).collect();
    let mut queue: Vec<StageIndex> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push(next);
            }
        }
    }

    if processed != dependencies.len() {
        let stages = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| i)
            .collect();
        return Err(SchedulerError::DependencyCycle { stages });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[StageIndex]) -> StageSpec {
        StageSpec::new(name, deps.iter().copied())
    }

    #[test]
    fn test_build_simple_graph() {
        let graph = GraphBuilder::new(vec![spec("a", &[]), spec("b", &[0]), spec("c", &[0])])
            .with_vocabulary(StageVocabulary::neutral())
            .build()
            .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.root_stages(), vec![0]);
        assert_eq!(graph.leaf_stages(), vec![1, 2]);
        assert_eq!(graph.dependents(0), Some(&BTreeSet::from([1, 2])));
    }

    #[test]
    fn test_forward_reference_is_allowed() {
        // Stage 0 depends on stage 1: not index-ordered, but acyclic.
        let graph = GraphBuilder::new(vec![spec("late", &[1]), spec("early", &[])])
            .build()
            .unwrap();
        assert_eq!(graph.root_stages(), vec![1]);
        assert_eq!(graph.critical_path, vec![1, 0]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = GraphBuilder::new(vec![spec("a", &[]), spec("b", &[7])])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::UnknownDependency {
                stage: 1,
                dependency: 7
            }
        ));
    }

    #[test]
    fn test_self_dependency() {
        let err = GraphBuilder::new(vec![spec("a", &[0])]).build().unwrap_err();
        assert!(matches!(err, SchedulerError::SelfDependency { stage: 0 }));
    }

    #[test]
    fn test_cycle_detection() {
        let err = GraphBuilder::new(vec![
            spec("a", &[]),
            spec("b", &[0, 2]),
            spec("c", &[1]),
        ])
        .build()
        .unwrap_err();
        match err {
            SchedulerError::DependencyCycle { stages } => assert_eq!(stages, vec![1, 2]),
            other => panic!("Expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_builder() {
        let graph = GraphBuilder::new(Vec::new()).build().unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.efficiency_gain, 0.0);
    }
}
