//! Execution planner: turns a dependency graph into ordered phases.
//!
//! A phase is a batch of stages whose dependencies all live in earlier
//! phases. Phases are filled greedily from the ready set, but a phase never
//! takes more stages than the dynamic concurrency value allows; the leftover
//! ready stages simply roll into the next phase.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::builder::DependencyGraph;
use crate::errors::SchedulerError;
use crate::stage::{Complexity, Priority, Stage, StageIndex};
use crate::util::duration_secs;

/// Tuning for the per-phase concurrency heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// When false, a phase takes `min(ready, cap)` stages.
    pub enable_dynamic_scaling: bool,
    /// Phase size when any ready stage is high complexity.
    pub high_complexity_cap: usize,
    /// Phase size when more than `medium_complexity_threshold` ready stages are medium.
    pub medium_complexity_cap: usize,
    pub medium_complexity_threshold: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            enable_dynamic_scaling: true,
            high_complexity_cap: 2,
            medium_complexity_cap: 3,
            medium_complexity_threshold: 2,
        }
    }
}

/// Coarse priority of a whole phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhasePriority {
    Low,
    Medium,
    High,
}

impl fmt::Display for PhasePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: usize,
    pub stages_to_execute: BTreeSet<StageIndex>,
    /// Longest member estimate, since members run concurrently.
    #[serde(rename = "estimated_duration_secs", with = "duration_secs")]
    pub estimated_duration: Duration,
    /// Stages that must be terminal before this phase starts.
    pub can_start_after: BTreeSet<StageIndex>,
    pub priority: PhasePriority,
}

impl Phase {
    /// Planned concurrency of this phase.
    pub fn max_concurrency(&self) -> usize {
        self.stages_to_execute.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phases: Vec<Phase>,
    pub topological_order: Vec<StageIndex>,
    #[serde(rename = "estimated_total_time_secs", with = "duration_secs")]
    pub estimated_total_time: Duration,
    /// Largest phase size.
    pub max_concurrency: usize,
}

impl ExecutionPlan {
    pub fn total_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Phase a stage was assigned to.
    pub fn phase_of(&self, stage: StageIndex) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.stages_to_execute.contains(&stage))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlanner {
    settings: PlannerSettings,
}

impl ExecutionPlanner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    /// Build the phase sequence for `graph` with at most `concurrency_cap`
    /// stages per phase (a cap of 0 is treated as 1).
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        concurrency_cap: usize,
    ) -> Result<ExecutionPlan, SchedulerError> {
        let cap = concurrency_cap.max(1);
        let order = topological_order(graph)?;

        let mut assigned: BTreeSet<StageIndex> = BTreeSet::new();
        let mut phases: Vec<Phase> = Vec::new();

        while assigned.len() < graph.len() {
            let mut candidates: Vec<&Stage> = order
                .iter()
                .filter_map(|&i| graph.stage(i))
                .filter(|s| !assigned.contains(&s.index) && s.dependencies_satisfied(&assigned))
                .collect();

            if candidates.is_empty() {
                let remaining = (0..graph.len()).filter(|i| !assigned.contains(i)).collect();
                return Err(SchedulerError::UnsatisfiableDependencies { remaining });
            }

            candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.index.cmp(&b.index)));
            let take = self.dynamic_concurrency(&candidates, cap);
            let selected = &candidates[..take];

            let phase = Phase {
                phase_id: phases.len(),
                stages_to_execute: selected.iter().map(|s| s.index).collect(),
                estimated_duration: selected
                    .iter()
                    .map(|s| s.estimated_duration)
                    .max()
                    .unwrap_or_default(),
                can_start_after: selected
                    .iter()
                    .flat_map(|s| s.dependencies.iter().copied())
                    .collect(),
                priority: phase_priority(selected),
            };
            debug!(
                phase = phase.phase_id,
                stages = ?phase.stages_to_execute,
                ready = candidates.len(),
                "Planned phase"
            );

            assigned.extend(phase.stages_to_execute.iter().copied());
            phases.push(phase);
        }

        Ok(ExecutionPlan {
            estimated_total_time: phases.iter().map(|p| p.estimated_duration).sum(),
            max_concurrency: phases.iter().map(Phase::max_concurrency).max().unwrap_or(0),
            phases,
            topological_order: order,
        })
    }

    /// How many of the ready stages one phase may take.
    fn dynamic_concurrency(&self, candidates: &[&Stage], cap: usize) -> usize {
        let mut limit = cap;
        if self.settings.enable_dynamic_scaling {
            let medium = candidates
                .iter()
                .filter(|s| s.complexity == Complexity::Medium)
                .count();
            if candidates.iter().any(|s| s.complexity == Complexity::High) {
                limit = limit.min(self.settings.high_complexity_cap);
            } else if medium > self.settings.medium_complexity_threshold {
                limit = limit.min(self.settings.medium_complexity_cap);
            }
        }
        candidates.len().min(limit).max(1)
    }
}

fn phase_priority(stages: &[&Stage]) -> PhasePriority {
    if stages
        .iter()
        .any(|s| matches!(s.priority, Priority::Critical | Priority::High))
    {
        PhasePriority::High
    } else if stages.iter().any(|s| s.priority == Priority::Medium) {
        PhasePriority::Medium
    } else {
        PhasePriority::Low
    }
}

/// Depth-first topological order: every stage appears after all of its
/// dependencies. Fails on a cycle or a dangling edge.
pub fn topological_order(graph: &DependencyGraph) -> Result<Vec<StageIndex>, SchedulerError> {
    let mut visited = vec![false; graph.len()];
    let mut visiting: BTreeSet<StageIndex> = BTreeSet::new();
    let mut order = Vec::with_capacity(graph.len());
    // Each frame holds a stage and the dependencies it has yet to walk
    let mut stack: Vec<(StageIndex, Vec<StageIndex>)> = Vec::new();

    for root in 0..graph.len() {
        if visited[root] {
            continue;
        }
        visiting.insert(root);
        stack.push((root, unwalked(graph, root)));

        while let Some((index, deps)) = stack.last_mut() {
            let index = *index;
            let Some(dep) = deps.pop() else {
                stack.pop();
                visiting.remove(&index);
                visited[index] = true;
                order.push(index);
                continue;
            };
            if dep >= graph.len() {
                return Err(SchedulerError::UnknownDependency {
                    stage: index,
                    dependency: dep,
                });
            }
            if visited[dep] {
                continue;
            }
            if !visiting.insert(dep) {
                return Err(SchedulerError::DependencyCycle {
                    stages: visiting.iter().copied().collect(),
                });
            }
            stack.push((dep, unwalked(graph, dep)));
        }
    }
    Ok(order)
}

/// Dependencies of `index`, reversed so popping yields ascending order.
fn unwalked(graph: &DependencyGraph, index: StageIndex) -> Vec<StageIndex> {
    graph
        .dependencies(index)
        .map(|deps| deps.iter().rev().copied().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::{GraphBuilder, StageSpec};
    use crate::dag::rules::StageVocabulary;

    fn graph(specs: &[(&str, &[StageIndex])]) -> DependencyGraph {
        GraphBuilder::new(
            specs
                .iter()
                .map(|(n, d)| StageSpec::new(*n, d.iter().copied()))
                .collect(),
        )
        .with_vocabulary(StageVocabulary::neutral())
        .build()
        .unwrap()
    }

    fn phase_sets(plan: &ExecutionPlan) -> Vec<Vec<StageIndex>> {
        plan.phases
            .iter()
            .map(|p| p.stages_to_execute.iter().copied().collect())
            .collect()
    }

    #[test]
    fn test_chain_gives_one_stage_per_phase() {
        let g = graph(&[("a", &[]), ("b", &[0]), ("c", &[1]), ("d", &[2])]);
        let plan = ExecutionPlanner::default().plan(&g, 3).unwrap();
        assert_eq!(phase_sets(&plan), vec![vec![0], vec![1], vec![2], vec![3]]);
        assert_eq!(plan.estimated_total_time, Duration::from_secs(240));
        assert_eq!(plan.max_concurrency, 1);
    }

    #[test]
    fn test_diamond() {
        let g = graph(&[("a", &[]), ("b", &[0]), ("c", &[0]), ("d", &[1, 2])]);
        let plan = ExecutionPlanner::default().plan(&g, 2).unwrap();
        assert_eq!(phase_sets(&plan), vec![vec![0], vec![1, 2], vec![3]]);
        assert_eq!(plan.phases[2].can_start_after, BTreeSet::from([1, 2]));
        assert_eq!(plan.phase_of(3), Some(2));
    }

    #[test]
    fn test_cap_applies_back_pressure() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &[]), ("d", &[])]);
        let plan = ExecutionPlanner::default().plan(&g, 2).unwrap();
        assert_eq!(phase_sets(&plan), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_zero_cap_is_treated_as_one() {
        let g = graph(&[("a", &[]), ("b", &[])]);
        let plan = ExecutionPlanner::default().plan(&g, 0).unwrap();
        assert_eq!(plan.total_phases(), 2);
    }

    #[test]
    fn test_priority_wins_over_index() {
        let mut vocab = StageVocabulary::neutral();
        vocab.critical_priority = vec!["urgent".into()];
        let g = GraphBuilder::new(vec![
            StageSpec::new("a", []),
            StageSpec::new("b", []),
            StageSpec::new("urgent c", []),
        ])
        .with_vocabulary(vocab)
        .build()
        .unwrap();
        let plan = ExecutionPlanner::default().plan(&g, 1).unwrap();
        assert_eq!(phase_sets(&plan), vec![vec![2], vec![0], vec![1]]);
        assert_eq!(plan.phases[0].priority, PhasePriority::High);
        assert_eq!(plan.phases[1].priority, PhasePriority::Medium);
    }

    #[test]
    fn test_high_complexity_limits_phase() {
        let mut vocab = StageVocabulary::neutral();
        vocab.high_complexity = vec!["heavy".into()];
        let g = GraphBuilder::new(vec![
            StageSpec::new("heavy a", []),
            StageSpec::new("b", []),
            StageSpec::new("c", []),
        ])
        .with_vocabulary(vocab)
        .build()
        .unwrap();

        let plan = ExecutionPlanner::default().plan(&g, 3).unwrap();
        assert_eq!(plan.phases[0].stages_to_execute.len(), 2);

        let flat = ExecutionPlanner::new(PlannerSettings {
            enable_dynamic_scaling: false,
            ..PlannerSettings::default()
        })
        .plan(&g, 3)
        .unwrap();
        assert_eq!(flat.phases[0].stages_to_execute.len(), 3);
    }

    #[test]
    fn test_many_medium_stages_cap_at_three() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &[]), ("d", &[]), ("e", &[])]);
        let plan = ExecutionPlanner::default().plan(&g, 5).unwrap();
        assert_eq!(phase_sets(&plan), vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_dependencies_land_in_earlier_phases() {
        let g = graph(&[
            ("a", &[]),
            ("b", &[]),
            ("c", &[0]),
            ("d", &[1, 2]),
            ("e", &[0]),
            ("f", &[3, 4]),
        ]);
        let plan = ExecutionPlanner::default().plan(&g, 2).unwrap();
        for stage in &g.stages {
            let k = plan.phase_of(stage.index).unwrap();
            for dep in &stage.dependencies {
                assert!(plan.phase_of(*dep).unwrap() < k);
            }
        }
    }

    #[test]
    fn test_topological_order_detects_cycle() {
        let mut g = graph(&[("a", &[]), ("b", &[0])]);
        // Corrupt the graph after validation to simulate an analyzer defect.
        g.stages[0].dependencies.insert(1);
        let err = topological_order(&g).unwrap_err();
        assert!(matches!(err, SchedulerError::DependencyCycle { .. }));
        assert!(ExecutionPlanner::default().plan(&g, 2).is_err());
    }

    #[test]
    fn test_topological_order_of_deep_chain() {
        // Stage i depends on stage i + 1, so the walk from stage 0 is as deep as the graph
        let n = 200_000;
        let mut g = graph(&[]);
        g.stages = (0..n)
            .map(|i| Stage {
                index: i,
                name: format!("stage {}", i),
                estimated_duration: Duration::from_secs(1),
                complexity: Complexity::Medium,
                priority: Priority::Medium,
                dependencies: (i + 1 < n).then_some(i + 1).into_iter().collect(),
                dependents: i.checked_sub(1).into_iter().collect(),
                can_run_in_parallel: false,
            })
            .collect();

        let order = topological_order(&g).unwrap();
        assert_eq!(order.len(), n);
        assert_eq!(order.first(), Some(&(n - 1)));
        assert_eq!(order.last(), Some(&0));
    }

    #[test]
    fn test_dangling_dependency_is_rejected() {
        let mut g = graph(&[("a", &[])]);
        g.stages[0].dependencies.insert(9);
        let err = ExecutionPlanner::default().plan(&g, 2).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::UnknownDependency { dependency: 9, .. }
        ));
    }

    #[test]
    fn test_empty_graph_plans_nothing() {
        let g = graph(&[]);
        let plan = ExecutionPlanner::default().plan(&g, 3).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.max_concurrency, 0);
    }
}
