//! Dependency-aware parallel stage scheduling.
//!
//! A run goes through three steps:
//!
//! 1. **Analyzer** - infers a dependency graph from stage names using an
//!    ordered rule table, then derives complexity, priority, duration,
//!    parallel groups and the critical path
//! 2. **Planner** - partitions the graph into phases; every stage of a phase
//!    has its dependencies in earlier phases
//! 3. **Engine** - runs the phases in order with bounded concurrency,
//!    retrying failed attempts through the recovery strategies
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use stagehand::config::ProcessingConfig;
//! use stagehand::dag::{ParallelEngine, RunContext, StageContext, StageExecutor};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl StageExecutor for Echo {
//!     async fn execute(&self, index: usize, input: &str, ctx: &StageContext) -> anyhow::Result<String> {
//!         Ok(format!("{} #{}: {}", ctx.stage_name, index, input))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = ParallelEngine::new(Arc::new(Echo), ProcessingConfig::default());
//! let report = engine
//!     .execute("case text", RunContext::new(["Basic facts", "Parties", "Final evaluation"]))
//!     .await?;
//! assert!(report.all_success());
//! # Ok(())
//! # }
//! ```

mod analyzer;
mod builder;
mod executor;
mod planner;
mod rules;
mod state;

pub use analyzer::{AnalysisStats, DependencyAnalyzer, ParallelGroup};
pub use builder::{DependencyGraph, GraphBuilder, StageSpec};
pub use executor::{
    EngineEvent, ParallelEngine, ProgressSink, RunContext, StageContext, StageExecutor, StopHandle,
};
pub use planner::{
    ExecutionPlan, ExecutionPlanner, Phase, PhasePriority, PlannerSettings, topological_order,
};
pub use rules::{
    BaseDurations, DependencyRule, DurationMultiplier, RuleSet, StageVocabulary,
};
pub use state::{ExecutionProgress, ExecutionTimer, RunReport, RunState};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Complexity;

    fn legal_stages() -> Vec<&'static str> {
        vec![
            "Basic facts",
            "Parties",
            "Dispute",
            "Law search",
            "Precedents",
            "Final evaluation",
        ]
    }

    #[test]
    fn test_analyze_then_plan() {
        let graph = DependencyAnalyzer::default().analyze(&legal_stages());
        let plan = ExecutionPlanner::default().plan(&graph, 3).unwrap();

        // Every stage is scheduled exactly once
        let mut seen: Vec<usize> = plan
            .phases
            .iter()
            .flat_map(|p| p.stages_to_execute.iter().copied())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..graph.len()).collect::<Vec<_>>());

        // Dependencies always land in strictly earlier phases
        for stage in &graph.stages {
            let phase = plan.phase_of(stage.index).unwrap();
            for dep in &stage.dependencies {
                assert!(plan.phase_of(*dep).unwrap() < phase);
            }
        }
        assert_eq!(graph.leaf_stages(), vec![5]);
    }

    #[test]
    fn test_builder_graph_plans_like_analyzer_graph() {
        let graph = GraphBuilder::new(vec![
            StageSpec::new("Setup", []),
            StageSpec::new("Core A", [0]),
            StageSpec::new("Core B", [0]),
            StageSpec::new("Integration", [1, 2]),
        ])
        .build()
        .unwrap();
        let plan = ExecutionPlanner::new(PlannerSettings {
            enable_dynamic_scaling: false,
            ..PlannerSettings::default()
        })
        .plan(&graph, 3)
        .unwrap();

        assert_eq!(plan.total_phases(), 3);
        assert_eq!(plan.phases[1].stages_to_execute.len(), 2);
        assert_eq!(plan.max_concurrency, 2);
    }

    #[test]
    fn test_builder_rejects_cycle() {
        let err = GraphBuilder::new(vec![StageSpec::new("A", [1]), StageSpec::new("B", [0])])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_custom_vocabulary_flows_into_plan() {
        let analyzer = DependencyAnalyzer::new(RuleSet::empty(), StageVocabulary::neutral());
        let graph = analyzer.analyze(&["a", "b", "c", "d"]);
        assert!(graph.stages.iter().all(|s| s.dependencies.is_empty()));
        assert!(graph.stages.iter().all(|s| s.complexity != Complexity::High));

        let plan = ExecutionPlanner::default().plan(&graph, 2).unwrap();
        assert_eq!(plan.total_phases(), 2);
    }
}
