//! Execution state tracking for the parallel engine.
//!
//! The engine loop is the only writer of these types; everything else gets
//! snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::builder::DependencyGraph;
use super::planner::ExecutionPlan;
use crate::progress::DetailedProgress;
use crate::recovery::ErrorAnalysis;
use crate::resources::{OptimizationSuggestion, SystemHealth};
use crate::stage::{StageExecutionResult, StageIndex, StageStatus};
use crate::util::{duration_millis, option_duration_millis};

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Planning,
    /// Executing the phase with this id.
    ExecutingPhase(usize),
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Planning => write!(f, "planning"),
            Self::ExecutingPhase(k) => write!(f, "executing phase {}", k),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Point-in-time view of a run, produced by the engine after every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub current_phase: usize,
    pub total_phases: usize,
    pub total_stages: usize,
    pub running_stages: Vec<StageIndex>,
    pub completed_stages: Vec<StageIndex>,
    pub failed_stages: Vec<StageIndex>,
    pub skipped_stages: Vec<StageIndex>,
    /// Completed stages as a percentage of all stages.
    pub progress_percent: f64,
    /// Stages currently in flight, including ones waiting out a retry delay.
    pub active_threads: usize,
    pub concurrency_limit: usize,
    /// 0-100.
    pub efficiency: f64,
    #[serde(rename = "elapsed_ms", with = "duration_millis")]
    pub elapsed: Duration,
    #[serde(
        rename = "estimated_time_remaining_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub estimated_time_remaining: Option<Duration>,
}

impl ExecutionProgress {
    pub fn new(total_stages: usize, total_phases: usize) -> Self {
        Self {
            current_phase: 0,
            total_phases,
            total_stages,
            running_stages: Vec::new(),
            completed_stages: Vec::new(),
            failed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            progress_percent: 0.0,
            active_threads: 0,
            concurrency_limit: 0,
            efficiency: 0.0,
            elapsed: Duration::ZERO,
            estimated_time_remaining: None,
        }
    }

    /// Stages that reached a terminal status.
    pub fn processed(&self) -> usize {
        self.completed_stages.len() + self.failed_stages.len() + self.skipped_stages.len()
    }

    pub fn is_finished(&self) -> bool {
        self.total_stages == self.processed()
    }
}

/// Everything a caller gets back from one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    /// One entry per stage, ordered by stage index, every entry terminal.
    pub results: Vec<StageExecutionResult>,
    pub graph: DependencyGraph,
    pub plan: ExecutionPlan,
    pub errors: ErrorAnalysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_progress: Option<DetailedProgress>,
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
    /// Highest number of stages observed in flight at once.
    pub peak_concurrency: usize,
    /// Mean of success rate and time efficiency, 0-100.
    pub overall_efficiency: f64,
    pub recommendations: Vec<String>,
    /// Resource health as sampled at the end of the run.
    pub health: SystemHealth,
    pub suggestions: Vec<OptimizationSuggestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl RunReport {
    fn count(&self, status: StageStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn completed(&self) -> usize {
        self.count(StageStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(StageStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(StageStatus::Skipped)
    }

    pub fn all_success(&self) -> bool {
        self.completed() == self.results.len()
    }

    pub fn result(&self, stage: StageIndex) -> Option<&StageExecutionResult> {
        self.results.get(stage)
    }

    /// Completed stages over all stages, 0-100. An empty run counts as 100.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 100.0;
        }
        self.completed() as f64 / self.results.len() as f64 * 100.0
    }

    /// Outputs of completed stages keyed by stage name.
    pub fn outputs(&self) -> BTreeMap<&str, &str> {
        self.results
            .iter()
            .filter_map(|r| Some((r.stage_name.as_str(), r.output.as_deref()?)))
            .collect()
    }
}

/// Tracks execution timing on the runtime clock, so paused-time tests see exact values.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
