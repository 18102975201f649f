//! Stage records and per-stage execution results.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::{duration_secs, option_duration_millis};

/// Dense index of a stage in the caller-supplied stage list.
pub type StageIndex = usize;

/// Estimated computational weight of a stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Numeric rank used when comparing "adjacent" complexities.
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Scheduling priority of a stage. Ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One named unit of work, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub index: StageIndex,
    pub name: String,
    #[serde(rename = "estimated_duration_secs", with = "duration_secs")]
    pub estimated_duration: Duration,
    pub complexity: Complexity,
    pub priority: Priority,
    /// Stages that must reach a terminal state before this one starts.
    pub dependencies: BTreeSet<StageIndex>,
    /// Reverse edges, derived from every other stage's `dependencies`.
    pub dependents: BTreeSet<StageIndex>,
    pub can_run_in_parallel: bool,
}

impl Stage {
    /// Whether every dependency of this stage is in `done`.
    pub fn dependencies_satisfied(&self, done: &BTreeSet<StageIndex>) -> bool {
        self.dependencies.iter().all(|d| done.contains(d))
    }
}

/// Lifecycle state of a stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result record for one stage, created `pending` when the plan is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionResult {
    pub stage_index: StageIndex,
    pub stage_name: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time of the final attempt.
    #[serde(
        rename = "duration_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub duration: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of dispatched attempts, 0 if the stage never ran.
    pub attempt: u32,
    /// Phase the stage was planned into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<usize>,
}

impl StageExecutionResult {
    pub fn pending(stage: &Stage, phase_id: Option<usize>) -> Self {
        Self {
            stage_index: stage.index,
            stage_name: stage.name.clone(),
            status: StageStatus::Pending,
            start_time: None,
            end_time: None,
            duration: None,
            output: None,
            error: None,
            attempt: 0,
            phase_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark a stage that was never dispatched as skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StageStatus::Skipped;
        self.error = Some(reason.into());
        self.end_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(index: StageIndex, deps: &[StageIndex]) -> Stage {
        Stage {
            index,
            name: format!("stage {}", index),
            estimated_duration: Duration::from_secs(60),
            complexity: Complexity::Medium,
            priority: Priority::Medium,
            dependencies: deps.iter().copied().collect(),
            dependents: BTreeSet::new(),
            can_run_in_parallel: true,
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_complexity_rank_is_adjacent() {
        assert_eq!(Complexity::High.rank() - Complexity::Medium.rank(), 1);
        assert_eq!(Complexity::Medium.rank() - Complexity::Low.rank(), 1);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(StageStatus::Completed.is_success());
        assert!(!StageStatus::Skipped.is_success());
    }

    #[test]
    fn test_dependencies_satisfied() {
        let s = stage(3, &[0, 2]);
        let mut done = BTreeSet::from([0]);
        assert!(!s.dependencies_satisfied(&done));
        done.insert(2);
        assert!(s.dependencies_satisfied(&done));
    }

    #[test]
    fn test_pending_result_then_skip() {
        let s = stage(1, &[0]);
        let mut result = StageExecutionResult::pending(&s, Some(1));
        assert_eq!(result.status, StageStatus::Pending);
        assert_eq!(result.attempt, 0);
        result.skip("upstream stage 0 failed");
        assert!(result.is_terminal());
        assert_eq!(result.error.as_deref(), Some("upstream stage 0 failed"));
    }

    #[test]
    fn test_stage_serializes_duration_in_seconds() {
        let json = serde_json::to_value(stage(0, &[])).unwrap();
        assert_eq!(json["estimated_duration_secs"], 60);
        assert_eq!(json["complexity"], "medium");
    }
}
