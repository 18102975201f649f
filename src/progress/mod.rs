//! Progress tracking on top of the engine's progress snapshots.
//!
//! [`ProgressTracker::on_progress`] is driven purely by the snapshots it is
//! given: all timing comes from `ExecutionProgress::elapsed`, never from a
//! clock, so replaying the same snapshots reproduces the same output.

mod alerts;

pub use alerts::{AlertKind, ProgressAlert};

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use alerts::AlertLog;
use crate::dag::{DependencyGraph, ExecutionProgress};
use crate::stage::{StageIndex, StageStatus};
use crate::util::{duration_millis, duration_secs, format_duration, option_duration_millis};

/// Thresholds and windows used by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    /// Concurrency assumed by the idealized efficiency baseline.
    pub ideal_concurrency: usize,
    #[serde(rename = "ideal_stage_time_secs", with = "duration_secs")]
    pub ideal_stage_time: Duration,
    #[serde(rename = "alert_dedup_window_secs", with = "duration_secs")]
    pub alert_dedup_window: Duration,
    pub low_efficiency_threshold: f64,
    pub low_efficiency_min_completed: usize,
    pub low_success_threshold: f64,
    pub high_error_min_failed: usize,
    pub milestone_every: usize,
    pub trend_window: usize,
    pub history_limit: usize,
    pub max_alerts: usize,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            ideal_concurrency: 3,
            ideal_stage_time: Duration::from_secs(60),
            alert_dedup_window: Duration::from_secs(30),
            low_efficiency_threshold: 50.0,
            low_efficiency_min_completed: 3,
            low_success_threshold: 80.0,
            high_error_min_failed: 2,
            milestone_every: 3,
            trend_window: 20,
            history_limit: 100,
            max_alerts: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    #[serde(rename = "elapsed_ms", with = "duration_millis")]
    pub elapsed: Duration,
    #[serde(rename = "estimated_total_ms", with = "duration_millis")]
    pub estimated_total: Duration,
    /// Estimated total minus elapsed, in seconds. Negative once the run
    /// overshoots its estimate.
    pub remaining_secs: f64,
    #[serde(rename = "average_stage_time_ms", with = "duration_millis")]
    pub average_stage_time: Duration,
    /// 0-100.
    pub efficiency: f64,
    pub throughput_per_minute: f64,
    /// Completed over processed stages, 0-100. 100 before anything settles.
    pub success_rate: f64,
}

impl ProgressMetrics {
    pub fn remaining(&self) -> Duration {
        Duration::from_secs_f64(self.remaining_secs.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgressDetail {
    pub stage_index: StageIndex,
    pub stage_name: String,
    pub status: StageStatus,
    #[serde(
        rename = "started_at_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub started_at: Option<Duration>,
    #[serde(
        rename = "finished_at_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub finished_at: Option<Duration>,
    #[serde(rename = "estimated_duration_secs", with = "duration_secs")]
    pub estimated_duration: Duration,
    pub progress_percent: f64,
}

/// Rolling series, one sample per progress update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressTrends {
    pub completion_count: VecDeque<f64>,
    pub average_stage_secs: VecDeque<f64>,
    pub efficiency: VecDeque<f64>,
    pub error_rate: VecDeque<f64>,
}

impl ProgressTrends {
    fn push(&mut self, window: usize, completed: f64, avg: f64, efficiency: f64, errors: f64) {
        for (series, value) in [
            (&mut self.completion_count, completed),
            (&mut self.average_stage_secs, avg),
            (&mut self.efficiency, efficiency),
            (&mut self.error_rate, errors),
        ] {
            series.push_back(value);
            while series.len() > window {
                series.pop_front();
            }
        }
    }
}

/// Engine snapshot enriched with metrics, per-stage detail, trends and active alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedProgress {
    #[serde(flatten)]
    pub progress: ExecutionProgress,
    pub metrics: ProgressMetrics,
    pub stage_details: Vec<StageProgressDetail>,
    pub trends: ProgressTrends,
    pub alerts: Vec<ProgressAlert>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressHealth {
    Critical,
    Warning,
    Good,
    Excellent,
}

impl fmt::Display for ProgressHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Warning => write!(f, "warning"),
            Self::Good => write!(f, "good"),
            Self::Excellent => write!(f, "excellent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub overall_progress: f64,
    pub efficiency: f64,
    pub eta: String,
    pub health: ProgressHealth,
    pub active_alerts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressExport {
    pub summary: ProgressSummary,
    pub history: Vec<ExecutionProgress>,
    pub metrics: Vec<ProgressMetrics>,
    pub trends: ProgressTrends,
    pub alerts: Vec<ProgressAlert>,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    settings: ProgressSettings,
    planned_duration: Option<Duration>,
    initial_details: Vec<StageProgressDetail>,
    details: Vec<StageProgressDetail>,
    history: VecDeque<ExecutionProgress>,
    metrics_history: VecDeque<ProgressMetrics>,
    trends: ProgressTrends,
    alerts: AlertLog,
    milestones: BTreeSet<usize>,
}

impl ProgressTracker {
    /// Tracker for `total_stages` anonymous stages.
    pub fn new(total_stages: usize, settings: ProgressSettings) -> Self {
        let details = (0..total_stages)
            .map(|i| StageProgressDetail {
                stage_index: i,
                stage_name: format!("Stage {}", i + 1),
                status: StageStatus::Pending,
                started_at: None,
                finished_at: None,
                estimated_duration: settings.ideal_stage_time,
                progress_percent: 0.0,
            })
            .collect();
        Self::with_details(details, settings)
    }

    /// Tracker that knows each stage's name and estimated duration.
    pub fn for_graph(graph: &DependencyGraph, settings: ProgressSettings) -> Self {
        let details = graph
            .stages
            .iter()
            .map(|s| StageProgressDetail {
                stage_index: s.index,
                stage_name: s.name.clone(),
                status: StageStatus::Pending,
                started_at: None,
                finished_at: None,
                estimated_duration: s.estimated_duration,
                progress_percent: 0.0,
            })
            .collect();
        Self::with_details(details, settings)
    }

    fn with_details(details: Vec<StageProgressDetail>, settings: ProgressSettings) -> Self {
        Self {
            alerts: AlertLog::new(settings.max_alerts, settings.alert_dedup_window),
            settings,
            planned_duration: None,
            initial_details: details.clone(),
            details,
            history: VecDeque::new(),
            metrics_history: VecDeque::new(),
            trends: ProgressTrends::default(),
            milestones: BTreeSet::new(),
        }
    }

    /// Use the plan's total estimate for time-remaining figures.
    pub fn with_planned_duration(mut self, planned: Duration) -> Self {
        self.planned_duration = Some(planned);
        self
    }

    pub fn settings(&self) -> &ProgressSettings {
        &self.settings
    }

    /// Fold one engine snapshot into the tracker.
    pub fn on_progress(&mut self, progress: &ExecutionProgress) -> DetailedProgress {
        self.update_stage_details(progress);
        let metrics = self.calculate_metrics(progress);

        let processed = progress.completed_stages.len() + progress.failed_stages.len();
        let error_rate = if processed == 0 {
            0.0
        } else {
            progress.failed_stages.len() as f64 / processed as f64 * 100.0
        };
        self.trends.push(
            self.settings.trend_window.max(1),
            progress.completed_stages.len() as f64,
            metrics.average_stage_time.as_secs_f64(),
            metrics.efficiency,
            error_rate,
        );

        self.generate_alerts(progress, &metrics);

        self.history.push_back(progress.clone());
        self.metrics_history.push_back(metrics.clone());
        while self.history.len() > self.settings.history_limit.max(1) {
            self.history.pop_front();
            self.metrics_history.pop_front();
        }

        DetailedProgress {
            progress: progress.clone(),
            metrics,
            stage_details: self.details.clone(),
            trends: self.trends.clone(),
            alerts: self.alerts.active(),
        }
    }

    fn update_stage_details(&mut self, progress: &ExecutionProgress) {
        let now = progress.elapsed;
        for &i in &progress.running_stages {
            if let Some(detail) = self.details.get_mut(i) {
                detail.status = StageStatus::Running;
                let started = *detail.started_at.get_or_insert(now);
                let estimate = detail.estimated_duration.as_secs_f64();
                detail.progress_percent = if estimate > 0.0 {
                    (now.saturating_sub(started).as_secs_f64() / estimate * 100.0)
                        .min(95.0)
                        .round()
                } else {
                    0.0
                };
            }
        }
        let settled = [
            (&progress.completed_stages, StageStatus::Completed),
            (&progress.failed_stages, StageStatus::Failed),
            (&progress.skipped_stages, StageStatus::Skipped),
        ];
        for (stages, status) in settled {
            for &i in stages {
                if let Some(detail) = self.details.get_mut(i)
                    && detail.status != status
                {
                    detail.status = status;
                    detail.finished_at = Some(now);
                    if status == StageStatus::Completed {
                        detail.progress_percent = 100.0;
                    }
                }
            }
        }
    }

    fn calculate_metrics(&self, progress: &ExecutionProgress) -> ProgressMetrics {
        let elapsed = progress.elapsed;
        let completed = progress.completed_stages.len();
        let processed = completed + progress.failed_stages.len();

        let average_stage_time = if processed > 0 {
            elapsed / processed as u32
        } else {
            Duration::ZERO
        };
        let estimated_total = self
            .planned_duration
            .unwrap_or(average_stage_time * progress.total_stages as u32);
        let remaining_secs = estimated_total.as_secs_f64() - elapsed.as_secs_f64();

        let minutes = elapsed.as_secs_f64() / 60.0;
        let throughput_per_minute = if minutes > 0.0 {
            processed as f64 / minutes
        } else {
            0.0
        };
        let success_rate = if processed > 0 {
            completed as f64 / processed as f64 * 100.0
        } else {
            100.0
        };

        ProgressMetrics {
            elapsed,
            estimated_total,
            remaining_secs,
            average_stage_time,
            efficiency: self.efficiency(progress),
            throughput_per_minute,
            success_rate,
        }
    }

    /// Actual progress relative to an idealized fixed-concurrency baseline, 0-100.
    fn efficiency(&self, progress: &ExecutionProgress) -> f64 {
        let ideal_secs = progress.total_stages as f64
            / self.settings.ideal_concurrency.max(1) as f64
            * self.settings.ideal_stage_time.as_secs_f64();
        if ideal_secs <= 0.0 {
            return 0.0;
        }
        let expected = (progress.elapsed.as_secs_f64() / ideal_secs).min(1.0);
        let actual = progress.progress_percent / 100.0;
        if expected > 0.0 {
            (actual / expected * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        }
    }

    fn generate_alerts(&mut self, progress: &ExecutionProgress, metrics: &ProgressMetrics) {
        let s = &self.settings;
        let completed = progress.completed_stages.len();
        let at = progress.elapsed;

        if metrics.efficiency < s.low_efficiency_threshold
            && completed >= s.low_efficiency_min_completed
        {
            self.alerts.raise(
                AlertKind::Warning,
                "efficiency-low",
                "Low efficiency".into(),
                format!("Processing efficiency dropped to {:.1}%", metrics.efficiency),
                None,
                at,
            );
        }

        if metrics.success_rate < s.low_success_threshold
            && progress.failed_stages.len() >= s.high_error_min_failed
        {
            self.alerts.raise(
                AlertKind::Error,
                "error-rate-high",
                "High error rate".into(),
                format!("Success rate dropped to {:.1}%", metrics.success_rate),
                progress.failed_stages.last().copied(),
                at,
            );
        }

        if metrics.remaining_secs < 0.0 && progress.progress_percent < 90.0 {
            self.alerts.raise(
                AlertKind::Warning,
                "time-overrun",
                "Running over estimate".into(),
                "The run is taking longer than estimated".into(),
                None,
                at,
            );
        }

        let every = self.settings.milestone_every;
        if every > 0 && completed > 0 && completed % every == 0 && self.milestones.insert(completed)
        {
            self.alerts.raise(
                AlertKind::Success,
                "milestone",
                format!("Milestone: {} stages", completed),
                format!("{} stages completed successfully", completed),
                None,
                at,
            );
        }
    }

    /// Mark an alert dismissed. It stays in the exported history.
    pub fn dismiss_alert(&mut self, id: &str) -> bool {
        self.alerts.dismiss(id)
    }

    pub fn alerts(&self) -> Vec<ProgressAlert> {
        self.alerts.all()
    }

    pub fn stage_detail(&self, stage: StageIndex) -> Option<&StageProgressDetail> {
        self.details.get(stage)
    }

    pub fn latest_metrics(&self) -> Option<&ProgressMetrics> {
        self.metrics_history.back()
    }

    pub fn summary(&self) -> ProgressSummary {
        let active = self.alerts.active();
        let (Some(metrics), Some(progress)) = (self.metrics_history.back(), self.history.back())
        else {
            return ProgressSummary {
                overall_progress: 0.0,
                efficiency: 0.0,
                eta: "unknown".into(),
                health: ProgressHealth::Good,
                active_alerts: active.len(),
            };
        };

        let has_error = active.iter().any(|a| a.kind == AlertKind::Error);
        let health = if has_error || metrics.success_rate < 70.0 {
            ProgressHealth::Critical
        } else if metrics.efficiency < 60.0 || metrics.success_rate < 85.0 {
            ProgressHealth::Warning
        } else if metrics.efficiency > 80.0 && metrics.success_rate > 95.0 {
            ProgressHealth::Excellent
        } else {
            ProgressHealth::Good
        };

        let remaining = metrics.remaining();
        let eta = if remaining.is_zero() || progress.is_finished() {
            "done".to_string()
        } else {
            format_duration(remaining)
        };

        ProgressSummary {
            overall_progress: progress.progress_percent,
            efficiency: metrics.efficiency,
            eta,
            health,
            active_alerts: active.len(),
        }
    }

    pub fn export(&self) -> ProgressExport {
        ProgressExport {
            summary: self.summary(),
            history: self.history.iter().cloned().collect(),
            metrics: self.metrics_history.iter().cloned().collect(),
            trends: self.trends.clone(),
            alerts: self.alerts.all(),
        }
    }

    /// Back to the freshly constructed state; stage names and settings are kept.
    pub fn reset(&mut self) {
        self.details = self.initial_details.clone();
        self.history.clear();
        self.metrics_history.clear();
        self.trends = ProgressTrends::default();
        self.alerts.clear();
        self.milestones.clear();
    }
}
