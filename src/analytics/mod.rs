//! Cross-run performance analytics.
//!
//! [`PerformanceAnalytics`] keeps a bounded store of named metrics, classifies
//! each new sample's trend from the recent samples of the same metric, and
//! tracks a small set of targets. Runs feed it through [`PerformanceAnalytics::analyze_run`].

mod report;

pub use report::{
    AnalyticsExport, BenchmarkResult, PerformanceReport, QuickSummary, ReportSummary,
    ReportTrends,
};

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dag::{DependencyAnalyzer, ExecutionPlanner, RunReport};
use crate::errors::SchedulerError;
use crate::stage::{StageIndex, StageStatus};

const MAX_METRICS: usize = 10_000;
const TRIMMED_METRICS: usize = 5_000;
const TREND_SAMPLES: usize = 10;
const TARGET_SAMPLES: usize = 20;
const MAX_REPORTS: usize = 50;
const TRIMMED_REPORTS: usize = 25;
/// Window used by the quick summary.
const RECENT_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Ms,
    Percentage,
    Count,
    Ratio,
}

impl MetricUnit {
    /// Durations improve as they shrink.
    pub fn lower_is_better(self) -> bool {
        matches!(self, Self::Ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Speed,
    Efficiency,
    Reliability,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    #[default]
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Improving => write!(f, "improving"),
            Self::Degrading => write!(f, "degrading"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub category: MetricCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<StageIndex>,
    pub timestamp: DateTime<Utc>,
    pub trend: Trend,
}

/// A goal for one aggregate, fed by a fixed set of metric names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTarget {
    pub metric: String,
    pub target: f64,
    pub current: f64,
    pub achieved: bool,
    /// Change of `current` caused by the last relevant sample.
    pub improvement: f64,
    pub lower_is_better: bool,
    pub sources: Vec<String>,
}

impl PerformanceTarget {
    fn new(metric: &str, target: f64, lower_is_better: bool, sources: &[&str]) -> Self {
        Self {
            metric: metric.to_string(),
            target,
            current: 0.0,
            achieved: false,
            improvement: 0.0,
            lower_is_better,
            sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn evaluate(&mut self) {
        self.achieved = if self.lower_is_better {
            self.current > 0.0 && self.current <= self.target
        } else {
            self.current >= self.target
        };
    }
}

fn default_targets() -> Vec<PerformanceTarget> {
    vec![
        PerformanceTarget::new(
            "average_stage_time",
            60_000.0,
            true,
            &["average_stage_time", "stage_duration"],
        ),
        PerformanceTarget::new(
            "parallel_efficiency",
            70.0,
            false,
            &["parallel_efficiency", "efficiency_score"],
        ),
        PerformanceTarget::new("success_rate", 95.0, false, &["success_rate", "completion_rate"]),
        PerformanceTarget::new(
            "resource_utilization",
            80.0,
            false,
            &["cpu_usage", "memory_usage", "estimated_cpu_usage"],
        ),
    ]
}

/// Least-squares slope of `values` against their index.
pub fn linear_trend(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_xx: f64 = (0..values.len()).map(|i| (i * i) as f64).sum();
    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[derive(Debug, Clone)]
pub struct PerformanceAnalytics {
    metrics: Vec<PerformanceMetric>,
    reports: Vec<PerformanceReport>,
    benchmarks: Vec<BenchmarkResult>,
    targets: Vec<PerformanceTarget>,
    session_start: DateTime<Utc>,
}

impl Default for PerformanceAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceAnalytics {
    pub fn new() -> Self {
        Self {
            metrics: Vec::new(),
            reports: Vec::new(),
            benchmarks: Vec::new(),
            targets: default_targets(),
            session_start: Utc::now(),
        }
    }

    pub fn metrics(&self) -> &[PerformanceMetric] {
        &self.metrics
    }

    pub fn metrics_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PerformanceMetric> {
        self.metrics.iter().filter(move |m| m.name == name)
    }

    /// Record one sample and return the trend it was classified with.
    pub fn record_metric(
        &mut self,
        name: &str,
        value: f64,
        unit: MetricUnit,
        category: MetricCategory,
    ) -> Trend {
        self.record(name, value, unit, category, None)
    }

    pub fn record_stage_metric(
        &mut self,
        stage_index: StageIndex,
        name: &str,
        value: f64,
        unit: MetricUnit,
        category: MetricCategory,
    ) -> Trend {
        self.record(name, value, unit, category, Some(stage_index))
    }

    fn record(
        &mut self,
        name: &str,
        value: f64,
        unit: MetricUnit,
        category: MetricCategory,
        stage_index: Option<StageIndex>,
    ) -> Trend {
        let trend = self.classify(name, value, unit);
        self.metrics.push(PerformanceMetric {
            name: name.to_string(),
            value,
            unit,
            category,
            stage_index,
            timestamp: Utc::now(),
            trend,
        });
        self.update_targets(name);

        if self.metrics.len() > MAX_METRICS {
            let excess = self.metrics.len() - TRIMMED_METRICS;
            self.metrics.drain(..excess);
            debug!(kept = self.metrics.len(), "Trimmed metric store");
        }
        trend
    }

    /// Trend of the last samples of `name`, the new value included.
    /// Fewer than three samples are always stable.
    fn classify(&self, name: &str, value: f64, unit: MetricUnit) -> Trend {
        let mut recent: Vec<f64> = self
            .metrics
            .iter()
            .rev()
            .filter(|m| m.name == name)
            .take(TREND_SAMPLES - 1)
            .map(|m| m.value)
            .collect();
        recent.reverse();
        recent.push(value);
        if recent.len() < 3 {
            return Trend::Stable;
        }

        let mut slope = linear_trend(&recent);
        if unit.lower_is_better() {
            slope = -slope;
        }
        if slope > 0.1 {
            Trend::Improving
        } else if slope < -0.1 {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }

    fn update_targets(&mut self, name: &str) {
        for i in 0..self.targets.len() {
            if !self.targets[i].sources.iter().any(|s| s == name) {
                continue;
            }
            let current = {
                let sources = &self.targets[i].sources;
                let mut values: Vec<f64> = self
                    .metrics
                    .iter()
                    .rev()
                    .filter(|m| sources.contains(&m.name))
                    .take(TARGET_SAMPLES)
                    .map(|m| m.value)
                    .collect();
                values.reverse();
                mean(values.into_iter())
            };
            let target = &mut self.targets[i];
            target.improvement = current - target.current;
            target.current = current;
            target.evaluate();
        }
    }

    /// Record the standard metric set for one finished run.
    pub fn analyze_run(&mut self, report: &RunReport) {
        let total = report.results.len();
        let completed: Vec<Duration> = report
            .results
            .iter()
            .filter(|r| r.status == StageStatus::Completed)
            .filter_map(|r| r.duration)
            .collect();
        let average_ms = mean(completed.iter().map(|d| d.as_secs_f64() * 1000.0));
        let pct = |n: usize| {
            if total == 0 {
                100.0
            } else {
                n as f64 / total as f64 * 100.0
            }
        };

        use MetricCategory::*;
        use MetricUnit::*;

        // Speed
        self.record_metric(
            "total_execution_time",
            report.duration.as_secs_f64() * 1000.0,
            Ms,
            Speed,
        );
        self.record_metric("average_stage_time", average_ms, Ms, Speed);
        for r in report.results.iter().filter(|r| r.status == StageStatus::Completed) {
            if let Some(d) = r.duration {
                self.record_stage_metric(
                    r.stage_index,
                    "stage_duration",
                    d.as_secs_f64() * 1000.0,
                    Ms,
                    Speed,
                );
            }
        }

        // Counts
        self.record_metric("total_stages", total as f64, Count, Reliability);
        self.record_metric("completed_stages", report.completed() as f64, Count, Reliability);
        self.record_metric("failed_stages", report.failed() as f64, Count, Reliability);
        self.record_metric("completion_rate", pct(report.completed()), Percentage, Reliability);

        // Efficiency
        let efficiency = report
            .final_progress
            .as_ref()
            .map(|p| p.progress.efficiency)
            .unwrap_or(report.overall_efficiency);
        self.record_metric("parallel_efficiency", efficiency, Percentage, Efficiency);
        let utilization =
            report.peak_concurrency as f64 / report.plan.max_concurrency.max(1) as f64 * 100.0;
        self.record_metric("parallel_utilization", utilization.min(100.0), Percentage, Efficiency);
        let busy: f64 = report
            .results
            .iter()
            .filter_map(|r| r.duration)
            .map(|d| d.as_secs_f64())
            .sum();
        let wall = report.duration.as_secs_f64();
        let speedup = if busy > 0.0 && wall > 0.0 { busy / wall } else { 1.0 };
        self.record_metric("speedup_ratio", speedup, Ratio, Efficiency);

        // Reliability
        self.record_metric("success_rate", report.success_rate(), Percentage, Reliability);
        self.record_metric("failure_rate", pct(report.failed()), Percentage, Reliability);
        self.record_metric(
            "time_stability",
            (100.0 - coefficient_of_variation(&completed)).max(0.0),
            Percentage,
            Reliability,
        );

        // Resources
        self.record_metric("active_threads", report.peak_concurrency as f64, Count, Resource);
        self.record_metric(
            "estimated_cpu_usage",
            (report.peak_concurrency as f64 * 25.0).min(100.0),
            Percentage,
            Resource,
        );

        info!(
            run_id = %report.run_id,
            stages = total,
            success_rate = report.success_rate(),
            efficiency,
            "Recorded run analytics"
        );
    }

    /// Report over `range` (whole session when `None`).
    pub fn generate_report(
        &mut self,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> PerformanceReport {
        let now = Utc::now();
        let (start, end) = range.unwrap_or((self.session_start, now));
        let metrics: Vec<PerformanceMetric> = self
            .metrics
            .iter()
            .filter(|m| m.timestamp >= start && m.timestamp <= end)
            .cloned()
            .collect();

        let report = PerformanceReport::build(start, end, metrics, &self.targets);
        self.reports.push(report.clone());
        if self.reports.len() > MAX_REPORTS {
            let excess = self.reports.len() - TRIMMED_REPORTS;
            self.reports.drain(..excess);
        }
        report
    }

    pub fn reports(&self) -> &[PerformanceReport] {
        &self.reports
    }

    pub fn targets(&self) -> &[PerformanceTarget] {
        &self.targets
    }

    /// Change a target's goal. Returns false for an unknown target.
    pub fn set_target(&mut self, metric: &str, value: f64) -> bool {
        match self.targets.iter_mut().find(|t| t.metric == metric) {
            Some(target) => {
                target.target = value;
                target.evaluate();
                true
            }
            None => false,
        }
    }

    /// Estimated sequential against planned parallel time for `stages`,
    /// using the default analyzer and planner.
    pub fn benchmark<S: AsRef<str>>(
        &mut self,
        name: &str,
        stages: &[S],
        concurrency: usize,
    ) -> Result<BenchmarkResult, SchedulerError> {
        let graph = DependencyAnalyzer::default().analyze(stages);
        let plan = ExecutionPlanner::default().plan(&graph, concurrency)?;

        let sequential = graph.total_sequential_time;
        let parallel = plan.estimated_total_time;
        let speedup = if parallel.is_zero() {
            1.0
        } else {
            sequential.as_secs_f64() / parallel.as_secs_f64()
        };
        let result = BenchmarkResult::new(
            name,
            graph.len(),
            concurrency.max(1),
            sequential,
            parallel,
            speedup,
            plan.total_phases(),
        );

        self.record_metric("benchmark_speedup", speedup, MetricUnit::Ratio, MetricCategory::Efficiency);
        self.record_metric(
            "benchmark_efficiency",
            result.efficiency * 100.0,
            MetricUnit::Percentage,
            MetricCategory::Efficiency,
        );
        self.benchmarks.push(result.clone());
        Ok(result)
    }

    pub fn benchmarks(&self) -> &[BenchmarkResult] {
        &self.benchmarks
    }

    /// Scores over the last five minutes of samples.
    pub fn quick_summary(&self) -> QuickSummary {
        let cutoff = Utc::now() - chrono::Duration::seconds(RECENT_WINDOW_SECS);
        let recent: Vec<&PerformanceMetric> =
            self.metrics.iter().filter(|m| m.timestamp > cutoff).collect();
        QuickSummary::from_metrics(&recent, &self.targets)
    }

    pub fn export(&self) -> AnalyticsExport {
        AnalyticsExport {
            metrics: self.metrics.clone(),
            reports: self.reports.clone(),
            benchmarks: self.benchmarks.clone(),
            targets: self.targets.clone(),
            summary: self.quick_summary(),
        }
    }

    /// Drop all samples, reports and benchmarks. Targets keep their goals.
    pub fn clear(&mut self) {
        self.metrics.clear();
        self.reports.clear();
        self.benchmarks.clear();
        for target in &mut self.targets {
            target.current = 0.0;
            target.improvement = 0.0;
            target.evaluate();
        }
        self.session_start = Utc::now();
    }
}

/// Standard deviation over mean of the durations, as a percentage.
fn coefficient_of_variation(durations: &[Duration]) -> f64 {
    if durations.len() < 2 {
        return 0.0;
    }
    let values: Vec<f64> = durations.iter().map(|d| d.as_secs_f64()).collect();
    let m = mean(values.iter().copied());
    if m == 0.0 {
        return 0.0;
    }
    let variance = mean(values.iter().map(|v| (v - m).powi(2)));
    variance.sqrt() / m * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================
    // Trend classification
    // =========================================

    #[test]
    fn test_linear_trend() {
        assert_eq!(linear_trend(&[1.0, 2.0, 3.0, 4.0]), 1.0);
        assert_eq!(linear_trend(&[5.0, 5.0, 5.0]), 0.0);
        assert_eq!(linear_trend(&[7.0]), 0.0);
        assert!(linear_trend(&[3.0, 2.0, 1.0]) < 0.0);
    }

    #[test]
    fn test_first_samples_are_stable() {
        let mut analytics = PerformanceAnalytics::new();
        let t1 = analytics.record_metric("x", 1.0, MetricUnit::Percentage, MetricCategory::Efficiency);
        let t2 = analytics.record_metric("x", 50.0, MetricUnit::Percentage, MetricCategory::Efficiency);
        assert_eq!(t1, Trend::Stable);
        assert_eq!(t2, Trend::Stable);
    }

    #[test]
    fn test_rising_percentage_improves_rising_time_degrades() {
        let mut analytics = PerformanceAnalytics::new();
        let mut pct = Trend::Stable;
        let mut ms = Trend::Stable;
        for v in [10.0, 20.0, 30.0, 40.0] {
            pct = analytics.record_metric("eff", v, MetricUnit::Percentage, MetricCategory::Efficiency);
            ms = analytics.record_metric("time", v, MetricUnit::Ms, MetricCategory::Speed);
        }
        assert_eq!(pct, Trend::Improving);
        assert_eq!(ms, Trend::Degrading);
    }

    #[test]
    fn test_trend_uses_only_recent_samples() {
        let mut analytics = PerformanceAnalytics::new();
        for v in [100.0, 90.0, 80.0, 70.0, 60.0] {
            analytics.record_metric("rate", v, MetricUnit::Percentage, MetricCategory::Reliability);
        }
        // Ten flat samples push the decline out of the window
        let mut trend = Trend::Degrading;
        for _ in 0..10 {
            trend = analytics.record_metric("rate", 60.0, MetricUnit::Percentage, MetricCategory::Reliability);
        }
        assert_eq!(trend, Trend::Stable);
    }

    // =========================================
    // Targets
    // =========================================

    #[test]
    fn test_targets_follow_relevant_metrics() {
        let mut analytics = PerformanceAnalytics::new();
        analytics.record_metric("success_rate", 90.0, MetricUnit::Percentage, MetricCategory::Reliability);
        analytics.record_metric("completion_rate", 100.0, MetricUnit::Percentage, MetricCategory::Reliability);

        let target = analytics
            .targets()
            .iter()
            .find(|t| t.metric == "success_rate")
            .unwrap();
        assert_eq!(target.current, 95.0);
        assert_eq!(target.improvement, 5.0);
        assert!(target.achieved);
    }

    #[test]
    fn test_time_target_is_lower_is_better() {
        let mut analytics = PerformanceAnalytics::new();
        analytics.record_metric("average_stage_time", 30_000.0, MetricUnit::Ms, MetricCategory::Speed);
        let target = &analytics.targets()[0];
        assert!(target.achieved);

        assert!(analytics.set_target("average_stage_time", 10_000.0));
        assert!(!analytics.targets()[0].achieved);
        assert!(!analytics.set_target("nope", 1.0));
    }

    // =========================================
    // Store bounds, benchmark, clear
    // =========================================

    #[test]
    fn test_metric_store_is_trimmed() {
        let mut analytics = PerformanceAnalytics::new();
        for i in 0..=MAX_METRICS {
            analytics.record_metric("n", i as f64, MetricUnit::Count, MetricCategory::Resource);
        }
        assert_eq!(analytics.metrics().len(), TRIMMED_METRICS);
        assert_eq!(analytics.metrics().last().unwrap().value, MAX_METRICS as f64);
    }

    #[test]
    fn test_benchmark_independent_stages() {
        let mut analytics = PerformanceAnalytics::new();
        let result = analytics
            .benchmark("flat", &["alpha", "beta", "gamma"], 3)
            .unwrap();
        assert_eq!(result.stages, 3);
        assert!(result.speedup >= 1.0);
        assert_eq!(analytics.benchmarks().len(), 1);
        assert_eq!(analytics.metrics_named("benchmark_speedup").count(), 1);
    }

    #[test]
    fn test_clear_keeps_goals() {
        let mut analytics = PerformanceAnalytics::new();
        analytics.set_target("success_rate", 99.0);
        analytics.record_metric("success_rate", 100.0, MetricUnit::Percentage, MetricCategory::Reliability);
        analytics.generate_report(None);
        analytics.clear();

        assert!(analytics.metrics().is_empty());
        assert!(analytics.reports().is_empty());
        let target = analytics
            .targets()
            .iter()
            .find(|t| t.metric == "success_rate")
            .unwrap();
        assert_eq!(target.target, 99.0);
        assert_eq!(target.current, 0.0);
    }

    #[test]
    fn test_coefficient_of_variation() {
        let equal = [Duration::from_secs(2), Duration::from_secs(2)];
        assert_eq!(coefficient_of_variation(&equal), 0.0);
        let spread = [Duration::from_secs(1), Duration::from_secs(3)];
        assert!((coefficient_of_variation(&spread) - 50.0).abs() < 1e-9);
    }
}
