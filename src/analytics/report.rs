//! Report types produced by [`PerformanceAnalytics`](super::PerformanceAnalytics).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MetricCategory, PerformanceMetric, PerformanceTarget, Trend, mean};
use crate::util::duration_millis;

/// Target average stage time for the speed score: 100 at or below, 0 at twice this.
const TARGET_STAGE_MS: f64 = 60_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_stages: u64,
    pub completed_stages: u64,
    pub failed_stages: u64,
    pub average_stage_time_ms: u64,
    pub total_time_ms: u64,
    pub efficiency_score: u8,
    pub reliability_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTrends {
    pub performance: Trend,
    pub reliability: Trend,
    pub efficiency: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub report_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub summary: ReportSummary,
    pub metrics: Vec<PerformanceMetric>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub trends: ReportTrends,
}

impl PerformanceReport {
    pub(super) fn build(
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        metrics: Vec<PerformanceMetric>,
        targets: &[PerformanceTarget],
    ) -> Self {
        let refs: Vec<&PerformanceMetric> = metrics.iter().collect();
        let summary = ReportSummary {
            total_stages: latest(&refs, "total_stages") as u64,
            completed_stages: latest(&refs, "completed_stages") as u64,
            failed_stages: latest(&refs, "failed_stages") as u64,
            average_stage_time_ms: average(&refs, "average_stage_time").round() as u64,
            total_time_ms: refs
                .iter()
                .filter(|m| m.name == "total_execution_time")
                .map(|m| m.value)
                .sum::<f64>()
                .round() as u64,
            efficiency_score: score(average(&refs, "parallel_efficiency")),
            reliability_score: score(average(&refs, "success_rate")),
        };
        let trends = ReportTrends {
            performance: overall_trend(refs.iter().copied().filter(|m| {
                matches!(m.category, MetricCategory::Speed | MetricCategory::Efficiency)
            })),
            reliability: overall_trend(
                refs.iter()
                    .copied()
                    .filter(|m| m.category == MetricCategory::Reliability),
            ),
            efficiency: overall_trend(
                refs.iter()
                    .copied()
                    .filter(|m| m.category == MetricCategory::Efficiency),
            ),
        };

        Self {
            report_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            range_start,
            range_end,
            summary,
            insights: insights(&refs),
            recommendations: recommendations(&refs, targets),
            trends,
            metrics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub benchmark_id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub stages: usize,
    pub concurrency: usize,
    pub phases: usize,
    #[serde(rename = "sequential_time_ms", with = "duration_millis")]
    pub sequential_time: Duration,
    #[serde(rename = "parallel_time_ms", with = "duration_millis")]
    pub parallel_time: Duration,
    pub speedup: f64,
    /// Speedup per unit of concurrency, 0-1.
    pub efficiency: f64,
}

impl BenchmarkResult {
    pub(super) fn new(
        name: &str,
        stages: usize,
        concurrency: usize,
        sequential_time: Duration,
        parallel_time: Duration,
        speedup: f64,
        phases: usize,
    ) -> Self {
        Self {
            benchmark_id: Uuid::new_v4(),
            name: name.to_string(),
            timestamp: Utc::now(),
            stages,
            concurrency,
            phases,
            sequential_time,
            parallel_time,
            speedup,
            efficiency: (speedup / concurrency as f64).min(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickSummary {
    pub overall_score: u8,
    pub efficiency: u8,
    pub reliability: u8,
    pub speed: u8,
    /// At most three.
    pub recommendations: Vec<String>,
}

impl QuickSummary {
    pub(super) fn from_metrics(metrics: &[&PerformanceMetric], targets: &[PerformanceTarget]) -> Self {
        let efficiency = average(metrics, "parallel_efficiency");
        let reliability = average(metrics, "success_rate");
        let speed = speed_score(average(metrics, "average_stage_time"));
        let mut recommendations = recommendations(metrics, targets);
        recommendations.truncate(3);
        Self {
            overall_score: score((efficiency + reliability + speed) / 3.0),
            efficiency: score(efficiency),
            reliability: score(reliability),
            speed: score(speed),
            recommendations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsExport {
    pub metrics: Vec<PerformanceMetric>,
    pub reports: Vec<PerformanceReport>,
    pub benchmarks: Vec<BenchmarkResult>,
    pub targets: Vec<PerformanceTarget>,
    pub summary: QuickSummary,
}

fn average(metrics: &[&PerformanceMetric], name: &str) -> f64 {
    mean(metrics.iter().filter(|m| m.name == name).map(|m| m.value))
}

fn latest(metrics: &[&PerformanceMetric], name: &str) -> f64 {
    metrics
        .iter()
        .rev()
        .find(|m| m.name == name)
        .map(|m| m.value)
        .unwrap_or(0.0)
}

fn score(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

/// 100 when no stage time is known yet.
fn speed_score(average_ms: f64) -> f64 {
    if average_ms == 0.0 {
        return 100.0;
    }
    ((2.0 * TARGET_STAGE_MS - average_ms) / TARGET_STAGE_MS * 100.0).clamp(0.0, 100.0)
}

fn overall_trend<'a>(metrics: impl Iterator<Item = &'a PerformanceMetric>) -> Trend {
    let (improving, degrading) = metrics.fold((0, 0), |(i, d), m| match m.trend {
        Trend::Improving => (i + 1, d),
        Trend::Degrading => (i, d + 1),
        Trend::Stable => (i, d),
    });
    match improving.cmp(&degrading) {
        std::cmp::Ordering::Greater => Trend::Improving,
        std::cmp::Ordering::Less => Trend::Degrading,
        std::cmp::Ordering::Equal => Trend::Stable,
    }
}

fn insights(metrics: &[&PerformanceMetric]) -> Vec<String> {
    let mut out = Vec::new();

    if metrics.iter().any(|m| m.name == "parallel_efficiency") {
        let efficiency = average(metrics, "parallel_efficiency");
        out.push(
            if efficiency > 80.0 {
                "Parallel execution is running at excellent efficiency"
            } else if efficiency > 60.0 {
                "Parallel execution is running at good efficiency"
            } else {
                "Parallel efficiency needs improvement"
            }
            .to_string(),
        );
    }

    if metrics.iter().any(|m| m.name == "success_rate") {
        let success = average(metrics, "success_rate");
        out.push(
            if success > 95.0 {
                "Excellent stage success rate"
            } else if success > 85.0 {
                "Good stage success rate"
            } else {
                "Stage success rate needs improvement"
            }
            .to_string(),
        );
    }

    match overall_trend(metrics.iter().copied()) {
        Trend::Improving => out.push("Overall performance is improving".to_string()),
        Trend::Degrading => out.push("Some performance indicators are degrading".to_string()),
        Trend::Stable => {}
    }
    out
}

fn recommendations(metrics: &[&PerformanceMetric], targets: &[PerformanceTarget]) -> Vec<String> {
    let mut out = Vec::new();

    if average(metrics, "parallel_efficiency") < 60.0 {
        out.push("Run more stages in parallel to raise efficiency".to_string());
        out.push("Review stage dependencies for further parallelism".to_string());
    }
    if average(metrics, "success_rate") < 90.0 {
        out.push("Strengthen error handling and retry settings".to_string());
        out.push("Review failed stages and their causes".to_string());
    }
    if average(metrics, "active_threads") < 2.0 {
        out.push("Raise max_concurrent_stages to use more parallel slots".to_string());
    }

    for target in targets.iter().filter(|t| !t.achieved) {
        out.push(format!(
            "Work towards target {}: current {:.1}, goal {}",
            target.metric, target.current, target.target
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::MetricUnit;

    fn metric(name: &str, value: f64, category: MetricCategory, trend: Trend) -> PerformanceMetric {
        PerformanceMetric {
            name: name.to_string(),
            value,
            unit: MetricUnit::Percentage,
            category,
            stage_index: None,
            timestamp: Utc::now(),
            trend,
        }
    }

    #[test]
    fn test_speed_score_bounds() {
        assert_eq!(speed_score(0.0), 100.0);
        assert_eq!(speed_score(60_000.0), 100.0);
        assert_eq!(speed_score(90_000.0), 50.0);
        assert_eq!(speed_score(200_000.0), 0.0);
    }

    #[test]
    fn test_overall_trend_majority() {
        let m = [
            metric("a", 1.0, MetricCategory::Speed, Trend::Improving),
            metric("b", 1.0, MetricCategory::Speed, Trend::Improving),
            metric("c", 1.0, MetricCategory::Speed, Trend::Degrading),
        ];
        assert_eq!(overall_trend(m.iter()), Trend::Improving);
        assert_eq!(overall_trend(m[1..].iter()), Trend::Stable);
        assert_eq!(overall_trend(std::iter::empty()), Trend::Stable);
    }

    #[test]
    fn test_report_from_good_metrics() {
        let metrics = vec![
            metric("parallel_efficiency", 85.0, MetricCategory::Efficiency, Trend::Stable),
            metric("success_rate", 100.0, MetricCategory::Reliability, Trend::Improving),
            metric("total_stages", 6.0, MetricCategory::Reliability, Trend::Stable),
            metric("active_threads", 3.0, MetricCategory::Resource, Trend::Stable),
        ];
        let now = Utc::now();
        let report = PerformanceReport::build(now, now, metrics, &[]);

        assert_eq!(report.summary.total_stages, 6);
        assert_eq!(report.summary.efficiency_score, 85);
        assert_eq!(report.summary.reliability_score, 100);
        assert!(report.recommendations.is_empty());
        assert_eq!(report.insights.len(), 3);
        assert_eq!(report.trends.reliability, Trend::Improving);
        assert_eq!(report.trends.efficiency, Trend::Stable);
    }

    #[test]
    fn test_quick_summary_caps_recommendations() {
        let metrics = [metric("success_rate", 50.0, MetricCategory::Reliability, Trend::Stable)];
        let refs: Vec<&PerformanceMetric> = metrics.iter().collect();
        let summary = QuickSummary::from_metrics(&refs, &[]);
        assert_eq!(summary.recommendations.len(), 3);
        assert_eq!(summary.reliability, 50);
        // no efficiency samples, speed defaults to 100
        assert_eq!(summary.overall_score, 50);
    }
}
