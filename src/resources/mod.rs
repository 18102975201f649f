//! Resource pressure tracking and concurrency advice.
//!
//! The manager never throws and never touches engine state: it takes metric
//! updates, turns them into a normalized stress score, and answers questions
//! ("how many stages now?", "which pending stages fit?") that the engine is
//! free to ignore.

mod sampler;

pub use sampler::{LoadModelSampler, ResourceSampler, SystemSampler};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::{DependencyGraph, ExecutionProgress};
use crate::stage::{Priority, StageIndex};

const MAX_HISTORY: usize = 100;
const ALLOCATION_FLOOR: f64 = 0.1;
const SLOW_BASELINE: Duration = Duration::from_secs(120);
const HEAVY_BASELINE: Duration = Duration::from_secs(90);

/// Latest observed resource usage. Percentages are 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_latency_ms: f64,
    pub remote_quota: u32,
    pub concurrent_requests: usize,
    pub max_concurrent_requests: usize,
    pub timestamp: DateTime<Utc>,
}

/// Partial metrics update; `None` fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub network_latency_ms: Option<f64>,
    pub remote_quota: Option<u32>,
    pub concurrent_requests: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_cpu_usage: f64,
    pub max_memory_usage: f64,
    pub max_network_latency_ms: f64,
    pub min_remote_quota: u32,
    /// Quota at which api stress reaches zero.
    pub quota_ceiling: u32,
    pub initial_remote_quota: u32,
    pub max_concurrent_requests: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_usage: 80.0,
            max_memory_usage: 75.0,
            max_network_latency_ms: 5000.0,
            min_remote_quota: 10,
            quota_ceiling: 100,
            initial_remote_quota: 1000,
            max_concurrent_requests: 3,
        }
    }
}

/// Thresholds and multipliers for concurrency recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    pub hard_shrink_above: f64,
    pub hard_shrink_factor: f64,
    pub soft_shrink_above: f64,
    pub soft_shrink_factor: f64,
    pub grow_below: f64,
    pub grow_factor: f64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            hard_shrink_above: 0.8,
            hard_shrink_factor: 0.7,
            soft_shrink_above: 0.6,
            soft_shrink_factor: 0.85,
            grow_below: 0.4,
            grow_factor: 1.3,
        }
    }
}

/// Per-dimension stress in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStress {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub api: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatedUsage {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub stage_index: StageIndex,
    pub priority_score: i32,
    pub weight: f64,
    pub estimated_usage: EstimatedUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    IncreaseConcurrency,
    DecreaseConcurrency,
    PauseExecution,
    RetryFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub kind: SuggestionKind,
    pub reason: String,
    pub impact: Impact,
    pub recommendation: String,
    /// Rough expected improvement, in percent.
    pub expected_improvement: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    /// 0-100, higher is healthier.
    pub score: u8,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub current: ResourceMetrics,
    pub stress: ResourceStress,
    pub average_stress: f64,
    pub peak_cpu_usage: f64,
    pub peak_memory_usage: f64,
    pub samples: usize,
    /// Running-mean duration per stage, in milliseconds.
    pub baselines_ms: BTreeMap<StageIndex, u64>,
}

fn ratio(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return if value > 0.0 { 1.0 } else { 0.0 };
    }
    (value / limit).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct ResourceManager {
    limits: ResourceLimits,
    policy: ScalingPolicy,
    metrics: ResourceMetrics,
    history: VecDeque<(ResourceMetrics, f64)>,
    baselines: BTreeMap<StageIndex, Duration>,
    priorities: BTreeMap<StageIndex, Priority>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ResourceLimits::default(), ScalingPolicy::default())
    }
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits, policy: ScalingPolicy) -> Self {
        Self {
            metrics: Self::initial_metrics(&limits),
            limits,
            policy,
            history: VecDeque::new(),
            baselines: BTreeMap::new(),
            priorities: BTreeMap::new(),
        }
    }

    fn initial_metrics(limits: &ResourceLimits) -> ResourceMetrics {
        ResourceMetrics {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            network_latency_ms: 0.0,
            remote_quota: limits.initial_remote_quota,
            concurrent_requests: 0,
            max_concurrent_requests: limits.max_concurrent_requests,
            timestamp: Utc::now(),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn metrics(&self) -> &ResourceMetrics {
        &self.metrics
    }

    /// Remember each stage's priority for allocation scoring.
    pub fn register_stages(&mut self, graph: &DependencyGraph) {
        self.priorities = graph.stages.iter().map(|s| (s.index, s.priority)).collect();
    }

    pub fn update_metrics(&mut self, update: MetricsUpdate) {
        let m = &mut self.metrics;
        if let Some(v) = update.cpu_usage {
            m.cpu_usage = v.clamp(0.0, 100.0);
        }
        if let Some(v) = update.memory_usage {
            m.memory_usage = v.clamp(0.0, 100.0);
        }
        if let Some(v) = update.network_latency_ms {
            m.network_latency_ms = v.max(0.0);
        }
        if let Some(v) = update.remote_quota {
            m.remote_quota = v;
        }
        if let Some(v) = update.concurrent_requests {
            m.concurrent_requests = v;
        }
        m.timestamp = Utc::now();

        let overall = self.stress().overall;
        self.history.push_back((self.metrics.clone(), overall));
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    /// Each dimension normalized against its configured limit; `overall` is the mean.
    pub fn stress(&self) -> ResourceStress {
        let m = &self.metrics;
        let l = &self.limits;
        let cpu = ratio(m.cpu_usage, l.max_cpu_usage);
        let memory = ratio(m.memory_usage, l.max_memory_usage);
        let network = ratio(m.network_latency_ms, l.max_network_latency_ms);
        let api = 1.0 - ratio(f64::from(m.remote_quota), f64::from(l.quota_ceiling));
        ResourceStress {
            cpu,
            memory,
            network,
            api,
            overall: (cpu + memory + network + api) / 4.0,
        }
    }

    /// Suggested concurrency given the current level. Never below 1.
    pub fn recommend_concurrency(&self, current: usize, progress: &ExecutionProgress) -> usize {
        let overall = self.stress().overall;
        let p = &self.policy;
        let next = if overall > p.hard_shrink_above {
            (current as f64 * p.hard_shrink_factor).floor() as usize
        } else if overall > p.soft_shrink_above {
            (current as f64 * p.soft_shrink_factor).floor() as usize
        } else if overall < p.grow_below && progress.failed_stages.is_empty() {
            self.limits
                .max_concurrent_requests
                .min((current as f64 * p.grow_factor).ceil() as usize)
        } else {
            current
        };
        let next = next.max(1);
        if next != current {
            debug!(current, next, stress = overall, "Concurrency recommendation changed");
        }
        next
    }

    fn priority_score(&self, stage: StageIndex) -> i32 {
        let bonus = match self.priorities.get(&stage).copied().unwrap_or_default() {
            Priority::Critical => 30,
            Priority::High => 20,
            Priority::Medium => 10,
            Priority::Low => 0,
        };
        let penalty = match self.baselines.get(&stage) {
            Some(d) if *d > SLOW_BASELINE => 10,
            _ => 0,
        };
        50 + bonus - penalty
    }

    fn estimate_usage(&self, stage: StageIndex) -> EstimatedUsage {
        let mut usage = EstimatedUsage {
            cpu: 0.3,
            memory: 0.2,
            network: 0.4,
        };
        if self.baselines.get(&stage).is_some_and(|d| *d > HEAVY_BASELINE) {
            usage.cpu += 0.2;
            usage.memory += 0.1;
        }
        usage.cpu = usage.cpu.min(1.0);
        usage.memory = usage.memory.min(1.0);
        usage.network = usage.network.min(1.0);
        usage
    }

    /// Rank pending stages and hand out weight until `1 - current_load` is spent.
    pub fn allocate(&self, pending: &[StageIndex], current_load: f64) -> Vec<ResourceAllocation> {
        let mut ranked: Vec<(StageIndex, i32)> = pending
            .iter()
            .map(|&s| (s, self.priority_score(s)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut remaining = (1.0 - current_load).clamp(0.0, 1.0);
        let mut allocations = Vec::new();
        for (stage_index, priority_score) in ranked {
            if remaining <= 0.0 {
                break;
            }
            let estimated_usage = self.estimate_usage(stage_index);
            let demand =
                (estimated_usage.cpu + estimated_usage.memory + estimated_usage.network) / 3.0;
            let weight = remaining.min(demand);
            if weight < ALLOCATION_FLOOR {
                continue;
            }
            remaining -= weight;
            allocations.push(ResourceAllocation {
                stage_index,
                priority_score,
                weight,
                estimated_usage,
            });
        }
        allocations
    }

    /// Fold a completed stage's duration into its running mean.
    pub fn update_performance_baseline(&mut self, stage: StageIndex, duration: Duration) {
        self.baselines
            .entry(stage)
            .and_modify(|b| *b = (*b + duration) / 2)
            .or_insert(duration);
    }

    pub fn baseline(&self, stage: StageIndex) -> Option<Duration> {
        self.baselines.get(&stage).copied()
    }

    pub fn analyze(&self, progress: &ExecutionProgress) -> Vec<OptimizationSuggestion> {
        let stress = self.stress();
        let failed = progress.failed_stages.len();
        let mut out = Vec::new();

        if stress.cpu > 0.8 {
            out.push(OptimizationSuggestion {
                kind: SuggestionKind::DecreaseConcurrency,
                reason: format!("CPU stress at {:.0}%", stress.cpu * 100.0),
                impact: Impact::High,
                recommendation: "Run fewer stages at once".into(),
                expected_improvement: 20.0,
            });
        }
        if stress.memory > 0.8 {
            out.push(OptimizationSuggestion {
                kind: SuggestionKind::DecreaseConcurrency,
                reason: format!("Memory stress at {:.0}%", stress.memory * 100.0),
                impact: Impact::High,
                recommendation: "Run fewer stages at once to free memory".into(),
                expected_improvement: 15.0,
            });
        }
        if stress.network > 0.7 {
            out.push(OptimizationSuggestion {
                kind: SuggestionKind::PauseExecution,
                reason: format!("Network latency {:.0}ms", self.metrics.network_latency_ms),
                impact: Impact::Medium,
                recommendation: "Pause briefly until latency recovers".into(),
                expected_improvement: 25.0,
            });
        }
        if self.metrics.remote_quota < self.limits.min_remote_quota {
            out.push(OptimizationSuggestion {
                kind: SuggestionKind::PauseExecution,
                reason: format!("Remote quota down to {}", self.metrics.remote_quota),
                impact: Impact::High,
                recommendation: "Pause until quota resets or switch credentials".into(),
                expected_improvement: 100.0,
            });
        }
        if stress.overall < 0.5 && failed == 0 {
            out.push(OptimizationSuggestion {
                kind: SuggestionKind::IncreaseConcurrency,
                reason: format!("Overall stress only {:.0}%", stress.overall * 100.0),
                impact: Impact::Medium,
                recommendation: "Run more stages at once".into(),
                expected_improvement: 30.0,
            });
        }
        if failed > 0 && stress.overall < 0.6 {
            out.push(OptimizationSuggestion {
                kind: SuggestionKind::RetryFailed,
                reason: format!("{} failed stage(s) with headroom available", failed),
                impact: Impact::Medium,
                recommendation: "Retry the failed stages".into(),
                expected_improvement: 50.0,
            });
        }
        out
    }

    pub fn system_health(&self) -> SystemHealth {
        let stress = self.stress();
        let score = ((1.0 - stress.overall) * 100.0).round().clamp(0.0, 100.0) as u8;
        let status = if score > 80 {
            HealthStatus::Healthy
        } else if score > 60 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        };

        let mut issues = Vec::new();
        if stress.cpu > 0.9 {
            issues.push("CPU usage near limit".to_string());
        }
        if stress.memory > 0.9 {
            issues.push("Memory usage near limit".to_string());
        }
        if stress.network > 0.8 {
            issues.push("Network latency high".to_string());
        }
        if self.metrics.remote_quota < self.limits.min_remote_quota {
            issues.push("Remote quota nearly exhausted".to_string());
        }

        SystemHealth {
            status,
            score,
            issues,
        }
    }

    pub fn stats(&self) -> ResourceStats {
        let samples = self.history.len();
        let average_stress = if samples == 0 {
            self.stress().overall
        } else {
            self.history.iter().map(|(_, s)| s).sum::<f64>() / samples as f64
        };
        let peak = |f: fn(&ResourceMetrics) -> f64| {
            self.history
                .iter()
                .map(|(m, _)| f(m))
                .fold(f(&self.metrics), f64::max)
        };

        ResourceStats {
            current: self.metrics.clone(),
            stress: self.stress(),
            average_stress,
            peak_cpu_usage: peak(|m| m.cpu_usage),
            peak_memory_usage: peak(|m| m.memory_usage),
            samples,
            baselines_ms: self
                .baselines
                .iter()
                .map(|(k, d)| (*k, d.as_millis() as u64))
                .collect(),
        }
    }

    /// Forget metrics history and baselines; limits and policy are kept.
    pub fn reset(&mut self) {
        self.metrics = Self::initial_metrics(&self.limits);
        self.history.clear();
        self.baselines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_with_failures(failed: usize) -> ExecutionProgress {
        ExecutionProgress {
            failed_stages: (0..failed).collect(),
            ..ExecutionProgress::new(10, 3)
        }
    }

    fn manager_at(cpu: f64, memory: f64, latency: f64, quota: u32) -> ResourceManager {
        let mut rm = ResourceManager::default();
        rm.update_metrics(MetricsUpdate {
            cpu_usage: Some(cpu),
            memory_usage: Some(memory),
            network_latency_ms: Some(latency),
            remote_quota: Some(quota),
            concurrent_requests: None,
        });
        rm
    }

    #[test]
    fn test_initial_state_is_unstressed() {
        let rm = ResourceManager::default();
        let stress = rm.stress();
        assert_eq!(stress.overall, 0.0);
        assert_eq!(rm.metrics().remote_quota, 1000);
    }

    #[test]
    fn test_stress_normalized_against_limits() {
        let rm = manager_at(40.0, 75.0, 10_000.0, 50);
        let stress = rm.stress();
        assert!((stress.cpu - 0.5).abs() < 1e-9);
        assert!((stress.memory - 1.0).abs() < 1e-9);
        assert!((stress.network - 1.0).abs() < 1e-9);
        assert!((stress.api - 0.5).abs() < 1e-9);
        assert!((stress.overall - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_stress_dimensions_stay_in_unit_range() {
        let rm = manager_at(100.0, 100.0, 1e9, 0);
        let s = rm.stress();
        for v in [s.cpu, s.memory, s.network, s.api, s.overall] {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_recommendation_hard_shrink() {
        let rm = manager_at(80.0, 75.0, 5000.0, 0);
        assert!(rm.stress().overall > 0.8);
        assert_eq!(rm.recommend_concurrency(3, &progress_with_failures(0)), 2);
        assert_eq!(rm.recommend_concurrency(1, &progress_with_failures(0)), 1);
    }

    #[test]
    fn test_recommendation_soft_shrink() {
        let rm = manager_at(80.0, 75.0, 5000.0, 100);
        assert!((rm.stress().overall - 0.75).abs() < 1e-9);
        // floor(4 * 0.85) = 3
        assert_eq!(rm.recommend_concurrency(4, &progress_with_failures(0)), 3);
    }

    #[test]
    fn test_recommendation_grows_only_without_failures() {
        let rm = ResourceManager::default();
        // ceil(2 * 1.3) = 3, limited to max_concurrent_requests = 3
        assert_eq!(rm.recommend_concurrency(2, &progress_with_failures(0)), 3);
        assert_eq!(rm.recommend_concurrency(3, &progress_with_failures(0)), 3);
        assert_eq!(rm.recommend_concurrency(2, &progress_with_failures(1)), 2);
    }

    #[test]
    fn test_recommendation_unchanged_in_middle_band() {
        let rm = manager_at(40.0, 37.5, 2500.0, 50);
        assert!((rm.stress().overall - 0.5).abs() < 1e-9);
        assert_eq!(rm.recommend_concurrency(3, &progress_with_failures(0)), 3);
    }

    #[test]
    fn test_allocation_prefers_priority_and_respects_budget() {
        let mut rm = ResourceManager::default();
        let graph = crate::dag::DependencyAnalyzer::default()
            .analyze(&["Identify weaknesses", "Analyze basic facts", "Misc"]);
        rm.register_stages(&graph);

        let allocations = rm.allocate(&[0, 1, 2], 0.0);
        assert_eq!(allocations[0].stage_index, 1);
        assert_eq!(allocations[0].priority_score, 80);
        let total: f64 = allocations.iter().map(|a| a.weight).sum();
        assert!(total <= 1.0 + 1e-9);
        assert!(allocations.iter().all(|a| a.weight >= 0.1));
    }

    #[test]
    fn test_allocation_skips_below_floor() {
        let rm = ResourceManager::default();
        // 0.95 load leaves 0.05, below the 0.1 floor
        assert!(rm.allocate(&[0, 1], 0.95).is_empty());
    }

    #[test]
    fn test_slow_baseline_penalizes_and_raises_usage() {
        let mut rm = ResourceManager::default();
        rm.update_performance_baseline(0, Duration::from_secs(200));
        let a = rm.allocate(&[0], 0.0);
        assert_eq!(a[0].priority_score, 50);
        assert!((a[0].estimated_usage.cpu - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_baseline_running_mean() {
        let mut rm = ResourceManager::default();
        rm.update_performance_baseline(1, Duration::from_secs(60));
        rm.update_performance_baseline(1, Duration::from_secs(120));
        assert_eq!(rm.baseline(1), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_suggestions() {
        let rm = manager_at(80.0, 75.0, 5000.0, 5);
        let kinds: Vec<SuggestionKind> = rm
            .analyze(&progress_with_failures(0))
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                SuggestionKind::DecreaseConcurrency,
                SuggestionKind::DecreaseConcurrency,
                SuggestionKind::PauseExecution,
                SuggestionKind::PauseExecution,
            ]
        );

        let idle = ResourceManager::default();
        let kinds: Vec<SuggestionKind> = idle
            .analyze(&progress_with_failures(2))
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(kinds, vec![SuggestionKind::RetryFailed]);
    }

    #[test]
    fn test_system_health() {
        assert_eq!(
            ResourceManager::default().system_health().status,
            HealthStatus::Healthy
        );
        let stressed = manager_at(80.0, 75.0, 5000.0, 0);
        let health = stressed.system_health();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.score, 0);
        assert_eq!(health.issues.len(), 4);
    }

    #[test]
    fn test_stats_and_reset() {
        let mut rm = manager_at(60.0, 30.0, 100.0, 500);
        rm.update_metrics(MetricsUpdate {
            cpu_usage: Some(20.0),
            ..MetricsUpdate::default()
        });
        rm.update_performance_baseline(0, Duration::from_millis(1500));
        let stats = rm.stats();
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.peak_cpu_usage, 60.0);
        assert_eq!(stats.baselines_ms.get(&0), Some(&1500));

        rm.reset();
        let stats = rm.stats();
        assert_eq!(stats.samples, 0);
        assert!(stats.baselines_ms.is_empty());
        assert_eq!(rm.metrics().remote_quota, 1000);
    }
}
