//! Sources of resource telemetry for the [`ResourceManager`](super::ResourceManager).

use sysinfo::System;

use super::MetricsUpdate;
use crate::dag::ExecutionProgress;

/// Produces a metrics update each time the engine asks for one.
///
/// Real implementation: [`SystemSampler`]. Deterministic default:
/// [`LoadModelSampler`]. Tests can pass any
/// `FnMut(&ExecutionProgress) -> MetricsUpdate` closure.
pub trait ResourceSampler: Send {
    fn sample(&mut self, progress: &ExecutionProgress) -> MetricsUpdate;
}

impl<F> ResourceSampler for F
where
    F: FnMut(&ExecutionProgress) -> MetricsUpdate + Send,
{
    fn sample(&mut self, progress: &ExecutionProgress) -> MetricsUpdate {
        self(progress)
    }
}

/// Synthetic load model: usage grows linearly with in-flight stages.
#[derive(Debug, Clone)]
pub struct LoadModelSampler {
    pub cpu_per_stage: f64,
    pub memory_per_stage: f64,
    pub base_latency_ms: f64,
    pub latency_per_stage_ms: f64,
}

impl Default for LoadModelSampler {
    fn default() -> Self {
        Self {
            cpu_per_stage: 25.0,
            memory_per_stage: 20.0,
            base_latency_ms: 100.0,
            latency_per_stage_ms: 10.0,
        }
    }
}

impl ResourceSampler for LoadModelSampler {
    fn sample(&mut self, progress: &ExecutionProgress) -> MetricsUpdate {
        let active = progress.active_threads as f64;
        MetricsUpdate {
            cpu_usage: Some((active * self.cpu_per_stage).min(90.0)),
            memory_usage: Some((active * self.memory_per_stage).min(85.0)),
            network_latency_ms: Some(self.base_latency_ms + active * self.latency_per_stage_ms),
            concurrent_requests: Some(progress.active_threads),
            ..MetricsUpdate::default()
        }
    }
}

/// Host CPU and memory usage via `sysinfo`. Latency and quota are left untouched.
pub struct SystemSampler {
    system: System,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self, progress: &ExecutionProgress) -> MetricsUpdate {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let memory = if total == 0 {
            None
        } else {
            Some(self.system.used_memory() as f64 / total as f64 * 100.0)
        };

        MetricsUpdate {
            cpu_usage: Some(f64::from(self.system.global_cpu_info().cpu_usage())),
            memory_usage: memory,
            concurrent_requests: Some(progress.active_threads),
            ..MetricsUpdate::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(active: usize) -> ExecutionProgress {
        ExecutionProgress {
            active_threads: active,
            ..ExecutionProgress::new(5, 2)
        }
    }

    #[test]
    fn test_load_model_is_deterministic_and_bounded() {
        let mut sampler = LoadModelSampler::default();
        let a = sampler.sample(&progress(2));
        let b = sampler.sample(&progress(2));
        assert_eq!(a, b);
        assert_eq!(a.cpu_usage, Some(50.0));
        assert_eq!(a.memory_usage, Some(40.0));
        assert_eq!(a.network_latency_ms, Some(120.0));

        let heavy = sampler.sample(&progress(10));
        assert_eq!(heavy.cpu_usage, Some(90.0));
        assert_eq!(heavy.memory_usage, Some(85.0));
    }

    #[test]
    fn test_closure_sampler() {
        let mut calls = 0;
        let mut sampler = |_: &ExecutionProgress| {
            calls += 1;
            MetricsUpdate {
                cpu_usage: Some(10.0),
                ..MetricsUpdate::default()
            }
        };
        let update = ResourceSampler::sample(&mut sampler, &progress(0));
        assert_eq!(update.cpu_usage, Some(10.0));
        drop(sampler);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_system_sampler_reports_percentages() {
        let mut sampler = SystemSampler::new();
        let update = sampler.sample(&progress(1));
        let cpu = update.cpu_usage.unwrap();
        assert!(cpu >= 0.0);
        if let Some(mem) = update.memory_usage {
            assert!((0.0..=100.0).contains(&mem));
        }
        assert_eq!(update.concurrent_requests, Some(1));
    }
}
