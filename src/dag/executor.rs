//! Parallel engine: runs an execution plan phase by phase.
//!
//! One run is driven by a single task. Every dispatched attempt (and every
//! pending retry, delay included) lives in one `FuturesUnordered`; the loop
//! that polls it is the only writer of run state, so progress, resource
//! metrics and error bookkeeping need no locks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::analyzer::DependencyAnalyzer;
use super::builder::DependencyGraph;
use super::planner::{ExecutionPlan, ExecutionPlanner, Phase, PlannerSettings};
use super::state::{ExecutionProgress, ExecutionTimer, RunReport, RunState};
use crate::config::{FailureHandling, ProcessingConfig};
use crate::errors::{SchedulerError, StageError};
use crate::progress::{DetailedProgress, ProgressSettings, ProgressTracker};
use crate::recovery::{ErrorHandler, RecoveryAction, RecoveryStrategy};
use crate::resources::{
    LoadModelSampler, ResourceLimits, ResourceManager, ResourceSampler, ScalingPolicy,
};
use crate::stage::{StageExecutionResult, StageIndex, StageStatus};

/// Per-attempt information handed to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    pub stage_name: String,
    /// 1-based.
    pub attempt: u32,
    pub timeout: Duration,
    /// Set after a parsing failure: decode the response leniently.
    pub lenient_decode: bool,
    pub params: Arc<BTreeMap<String, String>>,
}

/// The external call that performs one stage.
///
/// Must tolerate being called several times for the same stage and input;
/// any error is a failed attempt, classified by its message.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        stage_index: StageIndex,
        input: &str,
        ctx: &StageContext,
    ) -> anyhow::Result<String>;
}

/// Receives a detailed snapshot after every settled attempt and every phase.
/// Must return quickly.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &DetailedProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&DetailedProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &DetailedProgress) {
        self(progress)
    }
}

/// Shared stop flag for one run. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching. In-flight stages are marked failed and dropped,
    /// undispatched stages are skipped.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Everything scoped to one run: stage list, extra parameters, stop flag
/// and resource sampler.
pub struct RunContext {
    pub stages: Vec<String>,
    pub params: BTreeMap<String, String>,
    stop: StopHandle,
    sampler: Box<dyn ResourceSampler>,
}

impl RunContext {
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
            params: BTreeMap::new(),
            stop: StopHandle::new(),
            sampler: Box::new(LoadModelSampler::default()),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_sampler(mut self, sampler: impl ResourceSampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        stages: usize,
        phases: usize,
    },
    PhaseStarted {
        phase: usize,
        stages: Vec<StageIndex>,
        concurrency: usize,
    },
    StageStarted {
        stage: StageIndex,
        name: String,
        phase: usize,
    },
    StageRetrying {
        stage: StageIndex,
        name: String,
        /// The attempt that just failed.
        attempt: u32,
        error: String,
        strategy: String,
        delay_ms: u64,
    },
    StageCompleted {
        stage: StageIndex,
        name: String,
        attempt: u32,
        duration_ms: u64,
    },
    StageFailed {
        stage: StageIndex,
        name: String,
        attempt: u32,
        error: String,
    },
    StageSkipped {
        stage: StageIndex,
        name: String,
        reason: String,
    },
    ConcurrencyAdjusted {
        from: usize,
        to: usize,
        stress: f64,
    },
    PhaseCompleted {
        phase: usize,
        completed: usize,
        failed: usize,
    },
    RunFinished {
        state: RunState,
        completed: usize,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
    },
}

/// Runs stage lists through analysis, planning and bounded parallel execution.
pub struct ParallelEngine {
    executor: Arc<dyn StageExecutor>,
    config: ProcessingConfig,
    analyzer: DependencyAnalyzer,
    planner_settings: PlannerSettings,
    limits: ResourceLimits,
    scaling: ScalingPolicy,
    progress_settings: ProgressSettings,
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    event_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl ParallelEngine {
    pub fn new(executor: Arc<dyn StageExecutor>, config: ProcessingConfig) -> Self {
        let progress_settings = ProgressSettings {
            ideal_concurrency: config.concurrency_cap(),
            ..ProgressSettings::default()
        };
        Self {
            executor,
            config,
            analyzer: DependencyAnalyzer::default(),
            planner_settings: PlannerSettings::default(),
            limits: ResourceLimits::default(),
            scaling: ScalingPolicy::default(),
            progress_settings,
            strategies: Vec::new(),
            event_tx: None,
            sink: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: DependencyAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Planner tuning. `enable_dynamic_scaling` always follows the processing config.
    pub fn with_planner_settings(mut self, settings: PlannerSettings) -> Self {
        self.planner_settings = settings;
        self
    }

    /// Resource thresholds. `max_concurrent_requests` always follows the processing config.
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_scaling_policy(mut self, policy: ScalingPolicy) -> Self {
        self.scaling = policy;
        self
    }

    pub fn with_progress_settings(mut self, settings: ProgressSettings) -> Self {
        self.progress_settings = settings;
        self
    }

    /// Add a recovery strategy on top of the built-ins.
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_progress_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &DependencyAnalyzer {
        &self.analyzer
    }

    fn planner(&self) -> ExecutionPlanner {
        ExecutionPlanner::new(PlannerSettings {
            enable_dynamic_scaling: self.config.enable_dynamic_scaling,
            ..self.planner_settings.clone()
        })
    }

    /// Graph and plan for `stages` without running anything.
    pub fn plan(&self, stages: &[String]) -> Result<(DependencyGraph, ExecutionPlan), SchedulerError> {
        let graph = self.analyzer.analyze(stages);
        let plan = self.planner().plan(&graph, self.config.concurrency_cap())?;
        Ok((graph, plan))
    }

    /// Analyze `ctx.stages`, plan, and run every stage against `input`.
    ///
    /// Only construction defects (cycles, unsatisfiable dependencies) are
    /// returned as errors; stage failures end up in the report.
    pub async fn execute(&self, input: &str, ctx: RunContext) -> Result<RunReport, SchedulerError> {
        let graph = self.analyzer.analyze(&ctx.stages);
        self.execute_graph(graph, input, ctx).await
    }

    /// Run a prebuilt graph, e.g. one from [`GraphBuilder`](super::GraphBuilder).
    /// `ctx.stages` is ignored.
    pub async fn execute_graph(
        &self,
        graph: DependencyGraph,
        input: &str,
        ctx: RunContext,
    ) -> Result<RunReport, SchedulerError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("stagehand_run", %run_id, stages = graph.len());
        async move {
            debug!(state = %RunState::Planning, "Planning run");
            let plan = self.planner().plan(&graph, self.config.concurrency_cap())?;
            info!(
                phases = plan.total_phases(),
                estimated_secs = plan.estimated_total_time.as_secs(),
                gain = %format!("{:.1}%", graph.efficiency_gain_percent()),
                "Execution plan ready"
            );
            let run = Run::new(self, run_id, graph, plan, input, ctx);
            Ok(run.drive().await)
        }
        .instrument(span)
        .await
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).ok();
        }
    }
}

struct AttemptOutcome {
    stage: StageIndex,
    attempt: u32,
    started: DateTime<Utc>,
    elapsed: Duration,
    result: Result<String, StageError>,
}

enum Step {
    Settled(AttemptOutcome),
    Stopped,
    Drained,
}

/// Mutable state of one run.
struct Run<'a> {
    engine: &'a ParallelEngine,
    run_id: Uuid,
    graph: DependencyGraph,
    plan: ExecutionPlan,
    input: Arc<str>,
    params: Arc<BTreeMap<String, String>>,
    stop: StopHandle,
    sampler: Box<dyn ResourceSampler>,
    state: RunState,
    results: Vec<StageExecutionResult>,
    timeouts: Vec<Duration>,
    lenient: Vec<bool>,
    dispatched_at: Vec<Option<Instant>>,
    running: BTreeSet<StageIndex>,
    resources: ResourceManager,
    errors: ErrorHandler,
    tracker: Option<ProgressTracker>,
    last_progress: Option<DetailedProgress>,
    concurrency: usize,
    peak: usize,
    timer: ExecutionTimer,
    abort_reason: Option<String>,
}

impl<'a> Run<'a> {
    fn new(
        engine: &'a ParallelEngine,
        run_id: Uuid,
        graph: DependencyGraph,
        plan: ExecutionPlan,
        input: &str,
        ctx: RunContext,
    ) -> Self {
        let config = &engine.config;
        let results = graph
            .stages
            .iter()
            .map(|s| StageExecutionResult::pending(s, plan.phase_of(s.index)))
            .collect();

        let mut errors = ErrorHandler::with_max_attempts(config.retry_attempts.saturating_add(1));
        for strategy in &engine.strategies {
            errors.add_strategy(Arc::clone(strategy));
        }

        // Growth is bounded by the configured concurrency, not the limits table
        let limits = ResourceLimits {
            max_concurrent_requests: config.concurrency_cap(),
            ..engine.limits.clone()
        };
        let mut resources = ResourceManager::new(limits, engine.scaling.clone());
        resources.register_stages(&graph);

        let tracker = config.enable_progress_tracking.then(|| {
            ProgressTracker::for_graph(&graph, engine.progress_settings.clone())
                .with_planned_duration(plan.estimated_total_time)
        });

        let n = graph.len();
        Self {
            engine,
            run_id,
            results,
            timeouts: vec![config.timeout_per_stage; n],
            lenient: vec![false; n],
            dispatched_at: vec![None; n],
            running: BTreeSet::new(),
            resources,
            errors,
            tracker,
            last_progress: None,
            concurrency: config.concurrency_cap(),
            peak: 0,
            timer: ExecutionTimer::start(),
            abort_reason: None,
            input: Arc::from(input),
            params: Arc::new(ctx.params),
            stop: ctx.stop,
            sampler: ctx.sampler,
            state: RunState::Idle,
            graph,
            plan,
        }
    }

    async fn drive(mut self) -> RunReport {
        self.engine.emit(EngineEvent::RunStarted {
            run_id: self.run_id,
            stages: self.graph.len(),
            phases: self.plan.total_phases(),
        });

        let phases = self.plan.phases.clone();
        for phase in &phases {
            if self.stop.is_stopped() || self.abort_reason.is_some() {
                break;
            }
            self.run_phase(phase).await;
            tokio::task::yield_now().await;
        }

        let stopped = self.stop.is_stopped();
        if let Some(reason) = self.abort_reason.clone() {
            self.skip_remaining(&format!("skipped: {}", reason));
        } else if stopped {
            self.skip_remaining("skipped: execution stopped before dispatch");
        }
        self.state = if stopped || self.abort_reason.is_some() {
            RunState::Aborted
        } else {
            RunState::Done
        };
        self.publish_progress();
        self.finish()
    }

    async fn run_phase(&mut self, phase: &Phase) {
        self.state = RunState::ExecutingPhase(phase.phase_id);
        self.adjust_concurrency(phase);
        let limit = phase.max_concurrency().min(self.concurrency).max(1);
        let mut queue = self.dispatch_order(phase);

        info!(
            phase = phase.phase_id,
            stages = ?phase.stages_to_execute,
            limit,
            "Starting phase"
        );
        self.engine.emit(EngineEvent::PhaseStarted {
            phase: phase.phase_id,
            stages: queue.iter().copied().collect(),
            concurrency: limit,
        });

        let stop = self.stop.clone();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, AttemptOutcome>> =
            FuturesUnordered::new();

        loop {
            while in_flight.len() < limit && self.abort_reason.is_none() && !stop.is_stopped() {
                let Some(stage) = queue.pop_front() else {
                    break;
                };
                self.dispatch(stage, phase.phase_id);
                in_flight.push(self.attempt(stage, 1, None));
            }
            self.peak = self.peak.max(in_flight.len());
            if in_flight.is_empty() {
                break;
            }

            let step = tokio::select! {
                biased;
                _ = stop.stopped() => Step::Stopped,
                Some(outcome) = in_flight.next() => Step::Settled(outcome),
                else => Step::Drained,
            };

            match step {
                Step::Settled(outcome) => {
                    if let Some(retry) = self.settle(outcome) {
                        in_flight.push(retry);
                    }
                    self.observe_resources(in_flight.len());
                    self.publish_progress();
                    if let Some(reason) = self.abort_reason.clone()
                        && !in_flight.is_empty()
                    {
                        self.cancel_in_flight(&format!("aborted: {}", reason));
                        in_flight.clear();
                    }
                }
                Step::Stopped => {
                    warn!(in_flight = in_flight.len(), "Stop requested");
                    self.cancel_in_flight("execution stopped by caller");
                    in_flight.clear();
                }
                Step::Drained => break,
            }
        }

        let (completed, failed) = phase
            .stages_to_execute
            .iter()
            .fold((0, 0), |(c, f), s| match self.results[*s].status {
                StageStatus::Completed => (c + 1, f),
                StageStatus::Failed => (c, f + 1),
                _ => (c, f),
            });
        info!(phase = phase.phase_id, completed, failed, "Phase finished");
        self.engine.emit(EngineEvent::PhaseCompleted {
            phase: phase.phase_id,
            completed,
            failed,
        });
        self.publish_progress();
    }

    /// Adopt the resource manager's recommendation, clamped to the configured bound.
    ///
    /// Resources are sampled first with the phase's planned dispatch count in
    /// flight, so the recommendation reflects the load the phase is about to add
    /// rather than the idle moment between phases.
    fn adjust_concurrency(&mut self, phase: &Phase) {
        let cap = self.engine.config.concurrency_cap();
        if !self.engine.config.enable_dynamic_scaling {
            self.concurrency = cap;
            return;
        }
        self.observe_resources(phase.max_concurrency().min(self.concurrency));
        let progress = self.snapshot();
        let next = self
            .resources
            .recommend_concurrency(self.concurrency, &progress)
            .clamp(1, cap);
        if next != self.concurrency {
            let stress = self.resources.stress().overall;
            info!(from = self.concurrency, to = next, stress, "Adjusting concurrency");
            self.engine.emit(EngineEvent::ConcurrencyAdjusted {
                from: self.concurrency,
                to: next,
                stress,
            });
            self.concurrency = next;
        }
    }

    /// Phase members ranked by the resource manager's allocation, then any
    /// member it had no budget for, by priority.
    fn dispatch_order(&self, phase: &Phase) -> VecDeque<StageIndex> {
        let members: Vec<StageIndex> = phase.stages_to_execute.iter().copied().collect();
        let load = self.resources.stress().overall;
        let mut order: Vec<StageIndex> = self
            .resources
            .allocate(&members, load)
            .into_iter()
            .map(|a| a.stage_index)
            .collect();

        let mut rest: Vec<StageIndex> = members
            .into_iter()
            .filter(|s| !order.contains(s))
            .collect();
        rest.sort_by(|a, b| {
            let pa = self.graph.stages[*a].priority;
            let pb = self.graph.stages[*b].priority;
            pb.cmp(&pa).then(a.cmp(b))
        });
        debug!(
            phase = phase.phase_id,
            allocated = ?order,
            unallocated = ?rest,
            load,
            "Dispatch order"
        );
        order.extend(rest);
        order.into()
    }

    fn observe_resources(&mut self, active: usize) {
        let progress = ExecutionProgress {
            active_threads: active,
            ..self.snapshot()
        };
        let update = self.sampler.sample(&progress);
        self.resources.update_metrics(update);
    }

    fn dispatch(&mut self, stage: StageIndex, phase_id: usize) {
        let name = self.graph.stages[stage].name.clone();
        let result = &mut self.results[stage];
        result.status = StageStatus::Running;
        result.attempt = 1;
        result.start_time = Some(Utc::now());
        self.dispatched_at[stage] = Some(Instant::now());
        self.running.insert(stage);

        debug!(stage, name = %name, phase = phase_id, "Dispatching stage");
        self.engine.emit(EngineEvent::StageStarted {
            stage,
            name,
            phase: phase_id,
        });
    }

    /// One attempt, raced against the stage's timeout, after an optional delay.
    fn attempt(
        &self,
        stage: StageIndex,
        attempt: u32,
        delay: Option<Duration>,
    ) -> BoxFuture<'static, AttemptOutcome> {
        let executor = Arc::clone(&self.engine.executor);
        let input = Arc::clone(&self.input);
        let ctx = StageContext {
            stage_name: self.graph.stages[stage].name.clone(),
            attempt,
            timeout: self.timeouts[stage],
            lenient_decode: self.lenient[stage],
            params: Arc::clone(&self.params),
        };
        let span = info_span!("stage", index = stage, name = %ctx.stage_name, attempt);

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let started = Utc::now();
            let clock = Instant::now();
            let result =
                match tokio::time::timeout(ctx.timeout, executor.execute(stage, &input, &ctx)).await
                {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(StageError::Failed(format!("{:#}", e))),
                    Err(_) => Err(StageError::TimedOut(ctx.timeout)),
                };
            AttemptOutcome {
                stage,
                attempt,
                started,
                elapsed: clock.elapsed(),
                result,
            }
        }
        .instrument(span)
        .boxed()
    }

    /// Record an attempt's outcome. Returns the retry attempt to schedule, if any.
    fn settle(&mut self, outcome: AttemptOutcome) -> Option<BoxFuture<'static, AttemptOutcome>> {
        let AttemptOutcome {
            stage,
            attempt,
            started,
            elapsed,
            result,
        } = outcome;
        let name = self.graph.stages[stage].name.clone();

        let message = match result {
            Ok(output) => {
                let duration = self.finish_stage(stage, StageStatus::Completed);
                let r = &mut self.results[stage];
                r.output = Some(output);
                r.error = None;
                r.attempt = attempt;
                self.resources.update_performance_baseline(stage, elapsed);
                info!(
                    stage,
                    name = %name,
                    attempt,
                    duration_ms = duration.as_millis() as u64,
                    "Stage completed"
                );
                self.engine.emit(EngineEvent::StageCompleted {
                    stage,
                    name,
                    attempt,
                    duration_ms: duration.as_millis() as u64,
                });
                return None;
            }
            Err(e) => e.message(),
        };

        let ctx = self.errors.record(stage, &name, &message, attempt);
        let recovery = self.errors.recover(&ctx);
        let within_bound = attempt <= self.engine.config.retry_attempts;

        if recovery.retry_recommended
            && within_bound
            && self.abort_reason.is_none()
            && !self.stop.is_stopped()
        {
            match recovery.action {
                Some(RecoveryAction::ExtendTimeout { factor }) => {
                    self.timeouts[stage] = self.timeouts[stage].mul_f64(factor.max(1.0));
                }
                Some(RecoveryAction::LenientDecode) => self.lenient[stage] = true,
                None => {}
            }
            let delay = recovery.delay_before_retry;
            warn!(
                stage,
                name = %name,
                attempt,
                kind = %ctx.kind,
                strategy = %recovery.strategy,
                delay_ms = delay.unwrap_or_default().as_millis() as u64,
                error = %message,
                "Stage attempt failed, retrying"
            );
            let r = &mut self.results[stage];
            r.attempt = attempt + 1;
            r.error = Some(message.clone());
            self.engine.emit(EngineEvent::StageRetrying {
                stage,
                name,
                attempt,
                error: message,
                strategy: recovery.strategy.clone(),
                delay_ms: delay.unwrap_or_default().as_millis() as u64,
            });
            return Some(self.attempt(stage, attempt + 1, delay));
        }

        self.finish_stage(stage, StageStatus::Failed);
        let r = &mut self.results[stage];
        r.error = Some(message.clone());
        r.attempt = attempt;
        error!(
            stage,
            name = %name,
            attempt,
            kind = %ctx.kind,
            started = %started,
            reason = %recovery.message,
            error = %message,
            "Stage failed"
        );
        self.engine.emit(EngineEvent::StageFailed {
            stage,
            name: name.clone(),
            attempt,
            error: message.clone(),
        });

        if self.engine.config.failure_handling == FailureHandling::Abort
            && self.abort_reason.is_none()
        {
            let reason = format!("stage {} ({}) failed: {}", stage, name, message);
            warn!(%reason, "Aborting run");
            self.abort_reason = Some(reason);
        }
        None
    }

    /// Move a running stage to a terminal status and stamp its end time.
    fn finish_stage(&mut self, stage: StageIndex, status: StageStatus) -> Duration {
        let duration = self.dispatched_at[stage]
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let r = &mut self.results[stage];
        r.status = status;
        r.end_time = Some(Utc::now());
        r.duration = Some(duration);
        self.running.remove(&stage);
        duration
    }

    fn cancel_in_flight(&mut self, reason: &str) {
        let running: Vec<StageIndex> = self.running.iter().copied().collect();
        for stage in running {
            self.finish_stage(stage, StageStatus::Failed);
            self.results[stage].error = Some(StageError::Cancelled(reason.to_string()).message());
            let name = self.graph.stages[stage].name.clone();
            warn!(stage, name = %name, reason, "Cancelled in-flight stage");
            self.engine.emit(EngineEvent::StageFailed {
                stage,
                name,
                attempt: self.results[stage].attempt,
                error: reason.to_string(),
            });
        }
    }

    fn skip_remaining(&mut self, reason: &str) {
        for stage in 0..self.results.len() {
            if self.results[stage].status != StageStatus::Pending {
                continue;
            }
            self.results[stage].skip(reason);
            let name = self.graph.stages[stage].name.clone();
            debug!(stage, name = %name, "Skipping stage");
            self.engine.emit(EngineEvent::StageSkipped {
                stage,
                name,
                reason: reason.to_string(),
            });
        }
    }

    fn snapshot(&self) -> ExecutionProgress {
        let mut progress = ExecutionProgress::new(self.graph.len(), self.plan.total_phases());
        for r in &self.results {
            match r.status {
                StageStatus::Completed => progress.completed_stages.push(r.stage_index),
                StageStatus::Failed => progress.failed_stages.push(r.stage_index),
                StageStatus::Skipped => progress.skipped_stages.push(r.stage_index),
                StageStatus::Running => progress.running_stages.push(r.stage_index),
                StageStatus::Pending => {}
            }
        }
        progress.current_phase = match self.state {
            RunState::ExecutingPhase(k) => k,
            RunState::Done | RunState::Aborted => self.plan.total_phases().saturating_sub(1),
            _ => 0,
        };
        progress.progress_percent = if self.graph.is_empty() {
            100.0
        } else {
            progress.completed_stages.len() as f64 / self.graph.len() as f64 * 100.0
        };
        progress.active_threads = self.running.len();
        progress.concurrency_limit = self.concurrency;
        progress.efficiency = self.stage_efficiency();
        progress.elapsed = self.timer.elapsed();

        let remaining: Duration = self
            .graph
            .stages
            .iter()
            .filter(|s| !self.results[s.index].is_terminal())
            .map(|s| s.estimated_duration)
            .sum();
        progress.estimated_time_remaining = Some(remaining / self.concurrency.max(1) as u32);
        progress
    }

    /// Completed stages' estimated time saved against their actual time, 0-100.
    fn stage_efficiency(&self) -> f64 {
        let (estimated, actual) = self
            .results
            .iter()
            .filter(|r| r.status == StageStatus::Completed)
            .fold((0.0, 0.0), |(e, a), r| {
                (
                    e + self.graph.stages[r.stage_index].estimated_duration.as_secs_f64(),
                    a + r.duration.unwrap_or_default().as_secs_f64(),
                )
            });
        if estimated <= 0.0 {
            return 0.0;
        }
        ((estimated - actual) / estimated * 100.0).clamp(0.0, 100.0)
    }

    fn publish_progress(&mut self) {
        let progress = self.snapshot();
        if let Some(tracker) = self.tracker.as_mut() {
            let detailed = tracker.on_progress(&progress);
            if let Some(ref sink) = self.engine.sink {
                sink.on_progress(&detailed);
            }
            self.last_progress = Some(detailed);
        }
    }

    fn finish(self) -> RunReport {
        let duration = self.timer.elapsed();
        let errors = self.errors.analyze();
        let health = self.resources.system_health();
        let suggestions = self.resources.analyze(&self.snapshot());

        let mut report = RunReport {
            run_id: self.run_id,
            state: self.state,
            results: self.results,
            graph: self.graph,
            plan: self.plan,
            errors,
            final_progress: self.last_progress,
            duration,
            peak_concurrency: self.peak,
            overall_efficiency: 0.0,
            recommendations: Vec::new(),
            health,
            suggestions,
            abort_reason: self.abort_reason,
        };

        let time_efficiency = time_efficiency(&report);
        report.overall_efficiency = (time_efficiency + report.success_rate()) / 2.0;

        if self.engine.config.enable_efficiency_monitoring {
            report.recommendations = recommendations(&report, &self.resources);
            info!(
                time_efficiency = %format!("{:.1}%", time_efficiency),
                success_rate = %format!("{:.1}%", report.success_rate()),
                overall = %format!("{:.1}%", report.overall_efficiency),
                "Efficiency report"
            );
        }

        info!(
            state = %report.state,
            completed = report.completed(),
            failed = report.failed(),
            skipped = report.skipped(),
            duration_ms = duration.as_millis() as u64,
            health = %report.health.status,
            "Run finished"
        );
        self.engine.emit(EngineEvent::RunFinished {
            state: report.state,
            completed: report.completed(),
            failed: report.failed(),
            skipped: report.skipped(),
            duration_ms: duration.as_millis() as u64,
        });
        report
    }
}

/// Sequential estimate saved by the actual stage time, 0-100.
fn time_efficiency(report: &RunReport) -> f64 {
    let expected = report.graph.total_sequential_time.as_secs_f64();
    if expected <= 0.0 {
        return 0.0;
    }
    let actual: f64 = report
        .results
        .iter()
        .filter_map(|r| r.duration)
        .map(|d| d.as_secs_f64())
        .sum();
    ((expected - actual) / expected * 100.0).clamp(0.0, 100.0)
}

fn recommendations(report: &RunReport, resources: &ResourceManager) -> Vec<String> {
    let mut out = Vec::new();

    for r in report.results.iter().filter(|r| r.status == StageStatus::Failed) {
        out.push(format!(
            "Stage {} ({}) failed: {}; check its input and re-run it",
            r.stage_index,
            r.stage_name,
            r.error.as_deref().unwrap_or("unknown error")
        ));
    }

    for r in &report.results {
        let estimate = report.graph.stages[r.stage_index].estimated_duration;
        if let Some(actual) = r.duration
            && !estimate.is_zero()
            && actual > estimate * 2
        {
            out.push(format!(
                "Stage {} took {:.1}s against an estimate of {}s; consider splitting it",
                r.stage_name,
                actual.as_secs_f64(),
                estimate.as_secs()
            ));
        }
    }

    if report.graph.len() > 1 && report.graph.efficiency_gain < 0.2 {
        out.push(format!(
            "Parallel gain is only {:.1}%; the stage list is mostly sequential",
            report.graph.efficiency_gain_percent()
        ));
    }

    let stats = resources.stats();
    if stats.average_stress > 0.6 {
        out.push(format!(
            "Average resource stress was {:.0}%; lower max_concurrent_stages",
            stats.average_stress * 100.0
        ));
    }

    for rec in &report.errors.recommendations {
        if !out.contains(rec) {
            out.push(rec.clone());
        }
    }
    out
}
