//! Terminal rendering of engine events.
//!
//! Three output modes:
//! - `full`: progress bars per running stage and phase markers
//! - `minimal`: one line per stage outcome
//! - `json`: one JSON event per line for machine consumption

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::analytics::PerformanceReport;
use crate::dag::{DependencyGraph, EngineEvent, ExecutionPlan, RunReport, RunState};
use crate::resources::{HealthStatus, Impact};
use crate::stage::{StageIndex, StageStatus};
use crate::ui::icons::{CHECK, CLOCK, CROSS, PHASE, RETRY, RUNNING, SCALE, SKIP, SPARKLE, WARN};
use crate::util::format_duration;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    /// Progress bars and colors
    Full,
    /// One line per outcome
    Minimal,
    /// JSON events
    Json,
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

/// Renders a run from its event stream.
///
/// Owned by the single task that drains the engine's event channel.
pub struct RunUi {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    stage_bars: HashMap<StageIndex, ProgressBar>,
    total_stages: usize,
    verbose: bool,
    term: Term,
}

impl RunUi {
    pub fn new(total_stages: usize, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_bar = multi.add(ProgressBar::new(total_stages as u64));
        header_bar.set_style(bar_style(
            "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ));
        header_bar.set_prefix("Stages");
        header_bar.set_message("Starting...");
        if mode != UiMode::Full {
            header_bar.finish_and_clear();
        }

        Self {
            mode,
            multi,
            header_bar,
            stage_bars: HashMap::new(),
            total_stages,
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn handle_event(&mut self, event: &EngineEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &EngineEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PhaseStarted { phase, stages, .. } => {
                let _ = writeln!(&self.term, "Phase {}: {:?}", phase, stages);
            }
            EngineEvent::StageCompleted { name, duration_ms, .. } => {
                let _ = writeln!(
                    &self.term,
                    "✓ {} ({})",
                    name,
                    format_duration(Duration::from_millis(*duration_ms))
                );
            }
            EngineEvent::StageFailed { name, error, .. } => {
                let _ = writeln!(&self.term, "✗ {} ({})", name, error);
            }
            EngineEvent::StageSkipped { name, .. } => {
                let _ = writeln!(&self.term, "- {}", name);
            }
            EngineEvent::RunFinished {
                state,
                completed,
                ..
            } => {
                let _ = writeln!(
                    &self.term,
                    "Done: {}/{} {}",
                    completed,
                    self.total_stages,
                    if *state == RunState::Done { "✓" } else { "✗" }
                );
            }
            _ => {}
        }
    }

    fn handle_full(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::RunStarted { phases, .. } => {
                self.header_bar
                    .set_message(format!("{} phases planned", phases));
            }
            EngineEvent::PhaseStarted {
                phase,
                stages,
                concurrency,
            } => self.on_phase_started(*phase, stages, *concurrency),
            EngineEvent::StageStarted { stage, name, .. } => self.on_stage_started(*stage, name),
            EngineEvent::StageRetrying {
                stage,
                name,
                attempt,
                error,
                delay_ms,
                ..
            } => self.on_stage_retrying(*stage, name, *attempt, error, *delay_ms),
            EngineEvent::StageCompleted {
                stage,
                name,
                attempt,
                duration_ms,
            } => self.on_stage_completed(*stage, name, *attempt, *duration_ms),
            EngineEvent::StageFailed {
                stage, name, error, ..
            } => self.on_stage_failed(*stage, name, error),
            EngineEvent::StageSkipped { name, reason, .. } => {
                self.header_bar.inc(1);
                if self.verbose {
                    self.multi
                        .println(format!("  {} {} {}", SKIP, style(name).dim(), style(reason).dim()))
                        .ok();
                }
            }
            EngineEvent::ConcurrencyAdjusted { from, to, stress } => {
                self.multi
                    .println(format!(
                        "  {} Concurrency {} -> {} (stress {:.0}%)",
                        SCALE,
                        from,
                        style(to).yellow().bold(),
                        stress * 100.0
                    ))
                    .ok();
            }
            EngineEvent::PhaseCompleted {
                phase,
                completed,
                failed,
            } => self.on_phase_completed(*phase, *completed, *failed),
            EngineEvent::RunFinished { .. } => {
                self.header_bar.finish_and_clear();
            }
        }
    }

    fn on_phase_started(&self, phase: usize, stages: &[StageIndex], concurrency: usize) {
        self.multi.println("").ok();
        self.multi
            .println(format!(
                "{} {} Phase {} starting: {} stage(s), up to {} at once",
                PHASE,
                style("═".repeat(40)).cyan(),
                style(phase).yellow().bold(),
                stages.len(),
                concurrency
            ))
            .ok();
        self.header_bar.set_message(format!("phase {}", phase));
    }

    fn on_stage_started(&mut self, stage: StageIndex, name: &str) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner} {prefix:.bold} {msg} {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(name.to_string());
        bar.set_message(format!("{} running", RUNNING));
        bar.enable_steady_tick(Duration::from_millis(100));
        self.stage_bars.insert(stage, bar);
    }

    fn on_stage_retrying(
        &self,
        stage: StageIndex,
        name: &str,
        attempt: u32,
        error: &str,
        delay_ms: u64,
    ) {
        if let Some(bar) = self.stage_bars.get(&stage) {
            bar.set_message(format!(
                "{} retrying in {} (attempt {} failed)",
                RETRY,
                format_duration(Duration::from_millis(delay_ms)),
                attempt
            ));
        }
        if self.verbose {
            self.multi
                .println(format!(
                    "    {} {} attempt {}: {}",
                    WARN,
                    style(name).yellow(),
                    attempt,
                    style(error).dim()
                ))
                .ok();
        }
    }

    fn on_stage_completed(&mut self, stage: StageIndex, name: &str, attempt: u32, duration_ms: u64) {
        if let Some(bar) = self.stage_bars.remove(&stage) {
            bar.finish_and_clear();
        }
        self.header_bar.inc(1);
        let retries = if attempt > 1 {
            format!(" after {} attempts", attempt)
        } else {
            String::new()
        };
        self.multi
            .println(format!(
                "  {} {} {}{} ({})",
                CHECK,
                style(name).green().bold(),
                style("complete").green(),
                retries,
                format_duration(Duration::from_millis(duration_ms))
            ))
            .ok();
    }

    fn on_stage_failed(&mut self, stage: StageIndex, name: &str, error: &str) {
        if let Some(bar) = self.stage_bars.remove(&stage) {
            bar.finish_and_clear();
        }
        self.header_bar.inc(1);
        self.multi
            .println(format!(
                "  {} {} {}: {}",
                CROSS,
                style(name).red().bold(),
                style("failed").red(),
                error
            ))
            .ok();
    }

    fn on_phase_completed(&self, phase: usize, completed: usize, failed: usize) {
        let emoji = if failed == 0 { CHECK } else { CROSS };
        let failed_text = if failed > 0 {
            style(format!("{} failed", failed)).red().to_string()
        } else {
            style("0 failed").dim().to_string()
        };
        self.multi
            .println(format!(
                "{} Phase {}: {} succeeded, {}",
                emoji,
                phase,
                style(completed).green(),
                failed_text
            ))
            .ok();
    }

    /// Print the graph and plan before execution starts. Full mode only.
    pub fn print_plan(&self, graph: &DependencyGraph, plan: &ExecutionPlan) {
        if self.mode != UiMode::Full {
            return;
        }
        self.multi
            .println(format!("\n{} Execution plan", style("═".repeat(60)).cyan()))
            .ok();
        self.multi
            .println(format!(
                "  {} stages in {} phases, estimated {} ({:.1}% faster than sequential)",
                style(graph.len()).yellow().bold(),
                style(plan.total_phases()).yellow().bold(),
                format_duration(plan.estimated_total_time),
                graph.efficiency_gain_percent()
            ))
            .ok();
        for phase in &plan.phases {
            let names: Vec<&str> = phase
                .stages_to_execute
                .iter()
                .filter_map(|i| graph.stage(*i).map(|s| s.name.as_str()))
                .collect();
            let parallel = if names.len() > 1 {
                format!(" {}", style("(parallel)").dim())
            } else {
                String::new()
            };
            self.multi
                .println(format!(
                    "  Phase {}: [{}]{}",
                    style(phase.phase_id).cyan(),
                    style(names.join(", ")).yellow(),
                    parallel
                ))
                .ok();
        }
        self.multi.println("").ok();
    }

    /// Print the final summary of a run. Full and minimal modes.
    pub fn print_report(&self, report: &RunReport) {
        if self.mode == UiMode::Json {
            return;
        }
        let rule = style("═".repeat(60)).cyan().to_string();
        let _ = writeln!(&self.term);
        let _ = writeln!(&self.term, "{}", rule);
        if report.state == RunState::Done && report.failed() == 0 {
            let _ = writeln!(
                &self.term,
                "{} Run {} {}",
                SPARKLE,
                style("COMPLETE").green().bold(),
                SPARKLE
            );
        } else {
            let _ = writeln!(
                &self.term,
                "{} Run {} ({})",
                CROSS,
                style("FINISHED WITH FAILURES").red().bold(),
                report.state
            );
        }
        let _ = writeln!(&self.term, "{}", rule);

        let _ = writeln!(
            &self.term,
            "{} Stages: {}/{} completed",
            CLOCK,
            style(report.completed()).green().bold(),
            report.results.len()
        );
        if report.failed() > 0 {
            let _ = writeln!(&self.term, "     {} stages failed", style(report.failed()).red().bold());
        }
        if report.skipped() > 0 {
            let _ = writeln!(&self.term, "     {} stages skipped", style(report.skipped()).yellow());
        }
        let _ = writeln!(
            &self.term,
            "     Duration: {}  Peak concurrency: {}  Efficiency: {:.1}%",
            style(format_duration(report.duration)).cyan(),
            report.peak_concurrency,
            report.overall_efficiency
        );
        if let Some(reason) = &report.abort_reason {
            let _ = writeln!(&self.term, "     Aborted: {}", style(reason).red());
        }

        if self.verbose {
            let _ = writeln!(&self.term);
            let _ = writeln!(&self.term, "{}", style("Stage breakdown:").underlined());
            for r in &report.results {
                let status = match r.status {
                    StageStatus::Completed => style("✓").green(),
                    StageStatus::Skipped => style("-").yellow(),
                    _ => style("✗").red(),
                };
                let _ = writeln!(
                    &self.term,
                    "  {} {} - attempt {}, {}",
                    status,
                    r.stage_name,
                    r.attempt,
                    format_duration(r.duration.unwrap_or_default())
                );
            }
        }

        if !report.recommendations.is_empty() {
            let _ = writeln!(&self.term);
            let _ = writeln!(&self.term, "{}", style("Recommendations:").underlined());
            for rec in &report.recommendations {
                let _ = writeln!(&self.term, "  - {}", rec);
            }
        }
        let _ = writeln!(&self.term);
    }

    /// Print end-of-run resource health, tuning suggestions and the
    /// performance summary. Full and minimal modes.
    pub fn print_health(&self, report: &RunReport, performance: &PerformanceReport) {
        if self.mode == UiMode::Json {
            return;
        }
        let health = &report.health;
        let status = match health.status {
            HealthStatus::Healthy => style(health.status.to_string()).green(),
            HealthStatus::Warning => style(health.status.to_string()).yellow(),
            HealthStatus::Critical => style(health.status.to_string()).red(),
        };
        let _ = writeln!(
            &self.term,
            "{} Resources: {} (score {})",
            SCALE,
            status.bold(),
            health.score
        );
        for issue in &health.issues {
            let _ = writeln!(&self.term, "     {} {}", WARN, issue);
        }
        for suggestion in &report.suggestions {
            let impact = match suggestion.impact {
                Impact::High => style("high").red(),
                Impact::Medium => style("medium").yellow(),
                Impact::Low => style("low").dim(),
            };
            let _ = writeln!(
                &self.term,
                "     - {} [{} impact]: {}",
                suggestion.recommendation,
                impact,
                style(&suggestion.reason).dim()
            );
        }

        let summary = &performance.summary;
        let _ = writeln!(
            &self.term,
            "{} Performance: efficiency {}  reliability {}  avg stage {}  trend {}",
            SPARKLE,
            style(summary.efficiency_score).cyan(),
            style(summary.reliability_score).cyan(),
            format_duration(Duration::from_millis(summary.average_stage_time_ms)),
            performance.trends.performance
        );
        if self.verbose {
            for insight in &performance.insights {
                let _ = writeln!(&self.term, "     {}", style(insight).dim());
            }
        }
        for rec in &performance.recommendations {
            let _ = writeln!(&self.term, "     - {}", rec);
        }
        let _ = writeln!(&self.term);
    }
}
