//! Simulated runs - `stagehand simulate`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use stagehand::analytics::{PerformanceAnalytics, PerformanceReport};
use stagehand::config::FailureHandling;
use stagehand::dag::{RunContext, RunReport, RunState, StageContext, StageExecutor};
use stagehand::stage::StageIndex;
use stagehand::ui::{RunUi, UiMode};

use super::{load_config, read_stages};
use crate::{Cli, StageInput};

/// Flags of the `simulate` subcommand beyond the stage list.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub input_text: String,
    pub latency_ms: u64,
    pub fail: Vec<usize>,
    pub flaky: Vec<usize>,
    pub retry_attempts: Option<u32>,
    pub failure_handling: Option<String>,
    pub ui: UiMode,
}

/// `--json` output: the run report with its performance summary alongside.
#[derive(Serialize)]
struct SimulationOutput<'a> {
    #[serde(flatten)]
    report: &'a RunReport,
    performance: &'a PerformanceReport,
}

/// Deterministic stand-in for a remote stage call.
///
/// Every attempt waits `latency`. Stages in `fail` always error; stages in
/// `flaky` return an undecodable response until lenient decoding is requested.
pub struct SimulatedExecutor {
    latency: Duration,
    fail: BTreeSet<StageIndex>,
    flaky: BTreeSet<StageIndex>,
}

impl SimulatedExecutor {
    pub fn new(latency: Duration, fail: &[StageIndex], flaky: &[StageIndex]) -> Self {
        Self {
            latency,
            fail: fail.iter().copied().collect(),
            flaky: flaky.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl StageExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        stage_index: StageIndex,
        input: &str,
        ctx: &StageContext,
    ) -> anyhow::Result<String> {
        tokio::time::sleep(self.latency).await;
        if self.fail.contains(&stage_index) {
            anyhow::bail!("simulated failure in stage {}", stage_index);
        }
        if self.flaky.contains(&stage_index) && !ctx.lenient_decode {
            anyhow::bail!("invalid JSON in simulated response");
        }
        Ok(format!(
            "{}: processed {} bytes on attempt {}",
            ctx.stage_name,
            input.len(),
            ctx.attempt
        ))
    }
}

pub async fn cmd_simulate(cli: &Cli, input: &StageInput, options: SimulateOptions) -> Result<()> {
    let mut config = load_config(cli)?;
    if let Some(n) = options.retry_attempts {
        config.processing.retry_attempts = n;
    }
    if let Some(policy) = &options.failure_handling {
        config.processing.failure_handling = policy.parse::<FailureHandling>()?;
    }
    let stages = read_stages(input)?;

    let executor = Arc::new(SimulatedExecutor::new(
        Duration::from_millis(options.latency_ms),
        &options.fail,
        &options.flaky,
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = config.engine(executor)?.with_event_channel(tx);

    // --json prints only the final report
    let mode = if cli.json {
        None
    } else {
        Some(options.ui)
    };
    let mut ui = mode.map(|m| RunUi::new(stages.len(), m, cli.verbose));
    if let Some(ref ui) = ui {
        let (graph, plan) = engine.plan(&stages)?;
        ui.print_plan(&graph, &plan);
    }

    let ctx = RunContext::new(stages);
    let stop = ctx.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let renderer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(ui) = ui.as_mut() {
                ui.handle_event(&event);
            }
        }
        ui
    });

    let report = engine.execute(&options.input_text, ctx).await?;
    ctrl_c.abort();
    drop(engine);
    let ui = renderer.await.context("UI task panicked")?;

    let mut analytics = PerformanceAnalytics::new();
    analytics.analyze_run(&report);
    let performance = analytics.generate_report(None);

    if cli.json {
        let output = SimulationOutput {
            report: &report,
            performance: &performance,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if let Some(ui) = ui {
        ui.print_report(&report);
        ui.print_health(&report, &performance);
    }

    if report.state == RunState::Aborted || report.failed() > 0 {
        anyhow::bail!(
            "Run {}: {} of {} stages failed",
            report.state,
            report.failed(),
            report.results.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx(lenient: bool) -> StageContext {
        StageContext {
            stage_name: "Parties".into(),
            attempt: 1,
            timeout: Duration::from_secs(1),
            lenient_decode: lenient,
            params: Arc::new(BTreeMap::new()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_executor_outcomes() {
        let executor = SimulatedExecutor::new(Duration::from_millis(5), &[1], &[2]);
        assert!(executor.execute(0, "abc", &ctx(false)).await.is_ok());
        assert!(executor.execute(1, "abc", &ctx(true)).await.is_err());

        let err = executor.execute(2, "abc", &ctx(false)).await.unwrap_err();
        assert!(err.to_string().contains("JSON"));
        let out = executor.execute(2, "abc", &ctx(true)).await.unwrap();
        assert_eq!(out, "Parties: processed 3 bytes on attempt 1");
    }
}
