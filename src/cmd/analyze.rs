//! Graph and plan inspection - `stagehand analyze`, `stagehand plan`.

use anyhow::Result;
use console::style;
use serde_json::json;

use stagehand::dag::{AnalysisStats, DependencyGraph, ExecutionPlanner, PlannerSettings};
use stagehand::util::format_duration;

use super::{load_config, read_stages};
use crate::{Cli, StageInput};

fn stage_names(graph: &DependencyGraph, indices: impl IntoIterator<Item = usize>) -> String {
    indices
        .into_iter()
        .filter_map(|i| graph.stage(i).map(|s| s.name.clone()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn cmd_analyze(cli: &Cli, input: &StageInput) -> Result<()> {
    let toml = load_config(cli)?;
    let stages = read_stages(input)?;
    let graph = toml.analyzer()?.analyze(&stages);
    let stats = AnalysisStats::of(&graph);

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "graph": graph, "stats": stats }))?
        );
        return Ok(());
    }

    println!();
    println!("Dependency Graph");
    println!("================");
    println!();
    for stage in &graph.stages {
        let deps = if stage.dependencies.is_empty() {
            style("-".to_string()).dim().to_string()
        } else {
            stage_names(&graph, stage.dependencies.iter().copied())
        };
        println!(
            "  {:>2}. {} [{}, {}, ~{}]",
            stage.index,
            style(&stage.name).bold(),
            stage.complexity,
            stage.priority,
            format_duration(stage.estimated_duration)
        );
        println!("      after: {}", deps);
    }
    println!();

    if !graph.parallel_groups.is_empty() {
        println!("Parallel groups:");
        for group in &graph.parallel_groups {
            println!(
                "  {}: [{}] up to {} at once",
                group.group_id,
                stage_names(&graph, group.stages.iter().copied()),
                group.max_concurrency
            );
        }
        println!();
    }

    println!(
        "Critical path: {}",
        stage_names(&graph, graph.critical_path.iter().copied())
    );
    println!(
        "Sequential {} vs parallel {} ({} faster)",
        format_duration(graph.total_sequential_time),
        format_duration(graph.parallel_estimated_time),
        style(format!("{:.1}%", graph.efficiency_gain_percent())).green()
    );
    println!(
        "{} parallelizable, {} serial",
        stats.parallelizable_stages, stats.serial_stages
    );
    println!();
    Ok(())
}

pub fn cmd_plan(cli: &Cli, input: &StageInput) -> Result<()> {
    let toml = load_config(cli)?;
    let stages = read_stages(input)?;
    let graph = toml.analyzer()?.analyze(&stages);
    let planner = ExecutionPlanner::new(PlannerSettings {
        enable_dynamic_scaling: toml.processing.enable_dynamic_scaling,
        ..toml.planner.clone()
    });
    let plan = planner.plan(&graph, toml.processing.concurrency_cap())?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!();
    println!(
        "Execution plan: {} stages in {} phases, estimated {}",
        style(graph.len()).yellow().bold(),
        style(plan.total_phases()).yellow().bold(),
        format_duration(plan.estimated_total_time)
    );
    println!();
    for phase in &plan.phases {
        let parallel = if phase.stages_to_execute.len() > 1 {
            format!(" {}", style("(parallel)").dim())
        } else {
            String::new()
        };
        println!(
            "  Phase {} [{} priority, ~{}]: {}{}",
            style(phase.phase_id).cyan(),
            phase.priority,
            format_duration(phase.estimated_duration),
            stage_names(&graph, phase.stages_to_execute.iter().copied()),
            parallel
        );
    }
    println!();
    Ok(())
}
