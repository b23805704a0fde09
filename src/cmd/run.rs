//! Run lifecycle commands: `gauntlet start`, `resume`, `status`, `cancel`
//! and `remediate`.

use std::sync::Arc;

use anyhow::Result;
use console::style;

use gauntlet::artifact::ArtifactStore;
use gauntlet::config::GauntletConfig;
use gauntlet::orchestrator::{Orchestrator, PipelineRun, RunResult, RunStatus};
use gauntlet::store::StateStore;

pub fn build_orchestrator(config: &GauntletConfig) -> Result<Orchestrator> {
    let table = config.gate_table()?;
    let policy = config.promotion_policy()?;
    let advisory = config.advisory_client()?;
    let store: Arc<dyn StateStore> = Arc::new(config.state_store());
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(config.artifact_store());
    Ok(Orchestrator::new(table, store, artifacts, advisory, policy))
}

fn styled_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        RunStatus::Complete | RunStatus::Passed => style(text).green(),
        RunStatus::Gutter => style(text).red().bold(),
        RunStatus::Running => style(text).cyan(),
        RunStatus::Pending => style(text).yellow(),
    }
}

fn print_result(result: &RunResult) {
    println!();
    println!("run_id: {}", result.run_id);
    println!("status: {}", styled_status(result.status));
    if result.cancelled {
        println!("{}", style("Run was cancelled.").yellow());
    }
    if !result.completed_gates.is_empty() {
        println!("passed: {}", result.completed_gates.join(", "));
    }
    if let Some(gate) = &result.current_gate_id
        && result.status != RunStatus::Complete
    {
        println!("gate:   {} (attempts: {})", gate, result.retry_count);
    }
    if let Some(record) = &result.escalation {
        println!();
        println!("{}", style("Escalated to operator").red().bold());
        print!("{}", record.render());
        println!();
        println!(
            "Fix the spec, then run 'gauntlet remediate {} --note <what changed>' and 'gauntlet resume {}'.",
            result.run_id, result.run_id
        );
    }
}

/// Log configuration warnings before gates run.
fn warn_on_config(config: &GauntletConfig) {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
}

pub async fn cmd_start(config: &GauntletConfig, spec: &str) -> Result<i32> {
    warn_on_config(config);
    let orchestrator = build_orchestrator(config)?;
    let run_id = orchestrator.start(spec)?;
    println!(
        "{} {} ({} gates)",
        style("Started run").bold(),
        run_id,
        orchestrator.table().len()
    );
    let result = orchestrator.resume(&run_id).await?;
    print_result(&result);
    Ok(result.exit_code())
}

pub async fn cmd_resume(config: &GauntletConfig, run_id: &str) -> Result<i32> {
    warn_on_config(config);
    let orchestrator = build_orchestrator(config)?;
    let result = orchestrator.resume(run_id).await?;
    print_result(&result);
    Ok(result.exit_code())
}

fn print_run(run: &PipelineRun) {
    println!("run_id:  {}", run.id);
    println!("spec:    {}", run.spec_reference);
    println!("status:  {}", styled_status(run.status));
    if run.cancelled {
        println!("cancelled: true");
    }
    if let Some(gate) = &run.current_gate_id {
        println!("gate:    {} (attempts: {})", gate, run.retry_count);
    }
    println!("version: {}", run.version);
    println!();
    println!("Gates:");
    for task in &run.tasks {
        println!("  {:<24} {}", task.id, task.status.as_str());
    }
    if !run.last_errors.is_empty() {
        println!();
        println!("Last errors:");
        for error in &run.last_errors {
            println!("  - {}", error);
        }
    }
    println!();
    println!("History:");
    for event in &run.history {
        println!(
            "  {} {:<20} {:<20} {}",
            event.at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", event.kind),
            event.gate_id.as_deref().unwrap_or("-"),
            event.detail
        );
    }
}

pub fn cmd_status(config: &GauntletConfig, run_id: Option<&str>) -> Result<i32> {
    let orchestrator = build_orchestrator(config)?;
    match run_id {
        Some(id) => {
            let run = orchestrator.status(id)?;
            println!();
            print_run(&run);
            let result = orchestrator.result(&run)?;
            if let Some(record) = &result.escalation {
                println!();
                print!("{}", record.render());
            }
            Ok(result.exit_code())
        }
        None => {
            let runs = orchestrator.list()?;
            if runs.is_empty() {
                println!("No runs yet. Start one with 'gauntlet start <spec>'.");
                return Ok(0);
            }
            println!();
            println!("{}", style("Runs").bold().cyan());
            for run in &runs {
                println!(
                    "  {}  {:<10} {:<20} {}",
                    run.id,
                    styled_status(run.status),
                    run.current_gate_id.as_deref().unwrap_or("-"),
                    run.spec_reference
                );
            }
            Ok(0)
        }
    }
}

pub fn cmd_cancel(config: &GauntletConfig, run_id: &str) -> Result<i32> {
    let orchestrator = build_orchestrator(config)?;
    let run = orchestrator.cancel(run_id)?;
    if run.cancelled {
        println!("{} run {}", style("Cancelled").yellow(), run_id);
    } else if run.status == RunStatus::Complete {
        println!("Run {} is already complete.", run_id);
    } else {
        println!(
            "{} run {} will stop before its next gate.",
            style("Cancel requested:").yellow(),
            run_id
        );
    }
    Ok(0)
}

pub fn cmd_remediate(config: &GauntletConfig, run_id: &str, note: &str) -> Result<i32> {
    let orchestrator = build_orchestrator(config)?;
    let run = orchestrator.remediate(run_id, note)?;
    println!(
        "{} gate {} of run {}",
        style("Remediated").green(),
        run.current_gate_id.as_deref().unwrap_or("-"),
        run_id
    );
    println!("Run 'gauntlet resume {}' to retry it.", run_id);
    Ok(0)
}
