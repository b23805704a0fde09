//! Invariant registry commands: `gauntlet invariants` and `gauntlet learn`.

use std::sync::Arc;

use anyhow::{Result, bail};
use console::style;

use gauntlet::config::GauntletConfig;
use gauntlet::gates::CheckSpec;
use gauntlet::learning::{DecisionAction, Invariant, InvariantStatus, Learning, PromotionEngine};
use gauntlet::store::StateStore;

use super::super::InvariantsCommands;

/// Run id recorded for learnings entered from the command line.
const OPERATOR_RUN: &str = "operator";

fn styled_status(status: InvariantStatus) -> console::StyledObject<String> {
    match status {
        InvariantStatus::Active => style(status.to_string()).green(),
        InvariantStatus::Deprecated => style(status.to_string()).dim(),
    }
}

fn print_invariant_line(inv: &Invariant) {
    println!(
        "  {}  {:<10} {:.3}  {:<18} {}",
        inv.id,
        styled_status(inv.status),
        inv.confidence,
        inv.scope,
        inv.rule
    );
}

pub fn cmd_invariants(config: &GauntletConfig, command: Option<InvariantsCommands>) -> Result<i32> {
    let store = config.state_store();

    match command {
        None | Some(InvariantsCommands::List) => {
            let invariants = store.list_invariants()?;
            if invariants.is_empty() {
                println!("No invariants promoted yet.");
                return Ok(0);
            }
            println!();
            println!("{}", style("Invariants").bold().cyan());
            for inv in &invariants {
                print_invariant_line(inv);
            }
            println!();
            Ok(0)
        }
        Some(InvariantsCommands::Show { id }) => {
            let Some(inv) = store.load_invariant(&id)? else {
                bail!("Invariant '{}' not found", id);
            };
            println!();
            println!("id:          {}", inv.id);
            println!("rule:        {}", inv.rule);
            println!("scope:       {}", inv.scope);
            println!("status:      {}", styled_status(inv.status));
            println!("confidence:  {:.4}", inv.confidence);
            println!(
                "validations: {}  violations: {}",
                inv.validation_count, inv.violation_count
            );
            if let Some(check) = &inv.check {
                println!("check:       {}", check.describe());
            }
            if let Some(successor) = &inv.successor {
                println!("successor:   {}", successor);
            }
            println!();
            println!("Provenance:");
            for p in &inv.provenance {
                println!(
                    "  {} run={} gate={} confidence={:.2}{}",
                    p.observed_at.format("%Y-%m-%d %H:%M:%S"),
                    p.run_id,
                    p.gate_id,
                    p.confidence,
                    if p.operator_forced { " (forced)" } else { "" }
                );
            }
            println!();
            println!("History:");
            for entry in &inv.version_history {
                println!(
                    "  v{:<3} {:<10} {:.4} -> {:.4}  {}",
                    entry.version,
                    format!("{:?}", entry.kind),
                    entry.confidence_before,
                    entry.confidence_after,
                    entry.status_after
                );
            }
            println!();
            Ok(0)
        }
    }
}

pub fn cmd_learn(
    config: &GauntletConfig,
    observation: &str,
    confidence: f64,
    gate: &str,
    scope: &str,
    forbid: Option<&str>,
    force: bool,
) -> Result<i32> {
    if observation.trim().is_empty() {
        bail!("Observation must not be empty");
    }
    if !(0.0..=1.0).contains(&confidence) {
        bail!("Confidence must be between 0 and 1, got {}", confidence);
    }

    let mut learning = Learning::new(OPERATOR_RUN, gate, observation, confidence).with_scope(scope);
    if let Some(pattern) = forbid {
        let check = CheckSpec::ForbidPattern {
            pattern: pattern.to_string(),
            message: Some(observation.trim().to_string()),
        };
        check.compile(&learning.invariant_id())?;
        learning = learning.with_check(check);
    }
    if force {
        learning = learning.forced();
    }

    let store: Arc<dyn StateStore> = Arc::new(config.state_store());
    let engine = PromotionEngine::new(store, config.promotion_policy()?);
    let decision = engine.process(&learning)?;

    let action = match decision.action {
        DecisionAction::Promote => style(decision.action.as_str()).green().bold(),
        DecisionAction::Accept => style(decision.action.as_str()).yellow(),
        DecisionAction::Reject => style(decision.action.as_str()).red(),
    };
    println!("{} (confidence {:.2})", action, decision.confidence);
    if let Some(id) = &decision.invariant_id {
        println!("invariant: {}", id);
    }
    Ok(0)
}
