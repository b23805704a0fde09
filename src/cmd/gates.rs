//! `gauntlet gates`.

use anyhow::Result;
use console::style;

use gauntlet::config::GauntletConfig;

pub fn cmd_gates(config: &GauntletConfig) -> Result<i32> {
    let table = config.gate_table()?;

    println!();
    println!("{}", style("Gate table").bold().cyan());
    for gate in table.gates() {
        println!();
        println!(
            "{:>2}. {} ({}) max_retries={}",
            gate.order,
            style(&gate.id).bold(),
            gate.name,
            gate.max_retries
        );
        if !gate.dependency_ids.is_empty() {
            println!("    after: {}", gate.dependency_ids.join(", "));
        }
        for check in &gate.pass_condition.checks {
            println!("    - {}", check.spec().describe());
        }
        if let Some(advisory) = &gate.pass_condition.advisory {
            println!("    - advisory confidence >= {:.2}", advisory.min_confidence);
        }
    }
    println!();
    Ok(0)
}
