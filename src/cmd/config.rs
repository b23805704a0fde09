//! Configuration view and validation commands: `gauntlet config`.

use anyhow::Result;
use console::style;

use gauntlet::config::{CONFIG_FILE, GauntletConfig};

use super::super::ConfigCommands;

pub fn cmd_config(config: &GauntletConfig, command: Option<ConfigCommands>) -> Result<i32> {
    let config_path = config.gauntlet_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Gauntlet Configuration").bold().cyan());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; using defaults.", CONFIG_FILE);
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!("  max_retries      = {}", config.max_retries());
            let policy = &config.toml.promotion;
            println!("  promote_threshold = {}", policy.promote_threshold);
            println!("  accept_threshold  = {}", policy.accept_threshold);
            println!("  smoothing_alpha   = {}", policy.smoothing_alpha);
            println!("  violation_penalty = {}", policy.violation_penalty);
            println!("  deprecation_floor = {}", policy.deprecation_floor);
            println!("  advisory         = {:?}", config.toml.advisory.backend);
            if let Some(command) = &config.toml.advisory.command {
                println!("  advisory command = {} {}", command, config.toml.advisory.args.join(" "));
            }
            if let Some(url) = &config.toml.advisory.url {
                println!("  advisory url     = {}", url);
            }
            println!("  git_commit       = {}", config.toml.artifact.git_commit);
            println!("  state_dir        = {}", config.state_dir().display());
            println!("  invariant_dir    = {}", config.invariant_dir().display());
            println!("  archive_dir      = {}", config.archive_dir().display());
            println!(
                "  gates            = {}",
                if config.toml.gates.is_empty() {
                    "built-in".to_string()
                } else {
                    format!("{} from {}", config.toml.gates.len(), CONFIG_FILE)
                }
            );
            println!();
            Ok(0)
        }
        Some(ConfigCommands::Validate) => {
            config.gate_table()?;
            config.promotion_policy()?;
            config.advisory_client()?;

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            Ok(0)
        }
    }
}
