//! Configuration view and initialization: `forge-exec config`.

use anyhow::{Result, bail};

use forge_exec::forge_config::{ForgeConfig, ForgeToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &ForgeConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No forge.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let toml = &config.toml;
            println!("[execution]");
            println!("  poll_interval_ms = {}", toml.execution.poll_interval_ms);
            println!(
                "  phase_status_timeout_secs = {}",
                toml.execution.phase_status_timeout_secs
            );
            println!(
                "  max_phase_check_failures = {}",
                toml.execution.max_phase_check_failures
            );
            println!("  commit_tasks = {}", toml.execution.commit_tasks);
            println!();
            println!("[checks]");
            println!("  default_timeout_secs = {}", toml.checks.default_timeout_secs);
            println!();
            println!("[workspace]");
            println!("  plans_dir = \"{}\"", toml.workspace.plans_dir.display());
            println!("  phases_file = \"{}\"", toml.workspace.phases_file.display());
            println!();
            println!("[hooks]");
            for (name, command) in [
                ("post_plan", &toml.hooks.post_plan),
                ("pre_execute", &toml.hooks.pre_execute),
                ("post_step", &toml.hooks.post_step),
            ] {
                match command {
                    Some(command) => println!("  {} = {:?}", name, command),
                    None => println!("  {} = (none)", name),
                }
            }
            println!("  timeout_secs = {}", toml.hooks.timeout_secs);
            println!();
            println!("[agent]");
            match config.agent_command() {
                Some(command) => println!("  command = {:?}", command),
                None => println!("  command = (none)"),
            }
            println!();

            let warnings = config.validate();
            if !warnings.is_empty() {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
                println!();
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                bail!(
                    "forge.toml already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            ForgeToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
