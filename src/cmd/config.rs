//! Configuration view, validation and scaffolding: `dockyard config`.

use std::path::Path;

use anyhow::Result;
use dockyard::config::DockyardConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!(
                    "# No {} found, showing defaults. Run 'dockyard config init' to create one.",
                    config_path.display()
                );
            }
            println!("# Effective values (with environment overrides)");
            println!();
            let config = DockyardConfig::resolve(config_path)?;
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", config_path.display());
                return Ok(());
            }
            let config = DockyardConfig::resolve(config_path)?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("{} configuration problem(s) found", problems.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            DockyardConfig::write_default(config_path, force)?;
            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, cors_origins");
            println!("  - [runtime] docker_host, network, allowed_git_hosts");
            println!("  - [templates.<name>] image, env, setup_commands, health_check");
        }
    }
    Ok(())
}
