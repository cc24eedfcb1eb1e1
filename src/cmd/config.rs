//! Configuration view and validation commands: `reconflow config`.

use anyhow::{Context, Result};
use console::style;

use reconflow::phase::Phase;
use reconflow::recon_config::{CONFIG_FILE, ReconToml, search_paths, starter_config};
use reconflow::throttle::Mode;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    match command {
        None | Some(ConfigCommands::Show) => {
            let (toml, source) = ReconToml::discover(cli.config.as_deref(), Some(&cwd))?;

            println!();
            println!("reconflow configuration");
            println!("=======================");
            println!();
            match &source {
                Some(path) => println!("Config file: {}", path.display()),
                None => {
                    println!("No {} found. Searched:", CONFIG_FILE);
                    for path in search_paths(Some(&cwd)) {
                        println!("  - {}", path.display());
                    }
                    println!("Using built-in defaults.");
                }
            }
            println!();

            println!("[defaults]");
            println!("  mode = \"{}\"", toml.defaults.mode);
            println!(
                "  workspace_root = \"{}\"",
                toml.defaults.workspace_root.display()
            );
            println!("  probe = {}", toml.defaults.probe);
            println!();

            for mode in [Mode::Conservative, Mode::Aggressive] {
                let b = toml.budget_for(mode);
                println!("[budgets.{}]", mode);
                println!(
                    "  max_concurrency = {}, rate_limit = {}/{}s, delay = {}s, timeout = {}s",
                    b.max_concurrency, b.rate_limit, b.period_secs, b.delay_secs, b.timeout_secs
                );
            }
            println!();

            let e = &toml.escalation;
            println!("[escalation]");
            println!(
                "  concurrency x{}, delay x{}, rate x{} (min {})",
                e.concurrency_factor, e.delay_factor, e.rate_factor, e.min_rate
            );
            let skips: Vec<&str> = e.skip_phases.iter().map(|p| p.name()).collect();
            println!("  skip_phases = [{}]", skips.join(", "));
            println!();

            println!("Phases:");
            for phase in Phase::pipeline() {
                let tools: Vec<String> = toml.tools_for(phase).into_iter().map(|t| t.name).collect();
                let state = if toml.phase_enabled(phase) {
                    style("enabled").green()
                } else {
                    style("disabled").dim()
                };
                println!("  {:<20} {:<9} {}", phase.name(), state, tools.join(", "));
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let (toml, source) = ReconToml::discover(cli.config.as_deref(), Some(&cwd))?;
            let origin = source
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string());

            println!();
            println!("Validating {}...", origin);
            let problems = toml.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                println!();
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                println!();
                anyhow::bail!("{} problem(s) in {}", problems.len(), origin);
            }
        }
        Some(ConfigCommands::Init { dir }) => {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            std::fs::write(&config_path, starter_config())
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [defaults] mode, workspace_root, probe");
            println!("  - [budgets.<mode>] concurrency, rate limit, delay, timeout");
            println!("  - [escalation] factors and skipped phases");
            println!("  - [phases.<name>] enabled flag and tool table");
            println!();
        }
    }

    Ok(())
}
