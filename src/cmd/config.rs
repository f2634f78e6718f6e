//! Configuration view and validation commands (`slotflow config`).

use anyhow::Result;
use slotflow::config::{SlotflowConfig, SlotflowToml};
use slotflow_common::StageId;

use super::super::ConfigCommands;

fn print_sections(toml: &SlotflowToml) {
    println!("[orchestrator]");
    if let Some(cmd) = &toml.orchestrator.worker_cmd {
        println!("  worker_cmd = \"{}\"", cmd);
    }
    println!("  poll_interval_ms = {}", toml.orchestrator.poll_interval_ms);
    println!("  terminate_grace_secs = {}", toml.orchestrator.terminate_grace_secs);
    println!("  subscriber_max_backlog = {}", toml.orchestrator.subscriber_max_backlog);
    println!("  retention_days = {}", toml.orchestrator.retention_days);
    println!("  interactive = {}", toml.orchestrator.interactive);
    println!();
    println!("[retry]");
    println!("  retries = {}", toml.retry.retries);
    println!("  backoff_ms = {}", toml.retry.backoff_ms);
    println!();
    println!("[cache]");
    println!("  freshness_days = {}", toml.cache.freshness_days);
    println!();

    for (name, stage) in &toml.stages {
        println!("[stages.{}]", name);
        if let Some(cmd) = &stage.command {
            println!("  command = \"{}\"", cmd);
        }
        if let Some(secs) = stage.timeout_secs {
            println!("  timeout_secs = {}", secs);
        }
        if let Some(retries) = stage.retries {
            println!("  retries = {}", retries);
        }
        if let Some(gated) = stage.gated {
            println!("  gated = {}", gated);
        }
        println!();
    }
}

pub fn cmd_config(config: &SlotflowConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Slotflow Configuration");
            println!("======================");
            println!();
            println!("State directory: {}", config.state_dir.display());

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No slotflow.toml found; using defaults.");
            }
            println!();
            print_sections(&config.toml);

            // Effective values (including env overrides)
            println!("Effective stage settings (with env overrides):");
            for stage in StageId::GAME.iter().chain([StageId::Recon].iter()) {
                let settings = config.stage_settings(*stage);
                println!(
                    "  {:<12} command=\"{}\" timeout={}s retries={} gated={}",
                    stage,
                    settings.command,
                    settings.timeout.as_secs(),
                    settings.retries,
                    settings.gated
                );
            }
            println!(
                "  freshness = {} days, backoff = {} ms",
                config
                    .freshness()
                    .map(|window| window.num_days().to_string())
                    .unwrap_or_else(|_| "out-of-range".to_string()),
                config.retry_backoff().as_millis()
            );
            println!();

            if !config_path.exists() {
                println!("Run 'slotflow config init' to create a slotflow.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No slotflow.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("slotflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            config.ensure_directories()?;
            SlotflowToml::default().save(&config_path)?;

            println!("Created slotflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [orchestrator] worker_cmd, poll_interval_ms, retention_days");
            println!("  - [retry] retries, backoff_ms");
            println!("  - [cache] freshness_days");
            println!("  - [stages.<stage>] command, timeout_secs, retries, gated");
            println!();
        }
    }

    Ok(())
}
