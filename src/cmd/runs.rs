//! Read-only run views and retention: `slotflow list|status|events|purge`.
//!
//! The views read the registry and event logs straight from disk, so they
//! work while another process holds the orchestrator lock.

use anyhow::{Context, Result, anyhow, bail};
use console::style;
use slotflow::config::{SlotflowConfig, days_window};
use slotflow::events::EventHub;
use slotflow::orchestrator::{Orchestrator, RunState};
use slotflow::registry::{ExecutionStatus, ReconStatus, RunOutcome, RunRecord, RunRegistry};
use slotflow::ui::describe;
use slotflow_common::RunId;

/// Accept a full run id or an unambiguous prefix of one.
fn resolve_run(registry: &RunRegistry, input: &str) -> Result<RunRecord> {
    if let Ok(id) = input.parse::<RunId>() {
        return Ok(registry.get(&id)?);
    }
    let mut matches: Vec<RunRecord> = registry
        .list()?
        .into_iter()
        .filter(|r| r.id.to_string().starts_with(input))
        .collect();
    if matches.len() > 1 {
        bail!("'{}' matches {} runs; use more characters", input, matches.len());
    }
    matches
        .pop()
        .ok_or_else(|| anyhow!("No run matches '{}'", input))
}

fn state_label(state: &RunState) -> String {
    match state {
        RunState::Completed => style(state).green().to_string(),
        RunState::Failed => style(state).red().to_string(),
        RunState::Aborted => style(state).yellow().to_string(),
        RunState::ReviewPending { .. } => style(state).yellow().bold().to_string(),
        _ => style(state).cyan().to_string(),
    }
}

pub fn cmd_list(config: &SlotflowConfig) -> Result<()> {
    let registry = RunRegistry::new(config.runs_dir());
    let runs = registry.list()?;

    if runs.is_empty() {
        println!("No runs yet. Start one with 'slotflow start'.");
        return Ok(());
    }

    println!();
    println!(
        "{:<10} {:<22} {:<26} {:<17} {}",
        style("RUN").bold(),
        style("PIPELINE").bold(),
        style("STATE").bold(),
        style("CREATED").bold(),
        style("THEME").bold()
    );
    for run in &runs {
        println!(
            "{:<10} {:<22} {:<26} {:<17} {}",
            run.id.short(),
            run.pipeline.to_string(),
            state_label(&run.state),
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.theme
        );
    }
    println!();
    Ok(())
}

pub fn cmd_status(config: &SlotflowConfig, run_id: &str) -> Result<()> {
    let registry = RunRegistry::new(config.runs_dir());
    let run = resolve_run(&registry, run_id)?;

    println!();
    println!("Run {}", style(&run.id).bold());
    println!("  pipeline:      {}", run.pipeline);
    println!("  theme:         {}", run.theme);
    println!("  jurisdictions: {}", run.jurisdictions.join(", "));
    println!("  state:         {}", state_label(&run.state));
    println!("  interactive:   {}", run.interactive);
    println!("  created:       {}", run.created_at.to_rfc3339());
    println!("  updated:       {}", run.updated_at.to_rfc3339());

    if !run.recon.is_empty() {
        println!();
        println!("Jurisdictions:");
        for link in &run.recon {
            let detail = match &link.status {
                ReconStatus::Cached { entry } => format!(
                    "{} (fetched {})",
                    style("cached").green(),
                    entry.fetched_at.format("%Y-%m-%d")
                ),
                ReconStatus::Pending { recon_run } => {
                    format!("{} {}", style("recon pending").cyan(), recon_run.short())
                }
                ReconStatus::Uncached { reason, .. } => {
                    format!("{}: {}", style("uncached").yellow(), reason)
                }
            };
            println!("  {:<16} {}", link.jurisdiction, detail);
        }
    }

    if !run.executions.is_empty() {
        println!();
        println!("Executions:");
        for exec in &run.executions {
            let status = match &exec.status {
                ExecutionStatus::Succeeded => style("succeeded").green().to_string(),
                ExecutionStatus::Failed { error } => format!("{}: {}", style("failed").red(), error),
                ExecutionStatus::Superseded => style("superseded").dim().to_string(),
                other => format!("{:?}", other).to_lowercase(),
            };
            println!(
                "  {:<12} #{} {}{}",
                exec.stage,
                exec.attempt,
                status,
                exec.pid.map(|pid| format!(" (pid {})", pid)).unwrap_or_default()
            );
        }
    }

    match &run.outcome {
        Some(RunOutcome::Succeeded { manifest }) => {
            println!();
            println!("Manifest: {}", manifest.display());
        }
        Some(RunOutcome::Failed { diagnostic, .. }) if !diagnostic.is_empty() => {
            println!();
            println!("Last worker output:");
            for line in diagnostic {
                println!("  {}", style(line).dim());
            }
        }
        _ => {}
    }
    println!();
    Ok(())
}

pub fn cmd_events(config: &SlotflowConfig, run_id: &str, json: bool) -> Result<()> {
    let registry = RunRegistry::new(config.runs_dir());
    let run = resolve_run(&registry, run_id)?;
    let hub = EventHub::new(config.runs_dir(), config.subscriber_max_backlog());

    for record in hub.history(&run.id)? {
        if json {
            println!("{}", serde_json::to_string(&record)?);
        } else if let Some(line) = describe(&record, true) {
            println!(
                "{:>5} {} {}",
                style(record.seq).dim(),
                style(record.at.format("%H:%M:%S")).dim(),
                line.trim_start()
            );
        }
    }
    Ok(())
}

pub fn cmd_purge(config: SlotflowConfig, older_than_days: Option<u64>) -> Result<()> {
    let orchestrator = Orchestrator::open(config)?;
    let retention = older_than_days
        .map(|days| days_window(days).context("Invalid --older-than-days"))
        .transpose()?;
    let purged = orchestrator.purge(retention)?;

    if purged.is_empty() {
        println!("Nothing to purge.");
    } else {
        println!("Purged {} run(s):", purged.len());
        for id in &purged {
            println!("  {}", id);
        }
    }
    Ok(())
}
