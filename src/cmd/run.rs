//! Foreground run driving: `slotflow start`, `slotflow recon`, `slotflow resume`.

use anyhow::{Result, bail};
use console::style;
use futures::StreamExt;
use slotflow::config::SlotflowConfig;
use slotflow::errors::OrchestratorError;
use slotflow::events::RunEvent;
use slotflow::gates::{PromptChoice, ReviewPrompt};
use slotflow::orchestrator::{Orchestrator, RunRequest, RunState};
use slotflow::registry::{RunOutcome, RunRecord};
use slotflow::ui::RunProgress;
use slotflow::ui::icons::WAVE;
use slotflow_common::{RunId, StageId};
use std::path::PathBuf;

pub async fn cmd_start(
    config: SlotflowConfig,
    theme: &str,
    jurisdictions: &[String],
    interactive: bool,
) -> Result<()> {
    let interactive = config.interactive() || (interactive && !config.yes);
    let (verbose, yes) = (config.verbose, config.yes);

    let orchestrator = Orchestrator::open(config)?;
    let id = orchestrator.start(RunRequest {
        theme: theme.to_string(),
        jurisdictions: jurisdictions.to_vec(),
        interactive,
    })?;

    let record = follow(&orchestrator, &id, verbose, yes).await?;
    report(record.as_ref())
}

pub async fn cmd_recon(config: SlotflowConfig, jurisdiction: &str) -> Result<()> {
    let verbose = config.verbose;
    let orchestrator = Orchestrator::open(config)?;
    let (id, joined) = orchestrator.recon(jurisdiction)?;
    if joined {
        println!(
            "{}Joined in-flight recon run {}",
            WAVE,
            style(id.short()).dim()
        );
    }

    let record = follow(&orchestrator, &id, verbose, true).await?;
    report(record.as_ref())
}

pub async fn cmd_resume(config: SlotflowConfig) -> Result<()> {
    let (verbose, yes) = (config.verbose, config.yes);
    let orchestrator = Orchestrator::open(config)?;
    let resumed = orchestrator.resume_all()?;
    if resumed.is_empty() {
        println!("No unfinished runs to resume.");
        return Ok(());
    }
    println!("Resuming {} run(s)", resumed.len());
    if resumed.len() > 1 {
        println!(
            "{}",
            style("Runs are followed one at a time; later review gates wait their turn.").dim()
        );
    }

    // Runs progress concurrently; they are rendered one after another.
    let mut failed = 0;
    for id in &resumed {
        match follow(&orchestrator, id, verbose, yes).await? {
            Some(record) => {
                if report(Some(&record)).is_err() {
                    failed += 1;
                }
            }
            None => return Ok(()),
        }
    }
    if failed > 0 {
        bail!("{} of {} resumed run(s) did not complete", failed, resumed.len());
    }
    Ok(())
}

/// Render a run's events until it ends, prompting at review gates.
///
/// Returns `None` when the operator detached with Ctrl-C; the orchestrator
/// then stops driving and workers keep running for a later `resume`.
async fn follow(
    orchestrator: &Orchestrator,
    id: &RunId,
    verbose: bool,
    yes: bool,
) -> Result<Option<RunRecord>> {
    let record = orchestrator.status(id)?;
    let progress = RunProgress::new(id, &record.pipeline, verbose);
    let mut prompt = ReviewPrompt::new(yes);
    let mut events = orchestrator.subscribe(id)?;
    let mut last_seq: Option<u64> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let item = tokio::select! {
            _ = &mut ctrl_c => {
                progress.finish();
                println!(
                    "Detached from run {}; workers keep running. Continue with `slotflow resume`.",
                    style(id.short()).dim()
                );
                return Ok(None);
            }
            item = events.next() => item,
        };

        let event = match item {
            Some(Ok(event)) => event,
            Some(Err(dropped)) => {
                tracing::warn!(run_id = %id, backlog = dropped.backlog, "fell behind event stream; resubscribing");
                events = orchestrator.subscribe(id)?;
                continue;
            }
            None => break,
        };
        if last_seq.is_some_and(|seq| event.seq <= seq) {
            continue;
        }
        last_seq = Some(event.seq);
        progress.handle(&event);

        if let RunEvent::ReviewPending {
            gate,
            attempt,
            ref artifacts,
        } = event.event
        {
            review(orchestrator, id, gate, attempt, artifacts, &progress, &mut prompt).await?;
        }
        if event.event.is_terminal() {
            break;
        }
    }

    progress.finish();
    Ok(Some(orchestrator.wait(id).await?))
}

async fn review(
    orchestrator: &Orchestrator,
    id: &RunId,
    gate: StageId,
    attempt: u32,
    artifacts: &[PathBuf],
    progress: &RunProgress,
    prompt: &mut ReviewPrompt,
) -> Result<()> {
    // Replayed gates that were decided already are skipped.
    if orchestrator.state(id) != Some(RunState::ReviewPending { gate }) {
        return Ok(());
    }
    let record = orchestrator.status(id)?;
    if !record.interactive {
        return Ok(());
    }
    match record.open_review() {
        Some(open) if open.gate == gate && open.attempt == attempt => {}
        _ => return Ok(()),
    }

    let choice = tokio::task::block_in_place(|| {
        progress.suspend(|| prompt.ask(id, gate, artifacts))
    })?;

    match choice {
        PromptChoice::Decide(decision) => match orchestrator.decide(id, gate, decision).await {
            Ok(()) => {}
            Err(OrchestratorError::NotAwaitingReview { .. }) => {
                progress.print_line(format!("  {} was decided elsewhere", gate));
            }
            Err(e) => return Err(e.into()),
        },
        PromptChoice::AbortRun => orchestrator.abort(id).await?,
    }
    Ok(())
}

fn report(record: Option<&RunRecord>) -> Result<()> {
    let Some(record) = record else {
        return Ok(());
    };
    match &record.outcome {
        Some(RunOutcome::Succeeded { .. }) => Ok(()),
        Some(RunOutcome::Failed { stage, error, .. }) => match stage {
            Some(stage) => bail!("Run {} failed at {}: {}", record.id, stage, error),
            None => bail!("Run {} failed: {}", record.id, error),
        },
        Some(RunOutcome::Aborted { .. }) => bail!("Run {} was aborted", record.id),
        None if record.state == RunState::Completed => Ok(()),
        None => bail!("Run {} stopped in state {}", record.id, record.state),
    }
}
