pub mod icons;
pub mod progress;

pub use progress::RunProgress;

use crate::events::{EventRecord, RunEvent};
use crate::ui::icons::{
    BLOCKER, CACHE, CHECK, CLOCK, CROSS, FILE_NEW, PIVOT, REVIEW, RUNNING, SPARKLE, WAVE,
};
use console::style;

/// One rendered line for an event, or `None` for events that only update
/// the progress display. Worker output is shown only when `verbose`.
pub fn describe(record: &EventRecord, verbose: bool) -> Option<String> {
    let line = match &record.event {
        RunEvent::RunCreated {
            pipeline,
            theme,
            jurisdictions,
            ..
        } => format!(
            "{}{} run {} for {} ({})",
            SPARKLE,
            style(pipeline).bold(),
            style(record.run_id.short()).dim(),
            style(theme).cyan(),
            jurisdictions.join(", ")
        ),
        RunEvent::StateChanged { to, .. } => {
            if !verbose {
                return None;
            }
            format!("  {} {}", style("→").dim(), style(to).dim())
        }
        RunEvent::CacheHit {
            jurisdiction,
            fetched_at,
        } => format!(
            "  {}{} cached research from {}",
            CACHE,
            style(jurisdiction).cyan(),
            fetched_at.format("%Y-%m-%d")
        ),
        RunEvent::ReconStarted {
            jurisdiction,
            recon_run,
            joined,
        } => format!(
            "  {}{} recon {} {}",
            WAVE,
            style(jurisdiction).cyan(),
            if *joined { "joined" } else { "started" },
            style(recon_run.short()).dim()
        ),
        RunEvent::ReconFinished {
            jurisdiction,
            cached,
            ..
        } => {
            if !cached {
                return None;
            }
            format!("  {}{} research cached", CHECK, style(jurisdiction).cyan())
        }
        RunEvent::JurisdictionUncached {
            jurisdiction,
            reason,
        } => format!(
            "  {}{} {}: {}",
            BLOCKER,
            style(jurisdiction).yellow(),
            style("uncached").yellow().bold(),
            style(reason).dim()
        ),
        RunEvent::StageLaunching { .. } => return None,
        RunEvent::StageStarted {
            stage,
            attempt,
            pid,
        } => format!(
            "  {}{} attempt {} {}",
            RUNNING,
            style(stage).bold(),
            attempt,
            style(format!("(pid {})", pid)).dim()
        ),
        RunEvent::WorkerReattached {
            stage,
            attempt,
            pid,
            log_offset,
        } => format!(
            "  {}{} attempt {} re-attached {}",
            CLOCK,
            style(stage).bold(),
            attempt,
            style(format!("(pid {}, log byte {})", pid, log_offset)).dim()
        ),
        RunEvent::WorkerOutput { line, .. } => {
            if !verbose {
                return None;
            }
            format!("    {} {}", style("│").dim(), style(line).dim())
        }
        RunEvent::ArtifactCommitted { kind, path, .. } => format!(
            "    {}{} {}",
            FILE_NEW,
            style(kind).green(),
            style(path.display()).dim()
        ),
        RunEvent::StageFailed {
            stage,
            attempt,
            error,
            will_retry,
        } => {
            let icon = if *will_retry { &PIVOT } else { &CROSS };
            format!(
                "  {}{} attempt {} failed: {}{}",
                icon,
                style(stage).bold(),
                attempt,
                style(error).red(),
                if *will_retry { ", retrying" } else { "" }
            )
        }
        RunEvent::ReviewPending { gate, attempt, .. } => format!(
            "  {}{} attempt {} awaiting review",
            REVIEW,
            style(gate).yellow().bold(),
            attempt
        ),
        RunEvent::ReviewDecided {
            gate,
            decision,
            automatic,
        } => {
            let verdict = if decision.is_approve() {
                style("approved").green().to_string()
            } else {
                style("rejected").red().to_string()
            };
            format!(
                "  {}{} {}{}",
                REVIEW,
                style(gate).bold(),
                verdict,
                if *automatic { " (auto)" } else { "" }
            )
        }
        RunEvent::RunCompleted { manifest } => format!(
            "{}{} manifest at {}",
            CHECK,
            style("Run completed").green().bold(),
            style(manifest.display()).dim()
        ),
        RunEvent::RunFailed {
            stage,
            error,
            diagnostic,
        } => {
            let mut text = format!(
                "{}{}{}: {}",
                CROSS,
                style("Run failed").red().bold(),
                stage.map(|s| format!(" at {}", s)).unwrap_or_default(),
                error
            );
            for line in diagnostic {
                text.push_str(&format!("\n    {}", style(line).dim()));
            }
            text
        }
        RunEvent::RunAborted { stage } => format!(
            "{}{}{}",
            BLOCKER,
            style("Run aborted").yellow().bold(),
            stage.map(|s| format!(" during {}", s)).unwrap_or_default()
        ),
    };
    Some(line)
}
