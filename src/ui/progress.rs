use crate::events::{EventRecord, RunEvent};
use crate::pipeline::PipelineKind;
use crate::ui::describe;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use slotflow_common::{RunId, StageId};
use std::time::Duration;

/// Foreground rendering of one run's event stream, via `indicatif`.
///
/// Two bars are stacked: stages committed so far, and a spinner naming what
/// the run is doing right now. Event lines print above both.
pub struct RunProgress {
    multi: MultiProgress,
    stage_bar: ProgressBar,
    activity: ProgressBar,
    stages: &'static [StageId],
    verbose: bool,
}

impl RunProgress {
    pub fn new(run_id: &RunId, pipeline: &PipelineKind, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let stages = pipeline.stages();

        let stage_bar = multi.add(ProgressBar::new(stages.len() as u64));
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            stage_bar.set_style(bar_style.progress_chars("█▓▒░"));
        }
        stage_bar.set_prefix(format!("Run {}", run_id.short()));

        let activity = multi.add(ProgressBar::new_spinner());
        if let Ok(spinner_style) =
            ProgressStyle::default_spinner().template("{prefix:.bold.dim} {spinner} {msg}")
        {
            activity.set_style(spinner_style);
        }
        activity.set_prefix("  Now");
        activity.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            stage_bar,
            activity,
            stages,
            verbose,
        }
    }

    /// Print above the bars; plain stdout when they are hidden (not a tty).
    pub fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.is_hidden() || self.multi.println(msg.as_ref()).is_err() {
            println!("{}", msg.as_ref());
        }
    }

    pub fn handle(&self, record: &EventRecord) {
        match &record.event {
            RunEvent::StateChanged { to, .. } => {
                self.activity.set_message(style(to).cyan().to_string());
                if let Some(stage) = to.stage() {
                    self.stage_bar.set_message(stage.to_string());
                }
            }
            RunEvent::StageStarted { stage, attempt, .. } => {
                self.activity
                    .set_message(format!("{} attempt {}", style(stage).cyan(), attempt));
            }
            RunEvent::WorkerOutput { line, .. } if !self.verbose => {
                self.activity.set_message(style(line).dim().to_string());
            }
            RunEvent::ArtifactCommitted { stage, .. } => {
                if let Some(index) = self.stages.iter().position(|s| s == stage) {
                    self.stage_bar.set_position(index as u64 + 1);
                }
            }
            RunEvent::ReviewPending { gate, .. } => {
                self.activity
                    .set_message(format!("waiting for review of {}", style(gate).yellow()));
            }
            _ => {}
        }

        if let Some(line) = describe(record, self.verbose) {
            self.print_line(line);
        }
    }

    /// Pause the spinner while a prompt owns the terminal.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi.suspend(f)
    }

    pub fn finish(&self) {
        self.activity.finish_and_clear();
        self.stage_bar.finish_and_clear();
    }
}
