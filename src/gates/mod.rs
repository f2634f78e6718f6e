//! Review gates: the pause after a gated stage commits its output.
//!
//! A run waits at a pending gate until an external decision arrives. Runs
//! that are not interactive get an automatic approval, recorded the same
//! way as a human one.

use anyhow::Result;
use chrono::{DateTime, Utc};
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use slotflow_common::{RunId, StageId};
use std::path::PathBuf;

/// Decision on a pending review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    /// Re-run the stage; the feedback is handed to the next attempt.
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
}

impl Decision {
    pub fn reject(feedback: impl Into<String>) -> Self {
        let feedback = feedback.into();
        Decision::Reject {
            feedback: (!feedback.trim().is_empty()).then_some(feedback),
        }
    }

    pub fn is_approve(&self) -> bool {
        matches!(self, Decision::Approve)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
}

/// One visit of a run to a review gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub gate: StageId,
    pub attempt: u32,
    pub status: GateStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default)]
    pub automatic: bool,
}

impl ReviewRecord {
    pub fn open(gate: StageId, attempt: u32) -> Self {
        Self {
            gate,
            attempt,
            status: GateStatus::Pending,
            opened_at: Utc::now(),
            decided_at: None,
            feedback: None,
            automatic: false,
        }
    }

    pub fn decide(&mut self, decision: &Decision, automatic: bool) {
        self.decided_at = Some(Utc::now());
        self.automatic = automatic;
        match decision {
            Decision::Approve => self.status = GateStatus::Approved,
            Decision::Reject { feedback } => {
                self.status = GateStatus::Rejected;
                self.feedback = feedback.clone();
            }
        }
    }
}

/// What the operator chose at an interactive gate prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptChoice {
    Decide(Decision),
    AbortRun,
}

/// Terminal prompt for a pending review gate.
pub struct ReviewPrompt {
    pub auto_approve: bool,
}

impl ReviewPrompt {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve }
    }

    pub fn ask(
        &mut self,
        run_id: &RunId,
        gate: StageId,
        artifacts: &[PathBuf],
    ) -> Result<PromptChoice> {
        println!();
        println!(
            "  {} run {} is waiting for review of {}",
            style("Review").yellow().bold(),
            style(run_id.short()).dim(),
            style(gate).cyan()
        );
        for path in artifacts {
            println!("    {}", style(path.display()).dim());
        }

        if self.auto_approve {
            println!("  {} (--yes flag)", style("Auto-approved").dim());
            return Ok(PromptChoice::Decide(Decision::Approve));
        }

        let options = &[
            "Approve and continue",
            "Reject with feedback",
            "Approve this and all remaining gates (--yes)",
            "Abort run",
        ];

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Decision")
            .items(options)
            .default(0)
            .interact()?;

        match selection {
            0 => Ok(PromptChoice::Decide(Decision::Approve)),
            1 => {
                let feedback: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Feedback for the next attempt")
                    .allow_empty(true)
                    .interact_text()?;
                Ok(PromptChoice::Decide(Decision::reject(feedback)))
            }
            2 => {
                self.auto_approve = true;
                Ok(PromptChoice::Decide(Decision::Approve))
            }
            _ => Ok(PromptChoice::AbortRun),
        }
    }
}
