//! Pipeline state machine: run states and the transitions allowed between them.

use serde::{Deserialize, Serialize};
use slotflow_common::StageId;
use std::fmt;

/// State of a run.
///
/// Working states map one-to-one onto stages. `ReviewPending` names the
/// stage whose output is waiting for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    #[serde(rename = "preflight")]
    PreFlight,
    Researching,
    DesigningMath,
    ArtAudio,
    Assembling,
    Reconnoitering,
    ReviewPending {
        gate: StageId,
    },
    Completed,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// The state a run is in while `stage` executes.
    pub fn working(stage: StageId) -> Self {
        match stage {
            StageId::PreFlight => Self::PreFlight,
            StageId::Research => Self::Researching,
            StageId::DesignMath => Self::DesigningMath,
            StageId::ArtAudio => Self::ArtAudio,
            StageId::Assembly => Self::Assembling,
            StageId::Recon => Self::Reconnoitering,
        }
    }

    /// Stage being executed, or whose review is pending.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Self::PreFlight => Some(StageId::PreFlight),
            Self::Researching => Some(StageId::Research),
            Self::DesigningMath => Some(StageId::DesignMath),
            Self::ArtAudio => Some(StageId::ArtAudio),
            Self::Assembling => Some(StageId::Assembly),
            Self::Reconnoitering => Some(StageId::Recon),
            Self::ReviewPending { gate } => Some(*gate),
            Self::Initializing | Self::Completed | Self::Failed | Self::Aborted => None,
        }
    }

    /// Whether `self → to` is a legal step for a pipeline with the given stages.
    ///
    /// Forward steps go from a stage's working state to its review gate or
    /// to the next stage (or `Completed` after the last one). A gate moves
    /// forward on approval or back to the same stage's working state on
    /// rejection. Any non-terminal state may fail or abort.
    pub fn can_transition(&self, to: &RunState, stages: &[StageId]) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Self::Failed | Self::Aborted) {
            return true;
        }

        let index_of = |stage: StageId| stages.iter().position(|s| *s == stage);
        let after = |i: usize| match stages.get(i + 1) {
            Some(next) => Self::working(*next),
            None => Self::Completed,
        };

        match self {
            Self::Initializing => stages.first().is_some_and(|first| *to == Self::working(*first)),
            Self::ReviewPending { gate } => match index_of(*gate) {
                Some(i) => *to == after(i) || *to == Self::working(*gate),
                None => false,
            },
            working => match working.stage().and_then(index_of) {
                Some(i) => {
                    let stage = stages[i];
                    *to == after(i) || *to == Self::ReviewPending { gate: stage }
                }
                None => false,
            },
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::PreFlight => write!(f, "preflight"),
            Self::Researching => write!(f, "researching"),
            Self::DesigningMath => write!(f, "designing_math"),
            Self::ArtAudio => write!(f, "art_audio"),
            Self::Assembling => write!(f, "assembling"),
            Self::Reconnoitering => write!(f, "reconnoitering"),
            Self::ReviewPending { gate } => write!(f, "review_pending({})", gate),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}
