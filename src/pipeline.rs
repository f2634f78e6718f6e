//! Stage graphs per pipeline kind.
//!
//! Both graphs are fixed sequences. Each stage declares which earlier stages
//! it reads from and which artifact kinds it must produce.

use crate::config::{SlotflowToml, StageSettings};
use serde::{Deserialize, Serialize};
use slotflow_common::{ArtifactKind, StageId};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pipeline", rename_all = "snake_case")]
pub enum PipelineKind {
    /// The full game pipeline: preflight through assembly.
    Game,
    /// Single-stage jurisdiction research that feeds the knowledge cache.
    Recon { jurisdiction: String },
}

impl PipelineKind {
    pub fn stages(&self) -> &'static [StageId] {
        match self {
            PipelineKind::Game => &StageId::GAME,
            PipelineKind::Recon { .. } => &[StageId::Recon],
        }
    }

    pub fn is_recon(&self) -> bool {
        matches!(self, PipelineKind::Recon { .. })
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Game => write!(f, "game"),
            PipelineKind::Recon { jurisdiction } => write!(f, "recon({})", jurisdiction),
        }
    }
}

/// Artifact kinds a stage must produce.
pub fn declared_outputs(stage: StageId) -> &'static [ArtifactKind] {
    match stage {
        StageId::PreFlight => &[ArtifactKind::PreflightIntel],
        StageId::Research => &[ArtifactKind::ResearchPayload],
        StageId::DesignMath => &[ArtifactKind::DesignDocument, ArtifactKind::MathTables],
        StageId::ArtAudio => &[ArtifactKind::ArtAssetSet, ArtifactKind::AudioAssetSet],
        StageId::Assembly => &[ArtifactKind::Package],
        StageId::Recon => &[ArtifactKind::ResearchPayload],
    }
}

/// Earlier stages whose committed artifacts a stage receives as input.
pub fn declared_inputs(stage: StageId) -> &'static [StageId] {
    match stage {
        StageId::PreFlight | StageId::Recon => &[],
        StageId::Research => &[StageId::PreFlight],
        StageId::DesignMath => &[StageId::PreFlight, StageId::Research],
        StageId::ArtAudio => &[StageId::Research, StageId::DesignMath],
        StageId::Assembly => &[StageId::Research, StageId::DesignMath, StageId::ArtAudio],
    }
}

/// Whether a stage receives the jurisdiction cache references.
pub fn uses_jurisdiction_research(stage: StageId) -> bool {
    !matches!(stage, StageId::PreFlight | StageId::Recon)
}

/// A stage of a concrete run: declaration plus resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub id: StageId,
    pub inputs: &'static [StageId],
    pub outputs: &'static [ArtifactKind],
    pub settings: StageSettings,
}

/// Resolve the stage sequence of a pipeline against configuration.
pub fn plan(kind: &PipelineKind, config: &SlotflowToml) -> Vec<StageSpec> {
    kind.stages()
        .iter()
        .map(|stage| StageSpec {
            id: *stage,
            inputs: declared_inputs(*stage),
            outputs: declared_outputs(*stage),
            settings: config.stage_settings(*stage),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_plan_order_and_gates() {
        let plan = plan(&PipelineKind::Game, &SlotflowToml::default());
        let ids: Vec<_> = plan.iter().map(|s| s.id).collect();
        assert_eq!(ids, StageId::GAME.to_vec());

        let gated: Vec<_> = plan.iter().filter(|s| s.settings.gated).map(|s| s.id).collect();
        assert_eq!(gated, vec![StageId::Research, StageId::DesignMath]);
    }

    #[test]
    fn test_inputs_only_reference_earlier_stages() {
        let order = StageId::GAME;
        for (i, stage) in order.iter().enumerate() {
            for input in declared_inputs(*stage) {
                let j = order.iter().position(|s| s == input).unwrap();
                assert!(j < i, "{} reads from later stage {}", stage, input);
            }
        }
    }

    #[test]
    fn test_recon_plan_is_single_stage() {
        let kind = PipelineKind::Recon {
            jurisdiction: "Georgia".into(),
        };
        let plan = plan(&kind, &SlotflowToml::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].outputs, &[ArtifactKind::ResearchPayload]);
        assert!(!plan[0].settings.gated);
        assert_eq!(kind.to_string(), "recon(Georgia)");
    }

    #[test]
    fn test_design_math_declares_two_outputs() {
        assert_eq!(
            declared_outputs(StageId::DesignMath),
            &[ArtifactKind::DesignDocument, ArtifactKind::MathTables]
        );
    }
}
