use crate::{Artifact, ArtifactKind, RunId, StageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variables set for every stage worker.
pub mod env {
    pub const RUN_ID: &str = "SLOTFLOW_RUN_ID";
    pub const STAGE: &str = "SLOTFLOW_STAGE";
    pub const ATTEMPT: &str = "SLOTFLOW_ATTEMPT";
    /// Path of the JSON [`super::WorkerInput`] manifest.
    pub const INPUT: &str = "SLOTFLOW_INPUT";
    /// Path the worker must write its [`super::StageOutput`] to.
    pub const OUTPUT: &str = "SLOTFLOW_OUTPUT";
    /// Execution directory; holds the pid, exit and log files.
    pub const EXEC_DIR: &str = "SLOTFLOW_EXEC_DIR";
}

/// Reference to a committed artifact of an earlier stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRef {
    pub stage: StageId,
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

/// Reference to a knowledge cache entry for one jurisdiction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRef {
    pub jurisdiction: String,
    pub path: PathBuf,
    pub fetched_at: DateTime<Utc>,
}

/// Manifest handed to a worker for one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInput {
    pub run_id: RunId,
    pub stage: StageId,
    pub attempt: u32,
    pub theme: String,
    pub jurisdictions: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    #[serde(default)]
    pub cached: Vec<CacheRef>,
    /// Jurisdictions whose research could not be cached; the worker runs
    /// with degraded context for these.
    #[serde(default)]
    pub uncached: Vec<String>,
    /// Review feedback from rejected attempts of this stage, oldest first.
    #[serde(default)]
    pub feedback: Vec<String>,
}

/// What a worker writes to its output path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub artifacts: Vec<Artifact>,
}

impl StageOutput {
    pub fn find(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_input_optional_lists_default_empty() {
        let run_id = RunId::new();
        let input: WorkerInput = serde_json::from_value(json!({
            "run_id": run_id.to_string(),
            "stage": "research",
            "attempt": 1,
            "theme": "pharaoh",
            "jurisdictions": ["Texas"]
        }))
        .unwrap();
        assert_eq!(input.run_id, run_id);
        assert!(input.inputs.is_empty());
        assert!(input.uncached.is_empty());
        assert!(input.feedback.is_empty());
    }

    #[test]
    fn test_stage_output_find_by_kind() {
        let output: StageOutput = serde_json::from_value(json!({
            "artifacts": [
                {"kind": "design_document", "title": "GDD"},
                {"kind": "math_tables"}
            ]
        }))
        .unwrap();
        assert!(output.find(ArtifactKind::MathTables).is_some());
        assert!(output.find(ArtifactKind::Package).is_none());
    }
}
