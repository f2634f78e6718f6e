//! Artifact Store: durable stage outputs addressed by `(run_id, stage_id)`.
//!
//! Layout under the store root:
//!
//! ```text
//! <run_id>/<stage>/attempt-<n>/<kind>.json   one file per artifact
//! <run_id>/<stage>/committed.json            pointer to the authoritative attempt
//! <run_id>/<stage>/superseded-<n>.json       pointers retracted by a review rejection
//! <run_id>/manifest.json                     written when the run completes
//! ```
//!
//! Every file is written through a temp file and a rename. An attempt
//! directory without a `committed.json` pointing at it is not authoritative,
//! which is how aborted and partial attempts are kept but ignored.

use crate::errors::ArtifactCommitError;
use crate::util::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotflow_common::{Artifact, ArtifactKind, CacheRef, RunId, StageId};
use std::fs;
use std::path::PathBuf;

const COMMIT_POINTER: &str = "committed.json";
const MANIFEST: &str = "manifest.json";

/// Location of one stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub stage: StageId,
    pub kind: ArtifactKind,
    pub attempt: u32,
    pub path: PathBuf,
}

/// Contents of a stage's commit pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub run_id: RunId,
    pub stage: StageId,
    pub attempt: u32,
    pub committed_at: DateTime<Utc>,
    pub artifacts: Vec<ArtifactRef>,
}

impl CommitRecord {
    pub fn find(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

/// Written once a run completes; references every authoritative artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub theme: String,
    pub jurisdictions: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub cached: Vec<CacheRef>,
    #[serde(default)]
    pub uncached: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn stage_dir(&self, run_id: &RunId, stage: StageId) -> PathBuf {
        self.run_dir(run_id).join(stage.as_str())
    }

    pub fn attempt_dir(&self, run_id: &RunId, stage: StageId, attempt: u32) -> PathBuf {
        self.stage_dir(run_id, stage)
            .join(format!("attempt-{}", attempt))
    }

    /// Store the artifacts of one attempt and make that attempt authoritative.
    ///
    /// Artifact files land first, the pointer last, so a crash part way
    /// leaves at most an unreferenced attempt directory. Re-committing the
    /// same attempt overwrites it in place.
    pub fn commit(
        &self,
        run_id: &RunId,
        stage: StageId,
        attempt: u32,
        artifacts: &[Artifact],
    ) -> Result<CommitRecord, ArtifactCommitError> {
        let dir = self.attempt_dir(run_id, stage, attempt);
        let mut refs = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let path = dir.join(format!("{}.json", artifact.kind()));
            write_json_atomic(&path, artifact).map_err(|source| {
                ArtifactCommitError::WriteFailed {
                    path: path.clone(),
                    source,
                }
            })?;
            refs.push(ArtifactRef {
                stage,
                kind: artifact.kind(),
                attempt,
                path,
            });
        }

        let record = CommitRecord {
            run_id: run_id.clone(),
            stage,
            attempt,
            committed_at: Utc::now(),
            artifacts: refs,
        };
        let pointer = self.stage_dir(run_id, stage).join(COMMIT_POINTER);
        write_json_atomic(&pointer, &record).map_err(|source| {
            ArtifactCommitError::WriteFailed {
                path: pointer.clone(),
                source,
            }
        })?;

        Ok(record)
    }

    /// The authoritative attempt of a stage, if any.
    pub fn committed(&self, run_id: &RunId, stage: StageId) -> Result<Option<CommitRecord>> {
        let pointer = self.stage_dir(run_id, stage).join(COMMIT_POINTER);
        if !pointer.exists() {
            return Ok(None);
        }
        let content = fs::read(&pointer)
            .with_context(|| format!("Failed to read commit pointer {}", pointer.display()))?;
        let record = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse commit pointer {}", pointer.display()))?;
        Ok(Some(record))
    }

    /// Withdraw a stage's authoritative attempt after a review rejection.
    ///
    /// The artifacts stay on disk; only the pointer is renamed.
    pub fn retract(&self, run_id: &RunId, stage: StageId) -> Result<Option<CommitRecord>> {
        let Some(record) = self.committed(run_id, stage)? else {
            return Ok(None);
        };
        let stage_dir = self.stage_dir(run_id, stage);
        let superseded = stage_dir.join(format!("superseded-{}.json", record.attempt));
        fs::rename(stage_dir.join(COMMIT_POINTER), &superseded)
            .with_context(|| format!("Failed to retract {} for run {}", stage, run_id))?;
        Ok(Some(record))
    }

    /// Read back one stored artifact.
    pub fn load(&self, artifact: &ArtifactRef) -> Result<Artifact> {
        let content = fs::read(&artifact.path)
            .with_context(|| format!("Failed to read artifact {}", artifact.path.display()))?;
        serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse artifact {}", artifact.path.display()))
    }

    /// Authoritative commits of a run, in stage order.
    pub fn authoritative(&self, run_id: &RunId, stages: &[StageId]) -> Result<Vec<CommitRecord>> {
        let mut records = Vec::new();
        for stage in stages {
            if let Some(record) = self.committed(run_id, *stage)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn manifest_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(MANIFEST)
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<PathBuf> {
        let path = self.manifest_path(&manifest.run_id);
        write_json_atomic(&path, manifest)
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        Ok(path)
    }

    pub fn load_manifest(&self, run_id: &RunId) -> Result<Option<RunManifest>> {
        let path = self.manifest_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(&path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Ok(Some(serde_json::from_slice(&content).with_context(|| {
            format!("Failed to parse manifest {}", path.display())
        })?))
    }
}
