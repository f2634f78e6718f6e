//! Typed error hierarchy for the slotflow orchestrator.
//!
//! Three enums map the failure taxonomy of a stage execution:
//! - `LaunchError`: the worker could not be started (environment problem, never retried)
//! - `WorkerFailure`: the worker ran and did not succeed (retried up to the stage budget)
//! - `ArtifactCommitError`: the worker succeeded but its output could not be stored
//!   (retried like a `WorkerFailure`)
//!
//! `OrchestratorError` covers the public orchestrator API. Cache misses and
//! gate rejections are ordinary outcomes and have no error type.

use slotflow_common::{ArtifactKind, RunId, StageId};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised before a worker process exists.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("No worker command configured for stage {stage}")]
    EmptyCommand { stage: StageId },

    #[error("Failed to prepare execution directory {path}: {source}")]
    ExecDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker for stage {stage}: {source}")]
    SpawnFailed {
        stage: StageId,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned worker for stage {stage} reported no process id")]
    NoPid { stage: StageId },
}

/// A worker that ran but did not finish successfully.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    #[error("Worker exited with non-zero code {code}")]
    NonZeroExit { code: i32 },

    #[error("Worker was killed by a signal")]
    Signaled,

    #[error("Worker timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("Worker process {pid} disappeared without recording an exit status")]
    Lost { pid: u32 },

    #[error("Worker never recorded a process id")]
    Unrecorded,
}

/// The worker exited zero but its output could not be durably recorded.
#[derive(Debug, Error)]
pub enum ArtifactCommitError {
    #[error("Worker output missing at {path}")]
    MissingOutput { path: PathBuf },

    #[error("Worker output at {path} is not valid: {source}")]
    InvalidOutput {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stage {stage} did not produce a {kind} artifact")]
    MissingKind { stage: StageId, kind: ArtifactKind },

    #[error("Failed to write artifact at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to store recon result in the knowledge cache: {0}")]
    Cache(#[source] anyhow::Error),
}

/// Why a single stage execution did not produce a committed artifact.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Worker(#[from] WorkerFailure),

    #[error(transparent)]
    Commit(#[from] ArtifactCommitError),
}

impl StageError {
    /// Launch errors point at the environment and are surfaced at once.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StageError::Launch(_))
    }
}

/// Errors from the orchestrator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run {id} not found")]
    RunNotFound { id: RunId },

    #[error("Run {id} is not waiting on the {gate} review gate")]
    NotAwaitingReview { id: RunId, gate: StageId },

    #[error("Run {id} has already finished")]
    RunFinished { id: RunId },

    #[error("Run {id} is not being driven by this orchestrator")]
    NotActive { id: RunId },

    #[error("Another orchestrator holds the lock at {path}")]
    LockHeld { path: PathBuf },

    #[error("At least one jurisdiction is required")]
    NoJurisdictions,

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
