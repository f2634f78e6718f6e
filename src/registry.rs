//! Run Registry: durable run records plus the in-process index of driven runs.
//!
//! Each run lives in `runs/<id>/`:
//!
//! ```text
//! run.json                          the RunRecord, rewritten atomically on every transition
//! events.jsonl                      the run's event log (see `events`)
//! exec/<stage>/attempt-<n>/         execution directories handed to workers
//! ```
//!
//! The registry also tracks which runs this process is driving, and which
//! recon run is in flight for each jurisdiction key, so that two runs
//! needing the same jurisdiction share one recon run.

use crate::artifacts::ArtifactRef;
use crate::errors::OrchestratorError;
use crate::gates::{Decision, GateStatus, ReviewRecord};
use crate::orchestrator::state::RunState;
use crate::pipeline::PipelineKind;
use crate::util::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use slotflow_common::{CacheRef, RunId, StageId};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

pub const RUN_FILE: &str = "run.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Recorded before the worker was spawned
    Launching,
    Running,
    Succeeded,
    Failed { error: String },
    Aborted,
    /// Output retracted by a review rejection
    Superseded,
}

/// One attempt at a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage: StageId,
    pub attempt: u32,
    pub exec_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Byte range of the worker log relayed as events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_range: Option<(u64, u64)>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl StageExecution {
    pub fn launching(stage: StageId, attempt: u32, exec_dir: PathBuf) -> Self {
        Self {
            stage,
            attempt,
            exec_dir,
            pid: None,
            started_at: None,
            ended_at: None,
            status: ExecutionStatus::Launching,
            exit_code: None,
            log_range: None,
            artifacts: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Launching | ExecutionStatus::Running
        )
    }
}

/// Where a run's research for one jurisdiction comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconStatus {
    Cached { entry: CacheRef },
    Pending { recon_run: RunId },
    Uncached {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recon_run: Option<RunId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconLink {
    pub jurisdiction: String,
    pub key: String,
    #[serde(flatten)]
    pub status: ReconStatus,
}

/// Review feedback waiting to be handed to the next attempt of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub stage: StageId,
    pub after_attempt: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        manifest: PathBuf,
    },
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<StageId>,
        error: String,
        #[serde(default)]
        diagnostic: Vec<String>,
    },
    Aborted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<StageId>,
    },
}

/// Everything needed to reconstruct a run after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub pipeline: PipelineKind,
    pub theme: String,
    pub jurisdictions: Vec<String>,
    pub interactive: bool,
    pub state: RunState,
    /// Index into the pipeline's stage sequence
    pub stage_index: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub executions: Vec<StageExecution>,
    #[serde(default)]
    pub reviews: Vec<ReviewRecord>,
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    #[serde(default)]
    pub recon: Vec<ReconLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

impl RunRecord {
    pub fn new(
        pipeline: PipelineKind,
        theme: impl Into<String>,
        jurisdictions: Vec<String>,
        interactive: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            pipeline,
            theme: theme.into(),
            jurisdictions,
            interactive,
            state: RunState::Initializing,
            stage_index: 0,
            created_at: now,
            updated_at: now,
            executions: Vec::new(),
            reviews: Vec::new(),
            feedback: Vec::new(),
            recon: Vec::new(),
            outcome: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn stages(&self) -> &'static [StageId] {
        self.pipeline.stages()
    }

    pub fn current_stage(&self) -> Option<StageId> {
        self.stages().get(self.stage_index).copied()
    }

    /// Latest execution of a stage.
    pub fn last_execution(&self, stage: StageId) -> Option<&StageExecution> {
        self.executions.iter().rev().find(|e| e.stage == stage)
    }

    pub fn execution_mut(&mut self, stage: StageId, attempt: u32) -> Option<&mut StageExecution> {
        self.executions
            .iter_mut()
            .rev()
            .find(|e| e.stage == stage && e.attempt == attempt)
    }

    pub fn executions_of(
        &self,
        stage: StageId,
    ) -> impl DoubleEndedIterator<Item = &StageExecution> {
        self.executions.iter().filter(move |e| e.stage == stage)
    }

    pub fn next_attempt(&self, stage: StageId) -> u32 {
        self.executions_of(stage)
            .map(|e| e.attempt)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Failed, lost or timed-out attempts since the stage last (re)started
    /// after a review rejection. This is what the retry budget is charged with.
    pub fn failures_since_review(&self, stage: StageId) -> u32 {
        self.executions_of(stage)
            .rev()
            .take_while(|e| e.status != ExecutionStatus::Superseded)
            .filter(|e| matches!(e.status, ExecutionStatus::Failed { .. }))
            .count() as u32
    }

    /// Feedback from every rejected attempt of a stage, oldest first.
    pub fn feedback_for(&self, stage: StageId) -> Vec<String> {
        self.feedback
            .iter()
            .filter(|f| f.stage == stage)
            .map(|f| f.text.clone())
            .collect()
    }

    pub fn open_review(&self) -> Option<&ReviewRecord> {
        self.reviews
            .iter()
            .rev()
            .find(|r| r.status == GateStatus::Pending)
    }

    /// Record a decision on the pending review of `gate`.
    pub fn decide_review(&mut self, gate: StageId, decision: &Decision, automatic: bool) {
        if let Some(review) = self
            .reviews
            .iter_mut()
            .rev()
            .find(|r| r.gate == gate && r.status == GateStatus::Pending)
        {
            review.decide(decision, automatic);
        }
    }

    pub fn cached_refs(&self) -> Vec<CacheRef> {
        self.recon
            .iter()
            .filter_map(|link| match &link.status {
                ReconStatus::Cached { entry } => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn uncached(&self) -> Vec<String> {
        self.recon
            .iter()
            .filter(|link| matches!(link.status, ReconStatus::Uncached { .. }))
            .map(|link| link.jurisdiction.clone())
            .collect()
    }

    pub fn pending_recon(&self) -> Vec<(usize, RunId)> {
        self.recon
            .iter()
            .enumerate()
            .filter_map(|(i, link)| match &link.status {
                ReconStatus::Pending { recon_run } => Some((i, recon_run.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Instruction to the task driving a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunCommand {
    Decide { gate: StageId, decision: Decision },
    Abort,
}

/// Handle to a run driven by this process.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub commands: mpsc::Sender<RunCommand>,
    pub state: watch::Receiver<RunState>,
    pub task: Option<AbortHandle>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RunRegistry {
    runs_dir: PathBuf,
    active: Mutex<HashMap<RunId, ActiveRun>>,
    recon_inflight: Mutex<HashMap<String, RunId>>,
}

impl RunRegistry {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self {
            runs_dir,
            active: Mutex::new(HashMap::new()),
            recon_inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_dir(&self, id: &RunId) -> PathBuf {
        self.runs_dir.join(id.to_string())
    }

    pub fn exec_dir(&self, id: &RunId, stage: StageId, attempt: u32) -> PathBuf {
        self.run_dir(id)
            .join("exec")
            .join(stage.as_str())
            .join(format!("attempt-{}", attempt))
    }

    /// Persist a run record atomically.
    pub fn save(&self, record: &RunRecord) -> Result<()> {
        let path = self.run_dir(&record.id).join(RUN_FILE);
        write_json_atomic(&path, record)
            .with_context(|| format!("Failed to save run {}", record.id))
    }

    pub fn load(&self, id: &RunId) -> Result<Option<RunRecord>> {
        let path = self.run_dir(id).join(RUN_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    pub fn get(&self, id: &RunId) -> Result<RunRecord, OrchestratorError> {
        self.load(id)?
            .ok_or_else(|| OrchestratorError::RunNotFound { id: id.clone() })
    }

    /// Every persisted run, oldest first.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)
            .with_context(|| format!("Failed to read {}", self.runs_dir.display()))?
        {
            let path = entry?.path().join(RUN_FILE);
            if !path.exists() {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    pub fn non_terminal(&self) -> Result<Vec<RunRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }

    /// Remove finished runs last updated before `now - retention`.
    ///
    /// Only run records, event logs and execution directories go. Artifacts
    /// and cache entries stay.
    pub fn purge(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let cutoff = now - retention;
        let mut purged = Vec::new();
        for record in self.list()? {
            if !record.is_terminal() || record.updated_at >= cutoff || self.is_active(&record.id) {
                continue;
            }
            let dir = self.run_dir(&record.id);
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            tracing::info!(run_id = %record.id, "purged run");
            purged.push(record.id);
        }
        Ok(purged)
    }

    // ── Runs driven by this process ──

    /// Register a driven run unless one is already registered under `id`.
    ///
    /// Returns the registered handle and whether `run` was the one inserted.
    pub fn register_active(&self, id: RunId, run: ActiveRun) -> (ActiveRun, bool) {
        let mut active = lock(&self.active);
        if let Some(existing) = active.get(&id) {
            return (existing.clone(), false);
        }
        active.insert(id, run.clone());
        (run, true)
    }

    pub fn set_task(&self, id: &RunId, task: AbortHandle) {
        if let Some(run) = lock(&self.active).get_mut(id) {
            run.task = Some(task);
        }
    }

    pub fn unregister_active(&self, id: &RunId) {
        lock(&self.active).remove(id);
    }

    pub fn active(&self, id: &RunId) -> Option<ActiveRun> {
        lock(&self.active).get(id).cloned()
    }

    pub fn is_active(&self, id: &RunId) -> bool {
        lock(&self.active).contains_key(id)
    }

    pub fn active_ids(&self) -> Vec<RunId> {
        lock(&self.active).keys().cloned().collect()
    }

    /// Stop driving every run without touching their workers.
    pub fn detach_all(&self) {
        for (_, run) in lock(&self.active).drain() {
            if let Some(task) = run.task {
                task.abort();
            }
        }
    }

    // ── Recon dedupe ──

    /// The in-flight recon run for `key`, or the one `start` creates.
    ///
    /// Returns the run id and whether an existing run was joined. `start`
    /// runs under the dedupe lock so two callers never both start one.
    pub fn claim_recon<F>(&self, key: &str, start: F) -> Result<(RunId, bool)>
    where
        F: FnOnce() -> Result<RunId>,
    {
        let mut inflight = lock(&self.recon_inflight);
        if let Some(id) = inflight.get(key) {
            return Ok((id.clone(), true));
        }
        let id = start()?;
        inflight.insert(key.to_string(), id.clone());
        Ok((id, false))
    }

    pub fn release_recon(&self, key: &str, id: &RunId) {
        let mut inflight = lock(&self.recon_inflight);
        if inflight.get(key) == Some(id) {
            inflight.remove(key);
        }
    }
}

fn read_record(path: &Path) -> Result<RunRecord> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read run record {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse run record {}", path.display()))
}

/// Exclusive advisory lock on a state directory.
#[derive(Debug)]
pub struct StateLock {
    _file: fs::File,
}

impl StateLock {
    pub fn acquire(path: &Path) -> Result<Self, OrchestratorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        file.try_lock_exclusive()
            .map_err(|_| OrchestratorError::LockHeld {
                path: path.to_path_buf(),
            })?;
        Ok(Self { _file: file })
    }
}
