//! Run driver: one tokio task per run, advancing it through its stage graph.
//!
//! The driver owns its [`RunRecord`] and saves it on every transition. All
//! waiting happens at three suspension points: a worker's exit, a review
//! decision, and the join on subordinate recon runs. Each of them also
//! listens for [`RunCommand`]s so that an abort is honored wherever the run
//! happens to be.

use super::Shared;
use super::state::RunState;
use crate::artifacts::{CommitRecord, RunManifest};
use crate::cache::CacheLookup;
use crate::config::StageSettings;
use crate::errors::{ArtifactCommitError, StageError, WorkerFailure};
use crate::events::RunEvent;
use crate::gates::{Decision, ReviewRecord};
use crate::launcher::{self, LaunchRequest, LogTail, WorkerExit, WorkerHandle};
use crate::pipeline::{self, PipelineKind, StageSpec};
use crate::registry::{
    ActiveRun, ExecutionStatus, Feedback, ReconLink, ReconStatus, RunCommand, RunOutcome,
    RunRecord, StageExecution,
};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use slotflow_common::{
    Artifact, ArtifactKind, InputRef, RunId, StageId, StageOutput, WorkerInput,
    normalize_jurisdiction,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

const COMMAND_BUFFER: usize = 16;
const DIAGNOSTIC_LINES: usize = 20;

/// Persist a new run and log its creation. The run is not driven yet.
pub(crate) fn create_run(
    shared: &Shared,
    pipeline: PipelineKind,
    theme: &str,
    jurisdictions: Vec<String>,
    interactive: bool,
) -> Result<RunRecord> {
    let record = RunRecord::new(pipeline.clone(), theme, jurisdictions.clone(), interactive);
    shared.registry.save(&record)?;
    shared.events.append(
        &record.id,
        RunEvent::RunCreated {
            pipeline,
            theme: theme.to_string(),
            jurisdictions,
            interactive,
        },
    )?;
    tracing::info!(run_id = %record.id, pipeline = %record.pipeline, "run created");
    Ok(record)
}

/// Start a driver task for `record` unless one is already running.
///
/// Returns `None` for finished runs.
pub(crate) fn ensure_driving(shared: &Arc<Shared>, record: RunRecord) -> Result<Option<ActiveRun>> {
    if record.is_terminal() {
        return Ok(None);
    }
    if let PipelineKind::Recon { jurisdiction } = &record.pipeline {
        let id = record.id.clone();
        shared
            .registry
            .claim_recon(&normalize_jurisdiction(jurisdiction), || Ok(id))?;
    }

    let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(record.state);
    let candidate = ActiveRun {
        commands: commands_tx,
        state: state_rx,
        task: None,
    };
    let (active, inserted) = shared.registry.register_active(record.id.clone(), candidate);
    if inserted {
        let id = record.id.clone();
        let driver = RunDriver::new(Arc::clone(shared), record, commands, state_tx);
        let task = tokio::spawn(driver.drive());
        shared.registry.set_task(&id, task.abort_handle());
    }
    Ok(Some(active))
}

/// Handle on a run, starting a driver only if none is registered.
///
/// The active index is checked before the record is read, so a driver that
/// finishes in between has already saved its terminal record.
pub(crate) fn attach(shared: &Arc<Shared>, id: &RunId) -> Result<Option<ActiveRun>> {
    if let Some(active) = shared.registry.active(id) {
        return Ok(Some(active));
    }
    let record = shared.registry.get(id)?;
    ensure_driving(shared, record)
}

/// Next command for the run; pends forever once every sender is gone.
async fn next_command(commands: &mut mpsc::Receiver<RunCommand>, open: &mut bool) -> RunCommand {
    if *open {
        if let Some(command) = commands.recv().await {
            return command;
        }
        *open = false;
    }
    std::future::pending().await
}

enum Attempt {
    Committed(CommitRecord),
    Failed(StageError),
    Aborted,
}

enum StageResult {
    Committed(CommitRecord),
    Failed {
        error: String,
        diagnostic: Vec<String>,
    },
    Aborted,
}

enum Wake {
    Finished,
    Command(RunCommand),
}

struct RunDriver {
    shared: Arc<Shared>,
    record: RunRecord,
    plan: Vec<StageSpec>,
    commands: mpsc::Receiver<RunCommand>,
    commands_open: bool,
    state_tx: watch::Sender<RunState>,
}

impl RunDriver {
    fn new(
        shared: Arc<Shared>,
        record: RunRecord,
        commands: mpsc::Receiver<RunCommand>,
        state_tx: watch::Sender<RunState>,
    ) -> Self {
        let plan = pipeline::plan(&record.pipeline, &shared.config.toml);
        Self {
            shared,
            record,
            plan,
            commands,
            commands_open: true,
            state_tx,
        }
    }

    async fn drive(mut self) {
        let id = self.record.id.clone();
        tracing::info!(run_id = %id, state = %self.record.state, "driving run");

        if let Err(e) = self.run_to_end().await {
            let error = format!("{:#}", e);
            tracing::error!(run_id = %id, error = %error, "run driver failed");
            if !self.record.is_terminal() {
                let stage = self.record.state.stage();
                if let Err(e) = self.finish_failed(stage, error, Vec::new()) {
                    tracing::error!(run_id = %id, error = %e, "failed to record run failure");
                }
            }
        }

        // The log on disk is complete; later readers reload it from there.
        self.shared.events.forget(&id);
        self.shared.registry.unregister_active(&id);
        if let PipelineKind::Recon { jurisdiction } = &self.record.pipeline {
            self.shared
                .registry
                .release_recon(&normalize_jurisdiction(jurisdiction), &id);
        }
    }

    async fn run_to_end(&mut self) -> Result<()> {
        if self.record.state == RunState::Initializing {
            let first = *self
                .record
                .stages()
                .first()
                .context("Pipeline has no stages")?;
            self.transition(RunState::working(first))?;
        }

        while !self.record.is_terminal() {
            match self.record.state {
                RunState::ReviewPending { gate } => self.await_review(gate).await?,
                state => {
                    let stage = state.stage().with_context(|| {
                        format!("Run {} is in unexpected state {}", self.record.id, state)
                    })?;
                    self.work(stage).await?;
                }
            }
        }
        Ok(())
    }

    async fn work(&mut self, stage: StageId) -> Result<()> {
        if stage == StageId::PreFlight && self.record.recon.is_empty() {
            self.resolve_jurisdictions()?;
        }

        match self.execute_stage(stage).await? {
            StageResult::Committed(commit) => {
                if stage == StageId::PreFlight && !self.join_recon().await? {
                    return self.finish_aborted(Some(stage));
                }
                if self.settings(stage)?.gated {
                    self.open_review(stage, commit.attempt)
                } else {
                    self.advance_from(stage)
                }
            }
            StageResult::Failed { error, diagnostic } => {
                self.finish_failed(Some(stage), error, diagnostic)
            }
            StageResult::Aborted => self.finish_aborted(Some(stage)),
        }
    }

    // ── Stage execution ──

    async fn execute_stage(&mut self, stage: StageId) -> Result<StageResult> {
        let settings = self.settings(stage)?;
        let backoff = self.shared.config.retry_backoff();

        loop {
            let last = self.record.last_execution(stage).cloned();

            // Budget already spent before a restart.
            if let Some(exec) = &last
                && let ExecutionStatus::Failed { error } = &exec.status
                && self.record.failures_since_review(stage) > settings.retries
            {
                return Ok(StageResult::Failed {
                    error: error.clone(),
                    diagnostic: diagnostic(&exec.exec_dir),
                });
            }

            let outcome = match last {
                Some(exec) if exec.status == ExecutionStatus::Succeeded => {
                    if let Some(commit) = self.committed_attempt(stage, exec.attempt)? {
                        return Ok(StageResult::Committed(commit));
                    }
                    self.launch_attempt(stage, &settings).await?
                }
                Some(exec) if exec.is_open() => self.reattach(stage, &exec, &settings).await?,
                _ => self.launch_attempt(stage, &settings).await?,
            };

            match outcome {
                Attempt::Committed(commit) => return Ok(StageResult::Committed(commit)),
                Attempt::Aborted => return Ok(StageResult::Aborted),
                Attempt::Failed(err) => {
                    let (attempt, exec_dir) = match self.record.last_execution(stage) {
                        Some(exec) => (exec.attempt, exec.exec_dir.clone()),
                        None => bail!("Stage {} failed without an execution record", stage),
                    };
                    let error = err.to_string();
                    let will_retry = err.is_retryable()
                        && self.record.failures_since_review(stage) <= settings.retries;
                    tracing::warn!(
                        run_id = %self.record.id,
                        stage = %stage,
                        attempt,
                        error = %error,
                        will_retry,
                        "stage attempt failed"
                    );
                    self.emit(RunEvent::StageFailed {
                        stage,
                        attempt,
                        error: error.clone(),
                        will_retry,
                    })?;
                    if !will_retry {
                        return Ok(StageResult::Failed {
                            error,
                            diagnostic: diagnostic(&exec_dir),
                        });
                    }
                    if self.backoff(backoff).await {
                        return Ok(StageResult::Aborted);
                    }
                }
            }
        }
    }

    async fn launch_attempt(&mut self, stage: StageId, settings: &StageSettings) -> Result<Attempt> {
        let attempt = self.record.next_attempt(stage);
        let exec_dir = self.shared.registry.exec_dir(&self.record.id, stage, attempt);

        self.record
            .executions
            .push(StageExecution::launching(stage, attempt, exec_dir.clone()));
        self.save()?;
        self.emit(RunEvent::StageLaunching {
            stage,
            attempt,
            exec_dir: exec_dir.clone(),
        })?;

        let input = self.worker_input(stage, attempt)?;
        let launched = launcher::launch(&LaunchRequest {
            run_id: &self.record.id,
            stage,
            attempt,
            command: &settings.command,
            exec_dir: &exec_dir,
            input: &input,
        });
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    run_id = %self.record.id,
                    stage = %stage,
                    attempt,
                    error = %e,
                    "worker launch failed"
                );
                return self.attempt_failed(stage, attempt, e.into(), None);
            }
        };

        let pid = handle.pid();
        if let Some(exec) = self.record.execution_mut(stage, attempt) {
            exec.pid = Some(pid);
            exec.started_at = Some(handle.started_at());
            exec.status = ExecutionStatus::Running;
        }
        self.save()?;
        self.emit(RunEvent::StageStarted { stage, attempt, pid })?;

        self.supervise(stage, attempt, handle, 0, settings).await
    }

    /// Pick up an execution left open by an earlier orchestrator process.
    async fn reattach(
        &mut self,
        stage: StageId,
        exec: &StageExecution,
        settings: &StageSettings,
    ) -> Result<Attempt> {
        let attempt = exec.attempt;
        if let Some(commit) = self.committed_attempt(stage, attempt)? {
            return self.finish_commit(stage, attempt, commit);
        }

        let Some(pid) = exec
            .pid
            .or_else(|| launcher::read_pid_file(&exec.exec_dir))
        else {
            tracing::warn!(
                run_id = %self.record.id,
                stage = %stage,
                attempt,
                "worker never recorded a pid; treating the attempt as crashed"
            );
            return self.attempt_failed(stage, attempt, WorkerFailure::Unrecorded.into(), None);
        };

        let started_at = exec.started_at.unwrap_or(self.record.updated_at);
        if let Some(open) = self.record.execution_mut(stage, attempt) {
            open.pid = Some(pid);
            open.started_at = Some(started_at);
            open.status = ExecutionStatus::Running;
        }
        self.save()?;

        let offset = self.relayed_offset(stage, attempt)?;
        tracing::info!(
            run_id = %self.record.id,
            stage = %stage,
            attempt,
            pid,
            log_offset = offset,
            "re-attaching to worker"
        );
        self.emit(RunEvent::WorkerReattached {
            stage,
            attempt,
            pid,
            log_offset: offset,
        })?;

        let handle = WorkerHandle::adopt(pid, exec.exec_dir.clone(), started_at);
        self.supervise(stage, attempt, handle, offset, settings).await
    }

    /// Wait for a worker to exit while relaying its log, enforcing the stage
    /// timeout and honoring aborts.
    async fn supervise(
        &mut self,
        stage: StageId,
        attempt: u32,
        mut handle: WorkerHandle,
        log_offset: u64,
        settings: &StageSettings,
    ) -> Result<Attempt> {
        let grace = self.shared.config.terminate_grace();
        let timeout = chrono::Duration::from_std(settings.timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let deadline = handle.started_at() + timeout;

        let mut tail = handle.log_tail(log_offset);
        let mut ticker = tokio::time::interval(self.shared.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let wake = tokio::select! {
                command = next_command(&mut self.commands, &mut self.commands_open) => Some(command),
                _ = ticker.tick() => None,
            };
            match wake {
                Some(RunCommand::Abort) => {
                    tracing::info!(
                        run_id = %self.record.id,
                        stage = %stage,
                        pid = handle.pid(),
                        "abort requested; terminating worker process group"
                    );
                    handle.terminate(grace).await;
                    self.relay(&mut tail, stage, attempt, true)?;
                    if let Some(exec) = self.record.execution_mut(stage, attempt) {
                        exec.status = ExecutionStatus::Aborted;
                        exec.ended_at = Some(Utc::now());
                        exec.log_range = Some((0, tail.offset()));
                    }
                    self.save()?;
                    return Ok(Attempt::Aborted);
                }
                Some(RunCommand::Decide { gate, .. }) => {
                    tracing::warn!(run_id = %self.record.id, gate = %gate, "ignoring decision: no review is pending");
                }
                None => {
                    self.relay(&mut tail, stage, attempt, false)?;
                    if let Some(exit) = handle.try_exit() {
                        break exit;
                    }
                    if Utc::now() >= deadline {
                        tracing::warn!(
                            run_id = %self.record.id,
                            stage = %stage,
                            attempt,
                            pid = handle.pid(),
                            "worker exceeded its timeout; terminating"
                        );
                        handle.terminate(grace).await;
                        break WorkerExit::TimedOut;
                    }
                }
            }
        };

        self.relay(&mut tail, stage, attempt, true)?;
        let exit_code = match exit {
            WorkerExit::Exited(code) => Some(code),
            _ => None,
        };
        if let Some(exec) = self.record.execution_mut(stage, attempt) {
            exec.exit_code = exit_code;
            exec.log_range = Some((0, tail.offset()));
        }

        let outputs = self.spec(stage)?.outputs;
        match exit.into_result(handle.pid(), settings.timeout) {
            Ok(()) => match self.commit(stage, attempt, outputs, &handle.output_path()) {
                Ok(commit) => self.finish_commit(stage, attempt, commit),
                Err(e) => self.attempt_failed(stage, attempt, e.into(), exit_code),
            },
            Err(failure) => self.attempt_failed(stage, attempt, failure.into(), exit_code),
        }
    }

    /// Relay complete log lines as `WorkerOutput` events.
    fn relay(&mut self, tail: &mut LogTail, stage: StageId, attempt: u32, finish: bool) -> Result<()> {
        let lines = if finish { tail.finish() } else { tail.poll() };
        let lines = match lines {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(run_id = %self.record.id, stage = %stage, error = %e, "failed to read worker log");
                return Ok(());
            }
        };
        for line in lines {
            self.emit(RunEvent::WorkerOutput {
                stage,
                attempt,
                offset: line.offset,
                end: line.end,
                line: line.line,
            })?;
        }
        Ok(())
    }

    /// Byte offset up to which an attempt's log was already relayed.
    fn relayed_offset(&self, stage: StageId, attempt: u32) -> Result<u64> {
        let history = self.shared.events.history(&self.record.id)?;
        Ok(history
            .iter()
            .rev()
            .find_map(|r| match &r.event {
                RunEvent::WorkerOutput {
                    stage: s,
                    attempt: a,
                    end,
                    ..
                } if *s == stage && *a == attempt => Some(*end),
                _ => None,
            })
            .unwrap_or(0))
    }

    /// Validate a worker's output and store it.
    fn commit(
        &self,
        stage: StageId,
        attempt: u32,
        outputs: &[ArtifactKind],
        output_path: &Path,
    ) -> Result<CommitRecord, ArtifactCommitError> {
        let content = fs::read(output_path).map_err(|_| ArtifactCommitError::MissingOutput {
            path: output_path.to_path_buf(),
        })?;
        let output: StageOutput =
            serde_json::from_slice(&content).map_err(|source| ArtifactCommitError::InvalidOutput {
                path: output_path.to_path_buf(),
                source,
            })?;

        let mut artifacts = Vec::with_capacity(outputs.len());
        for kind in outputs {
            match output.find(*kind) {
                Some(artifact) => artifacts.push(artifact.clone()),
                None => return Err(ArtifactCommitError::MissingKind { stage, kind: *kind }),
            }
        }

        // Cache first: a commit pointer for a recon attempt implies its cache entry exists.
        if let PipelineKind::Recon { jurisdiction } = &self.record.pipeline
            && let Some(Artifact::ResearchPayload { body, .. }) =
                output.find(ArtifactKind::ResearchPayload)
        {
            let stored = self
                .shared
                .cache
                .put(jurisdiction, body.clone(), Some(self.record.id.clone()))
                .map_err(ArtifactCommitError::Cache)?;
            tracing::info!(
                run_id = %self.record.id,
                jurisdiction = %stored.entry.key,
                path = %stored.path.display(),
                "recon result cached"
            );
        }

        self.shared
            .artifacts
            .commit(&self.record.id, stage, attempt, &artifacts)
    }

    fn finish_commit(&mut self, stage: StageId, attempt: u32, commit: CommitRecord) -> Result<Attempt> {
        let history = self.shared.events.history(&self.record.id)?;
        let announced: Vec<ArtifactKind> = history
            .iter()
            .filter_map(|r| match &r.event {
                RunEvent::ArtifactCommitted {
                    stage: s,
                    attempt: a,
                    kind,
                    ..
                } if *s == stage && *a == attempt => Some(*kind),
                _ => None,
            })
            .collect();
        for artifact in &commit.artifacts {
            if !announced.contains(&artifact.kind) {
                self.emit(RunEvent::artifact_committed(stage, artifact))?;
            }
        }

        if let Some(exec) = self.record.execution_mut(stage, attempt) {
            exec.status = ExecutionStatus::Succeeded;
            exec.ended_at.get_or_insert_with(Utc::now);
            exec.artifacts = commit.artifacts.clone();
        }
        self.save()?;
        tracing::info!(run_id = %self.record.id, stage = %stage, attempt, "stage committed");
        Ok(Attempt::Committed(commit))
    }

    fn attempt_failed(
        &mut self,
        stage: StageId,
        attempt: u32,
        err: StageError,
        exit_code: Option<i32>,
    ) -> Result<Attempt> {
        if let Some(exec) = self.record.execution_mut(stage, attempt) {
            exec.status = ExecutionStatus::Failed {
                error: err.to_string(),
            };
            exec.ended_at = Some(Utc::now());
            if exit_code.is_some() {
                exec.exit_code = exit_code;
            }
        }
        self.save()?;
        Ok(Attempt::Failed(err))
    }

    fn committed_attempt(&self, stage: StageId, attempt: u32) -> Result<Option<CommitRecord>> {
        Ok(self
            .shared
            .artifacts
            .committed(&self.record.id, stage)?
            .filter(|c| c.attempt == attempt))
    }

    fn worker_input(&self, stage: StageId, attempt: u32) -> Result<WorkerInput> {
        let mut inputs = Vec::new();
        for dependency in self.spec(stage)?.inputs {
            let commit = self
                .shared
                .artifacts
                .committed(&self.record.id, *dependency)?
                .with_context(|| format!("Stage {} has no committed output for {}", dependency, stage))?;
            inputs.extend(commit.artifacts.into_iter().map(|a| InputRef {
                stage: a.stage,
                kind: a.kind,
                path: a.path,
            }));
        }

        let (cached, uncached) = if pipeline::uses_jurisdiction_research(stage) {
            (self.record.cached_refs(), self.record.uncached())
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(WorkerInput {
            run_id: self.record.id.clone(),
            stage,
            attempt,
            theme: self.record.theme.clone(),
            jurisdictions: self.record.jurisdictions.clone(),
            inputs,
            cached,
            uncached,
            feedback: self.record.feedback_for(stage),
        })
    }

    /// Sleep through a retry backoff. Returns true if the run was aborted.
    async fn backoff(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = next_command(&mut self.commands, &mut self.commands_open) => match command {
                    RunCommand::Abort => return true,
                    RunCommand::Decide { gate, .. } => {
                        tracing::warn!(run_id = %self.record.id, gate = %gate, "ignoring decision: no review is pending");
                    }
                },
            }
        }
    }

    // ── Recon fan-out / fan-in ──

    fn resolve_jurisdictions(&mut self) -> Result<()> {
        let now = Utc::now();
        let mut links: Vec<ReconLink> = Vec::new();

        for jurisdiction in self.record.jurisdictions.clone() {
            let key = normalize_jurisdiction(&jurisdiction);
            if key.is_empty() || links.iter().any(|l| l.key == key) {
                continue;
            }

            let status = match self.shared.cache.lookup(&jurisdiction, now)? {
                CacheLookup::Fresh(stored) => {
                    self.emit(RunEvent::CacheHit {
                        jurisdiction: jurisdiction.clone(),
                        fetched_at: stored.entry.fetched_at,
                    })?;
                    ReconStatus::Cached {
                        entry: stored.to_cache_ref(),
                    }
                }
                lookup => {
                    if let CacheLookup::Stale(stored) = &lookup {
                        tracing::info!(
                            run_id = %self.record.id,
                            jurisdiction = %key,
                            fetched_at = %stored.entry.fetched_at,
                            "cached research is stale"
                        );
                    }
                    let (recon_run, joined) = self.shared.registry.claim_recon(&key, || {
                        create_run(
                            &self.shared,
                            PipelineKind::Recon {
                                jurisdiction: jurisdiction.clone(),
                            },
                            &jurisdiction,
                            vec![jurisdiction.clone()],
                            false,
                        )
                        .map(|record| record.id)
                    })?;
                    attach(&self.shared, &recon_run)?;
                    self.emit(RunEvent::ReconStarted {
                        jurisdiction: jurisdiction.clone(),
                        recon_run: recon_run.clone(),
                        joined,
                    })?;
                    ReconStatus::Pending { recon_run }
                }
            };

            links.push(ReconLink {
                jurisdiction,
                key,
                status,
            });
        }

        self.record.recon = links;
        self.save()
    }

    /// Wait for every pending recon run. Returns false if the run was aborted.
    async fn join_recon(&mut self) -> Result<bool> {
        for (index, recon_run) in self.record.pending_recon() {
            let Some(finished) = self.wait_for_run(&recon_run).await? else {
                return Ok(false);
            };
            let jurisdiction = self.record.recon[index].jurisdiction.clone();

            let status = if finished.state == RunState::Completed {
                match self.shared.cache.get(&jurisdiction)? {
                    Some(stored) => ReconStatus::Cached {
                        entry: stored.to_cache_ref(),
                    },
                    None => ReconStatus::Uncached {
                        reason: "recon run completed without a cache entry".into(),
                        recon_run: Some(recon_run.clone()),
                    },
                }
            } else {
                ReconStatus::Uncached {
                    reason: recon_failure_reason(&finished),
                    recon_run: Some(recon_run.clone()),
                }
            };

            self.emit(RunEvent::ReconFinished {
                jurisdiction: jurisdiction.clone(),
                recon_run: recon_run.clone(),
                cached: matches!(status, ReconStatus::Cached { .. }),
            })?;
            if let ReconStatus::Uncached { reason, .. } = &status {
                tracing::warn!(
                    run_id = %self.record.id,
                    jurisdiction = %jurisdiction,
                    reason = %reason,
                    "continuing without cached research"
                );
                self.emit(RunEvent::JurisdictionUncached {
                    jurisdiction,
                    reason: reason.clone(),
                })?;
            }
            self.record.recon[index].status = status;
            self.save()?;
        }
        Ok(true)
    }

    /// Wait until another run is terminal. `None` means this run was aborted first.
    async fn wait_for_run(&mut self, id: &RunId) -> Result<Option<RunRecord>> {
        let Some(active) = attach(&self.shared, id)? else {
            return Ok(Some(self.shared.registry.get(id)?));
        };
        let mut state = active.state;

        tracing::debug!(run_id = %self.record.id, recon_run = %id, "waiting for recon run");
        loop {
            let wake = tokio::select! {
                _ = terminal(&mut state) => Wake::Finished,
                command = next_command(&mut self.commands, &mut self.commands_open) => Wake::Command(command),
            };
            match wake {
                Wake::Finished => return Ok(Some(self.shared.registry.get(id)?)),
                Wake::Command(RunCommand::Abort) => return Ok(None),
                Wake::Command(RunCommand::Decide { gate, .. }) => {
                    tracing::warn!(run_id = %self.record.id, gate = %gate, "ignoring decision: no review is pending");
                }
            }
        }
    }

    // ── Review gates ──

    fn open_review(&mut self, gate: StageId, attempt: u32) -> Result<()> {
        self.record.reviews.push(ReviewRecord::open(gate, attempt));
        self.transition(RunState::ReviewPending { gate })
    }

    async fn await_review(&mut self, gate: StageId) -> Result<()> {
        let attempt = self
            .record
            .open_review()
            .filter(|r| r.gate == gate)
            .map(|r| r.attempt)
            .with_context(|| format!("Run {} has no open review for {}", self.record.id, gate))?;
        self.announce_review(gate, attempt)?;

        if !self.record.interactive {
            return self.apply_decision(gate, Decision::Approve, true);
        }

        loop {
            match next_command(&mut self.commands, &mut self.commands_open).await {
                RunCommand::Decide {
                    gate: decided,
                    decision,
                } if decided == gate => return self.apply_decision(gate, decision, false),
                RunCommand::Decide { gate: other, .. } => {
                    tracing::warn!(run_id = %self.record.id, gate = %other, pending = %gate, "ignoring decision for another gate");
                }
                RunCommand::Abort => return self.finish_aborted(Some(gate)),
            }
        }
    }

    /// Emit `ReviewPending` unless the latest event for this gate already announced it.
    fn announce_review(&mut self, gate: StageId, attempt: u32) -> Result<()> {
        let history = self.shared.events.history(&self.record.id)?;
        let latest = history.iter().rev().find_map(|r| match &r.event {
            RunEvent::ReviewPending { gate: g, .. } | RunEvent::ReviewDecided { gate: g, .. }
                if *g == gate =>
            {
                Some(&r.event)
            }
            _ => None,
        });
        if let Some(RunEvent::ReviewPending { attempt: a, .. }) = latest
            && *a == attempt
        {
            return Ok(());
        }

        let artifacts = self
            .shared
            .artifacts
            .committed(&self.record.id, gate)?
            .map(|c| c.artifacts.into_iter().map(|a| a.path).collect())
            .unwrap_or_default();
        tracing::info!(run_id = %self.record.id, gate = %gate, attempt, "review pending");
        self.emit(RunEvent::ReviewPending {
            gate,
            attempt,
            artifacts,
        })
    }

    fn apply_decision(&mut self, gate: StageId, decision: Decision, automatic: bool) -> Result<()> {
        self.record.decide_review(gate, &decision, automatic);
        self.emit(RunEvent::ReviewDecided {
            gate,
            decision: decision.clone(),
            automatic,
        })?;

        match decision {
            Decision::Approve => self.advance_from(gate),
            Decision::Reject { feedback } => {
                let attempt = self
                    .record
                    .last_execution(gate)
                    .map(|e| e.attempt)
                    .unwrap_or_default();
                if let Some(exec) = self.record.execution_mut(gate, attempt) {
                    exec.status = ExecutionStatus::Superseded;
                }
                if let Some(text) = feedback {
                    self.record.feedback.push(Feedback {
                        stage: gate,
                        after_attempt: attempt,
                        text,
                    });
                }
                self.transition(RunState::working(gate))?;
                self.shared.artifacts.retract(&self.record.id, gate)?;
                tracing::info!(run_id = %self.record.id, gate = %gate, attempt, "review rejected; stage re-queued");
                Ok(())
            }
        }
    }

    // ── Transitions ──

    fn advance_from(&mut self, stage: StageId) -> Result<()> {
        let stages = self.record.stages();
        let index = stages
            .iter()
            .position(|s| *s == stage)
            .with_context(|| format!("Stage {} is not part of {}", stage, self.record.pipeline))?;
        match stages.get(index + 1) {
            Some(next) => self.transition(RunState::working(*next)),
            None => self.complete(),
        }
    }

    fn transition(&mut self, to: RunState) -> Result<()> {
        let from = self.record.state;
        let stages = self.record.stages();
        if !from.can_transition(&to, stages) {
            bail!(
                "Illegal transition {} -> {} for run {}",
                from,
                to,
                self.record.id
            );
        }

        self.record.state = to;
        if let Some(index) = to.stage().and_then(|s| stages.iter().position(|x| *x == s)) {
            self.record.stage_index = index;
        } else if to == RunState::Completed {
            self.record.stage_index = stages.len();
        }
        self.save()?;

        // Terminal states are published after the terminal event, see `finish`.
        if !to.is_terminal() {
            self.state_tx.send_replace(to);
        }
        tracing::info!(run_id = %self.record.id, from = %from, to = %to, "state changed");
        self.emit(RunEvent::StateChanged { from, to })
    }

    fn complete(&mut self) -> Result<()> {
        let commits = self
            .shared
            .artifacts
            .authoritative(&self.record.id, self.record.stages())?;
        let manifest = RunManifest {
            run_id: self.record.id.clone(),
            theme: self.record.theme.clone(),
            jurisdictions: self.record.jurisdictions.clone(),
            completed_at: Utc::now(),
            artifacts: commits.into_iter().flat_map(|c| c.artifacts).collect(),
            cached: self.record.cached_refs(),
            uncached: self.record.uncached(),
        };
        let path = self.shared.artifacts.write_manifest(&manifest)?;

        self.record.outcome = Some(RunOutcome::Succeeded {
            manifest: path.clone(),
        });
        self.finish(RunState::Completed, RunEvent::RunCompleted { manifest: path })
    }

    fn finish_failed(
        &mut self,
        stage: Option<StageId>,
        error: String,
        diagnostic: Vec<String>,
    ) -> Result<()> {
        self.record.outcome = Some(RunOutcome::Failed {
            stage,
            error: error.clone(),
            diagnostic: diagnostic.clone(),
        });
        self.finish(
            RunState::Failed,
            RunEvent::RunFailed {
                stage,
                error,
                diagnostic,
            },
        )
    }

    fn finish_aborted(&mut self, stage: Option<StageId>) -> Result<()> {
        self.record.outcome = Some(RunOutcome::Aborted { stage });
        self.finish(RunState::Aborted, RunEvent::RunAborted { stage })
    }

    fn finish(&mut self, state: RunState, event: RunEvent) -> Result<()> {
        self.transition(state)?;
        self.emit(event)?;
        self.state_tx.send_replace(state);
        tracing::info!(run_id = %self.record.id, state = %state, "run finished");
        Ok(())
    }

    // ── Helpers ──

    fn spec(&self, stage: StageId) -> Result<&StageSpec> {
        self.plan
            .iter()
            .find(|s| s.id == stage)
            .with_context(|| format!("Stage {} is not part of {}", stage, self.record.pipeline))
    }

    fn settings(&self, stage: StageId) -> Result<StageSettings> {
        Ok(self.spec(stage)?.settings.clone())
    }

    fn save(&mut self) -> Result<()> {
        self.record.touch();
        self.shared.registry.save(&self.record)
    }

    fn emit(&self, event: RunEvent) -> Result<()> {
        self.shared.events.append(&self.record.id, event)?;
        Ok(())
    }
}

/// Resolves once the watched run is terminal or its driver is gone.
async fn terminal(state: &mut watch::Receiver<RunState>) {
    let _ = state.wait_for(RunState::is_terminal).await;
}

fn diagnostic(exec_dir: &Path) -> Vec<String> {
    launcher::last_lines(&exec_dir.join(launcher::LOG_FILE), DIAGNOSTIC_LINES)
}

fn recon_failure_reason(record: &RunRecord) -> String {
    match &record.outcome {
        Some(RunOutcome::Failed { error, .. }) => {
            format!("recon run {} failed: {}", record.id.short(), error)
        }
        Some(RunOutcome::Aborted { .. }) => format!("recon run {} was aborted", record.id.short()),
        _ => format!("recon run {} ended in state {}", record.id.short(), record.state),
    }
}
