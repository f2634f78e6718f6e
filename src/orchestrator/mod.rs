//! The orchestrator: one handle over the run registry, event hub, artifact
//! store and knowledge cache, plus the driver tasks advancing each run.
//!
//! Only one orchestrator drives a state directory at a time; [`Orchestrator::open`]
//! takes an exclusive lock on it. Dropping the orchestrator stops the driver
//! tasks but leaves workers running, so a later [`Orchestrator::resume_all`]
//! can adopt them.

pub mod runner;
pub mod state;

pub use state::RunState;

use crate::artifacts::ArtifactStore;
use crate::cache::KnowledgeCache;
use crate::config::SlotflowConfig;
use crate::errors::{LaunchError, OrchestratorError};
use crate::events::{EventHub, EventRecord, EventStream};
use crate::gates::Decision;
use crate::pipeline::{self, PipelineKind};
use crate::registry::{ActiveRun, RunCommand, RunRecord, RunRegistry, StateLock};
use anyhow::anyhow;
use chrono::Utc;
use runner::{attach, create_run, ensure_driving};
use slotflow_common::{RunId, StageId, normalize_jurisdiction};
use std::sync::Arc;

/// State shared between the façade and every driver task.
pub(crate) struct Shared {
    pub(crate) config: SlotflowConfig,
    pub(crate) registry: RunRegistry,
    pub(crate) events: EventHub,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) cache: KnowledgeCache,
}

/// Parameters of a new game run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub theme: String,
    pub jurisdictions: Vec<String>,
    /// Wait for external decisions at review gates
    pub interactive: bool,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    _lock: StateLock,
}

impl Orchestrator {
    /// Open the state directory and lock it for this process.
    pub fn open(config: SlotflowConfig) -> Result<Self, OrchestratorError> {
        config.ensure_directories()?;
        let lock = StateLock::acquire(&config.lock_file())?;

        let shared = Shared {
            registry: RunRegistry::new(config.runs_dir()),
            events: EventHub::new(config.runs_dir(), config.subscriber_max_backlog()),
            artifacts: ArtifactStore::new(config.artifacts_dir()),
            cache: KnowledgeCache::new(&config.cache_dir(), config.freshness()?),
            config,
        };
        tracing::debug!(state_dir = %shared.config.state_dir.display(), "orchestrator opened");

        Ok(Self {
            shared: Arc::new(shared),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &SlotflowConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &KnowledgeCache {
        &self.shared.cache
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.shared.artifacts
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.shared.registry
    }

    /// Create a game run and start driving it. Must be called within a tokio runtime.
    pub fn start(&self, request: RunRequest) -> Result<RunId, OrchestratorError> {
        let theme = request.theme.trim();
        if theme.is_empty() {
            return Err(anyhow!("A run needs a theme").into());
        }
        let jurisdictions: Vec<String> = request
            .jurisdictions
            .iter()
            .map(|j| j.trim().to_string())
            .filter(|j| !normalize_jurisdiction(j).is_empty())
            .collect();
        if jurisdictions.is_empty() {
            return Err(OrchestratorError::NoJurisdictions);
        }
        self.check_commands(&PipelineKind::Game)?;

        let record = create_run(
            &self.shared,
            PipelineKind::Game,
            theme,
            jurisdictions,
            request.interactive,
        )?;
        let id = record.id.clone();
        ensure_driving(&self.shared, record)?;
        Ok(id)
    }

    /// Research one jurisdiction outside the game pipeline.
    ///
    /// Joins the in-flight recon run for the same jurisdiction if there is
    /// one; the flag says whether it did.
    pub fn recon(&self, jurisdiction: &str) -> Result<(RunId, bool), OrchestratorError> {
        let jurisdiction = jurisdiction.trim();
        let key = normalize_jurisdiction(jurisdiction);
        if key.is_empty() {
            return Err(OrchestratorError::NoJurisdictions);
        }
        let kind = PipelineKind::Recon {
            jurisdiction: jurisdiction.to_string(),
        };
        self.check_commands(&kind)?;

        let (id, joined) = self.shared.registry.claim_recon(&key, || {
            create_run(
                &self.shared,
                kind.clone(),
                jurisdiction,
                vec![jurisdiction.to_string()],
                false,
            )
            .map(|record| record.id)
        })?;
        attach(&self.shared, &id)?;
        Ok((id, joined))
    }

    /// Re-attach every non-terminal run found in the registry.
    pub fn resume_all(&self) -> Result<Vec<RunId>, OrchestratorError> {
        let mut records = self.shared.registry.non_terminal()?;
        // Recon runs first, so parents waiting on them join instead of re-launching.
        records.sort_by_key(|r| !r.pipeline.is_recon());

        let mut resumed = Vec::new();
        for record in records {
            let id = record.id.clone();
            if ensure_driving(&self.shared, record)?.is_some() {
                resumed.push(id);
            }
        }
        tracing::info!(count = resumed.len(), "resumed runs");
        Ok(resumed)
    }

    /// Replay a run's events from the start, then follow it live.
    pub fn subscribe(&self, id: &RunId) -> Result<EventStream, OrchestratorError> {
        self.shared.registry.get(id)?;
        Ok(self.shared.events.subscribe(id)?)
    }

    pub fn history(&self, id: &RunId) -> Result<Vec<EventRecord>, OrchestratorError> {
        self.shared.registry.get(id)?;
        Ok(self.shared.events.history(id)?)
    }

    /// Deliver a decision for the review pending at `gate`.
    pub async fn decide(
        &self,
        id: &RunId,
        gate: StageId,
        decision: Decision,
    ) -> Result<(), OrchestratorError> {
        let active = self.active(id)?;
        let current = *active.state.borrow();
        if current != (RunState::ReviewPending { gate }) {
            return Err(OrchestratorError::NotAwaitingReview {
                id: id.clone(),
                gate,
            });
        }
        tracing::info!(run_id = %id, gate = %gate, approve = decision.is_approve(), "review decision");
        active
            .commands
            .send(RunCommand::Decide { gate, decision })
            .await
            .map_err(|_| OrchestratorError::NotActive { id: id.clone() })
    }

    /// Abort a run: its current worker's process group is terminated.
    pub async fn abort(&self, id: &RunId) -> Result<(), OrchestratorError> {
        let active = self.active(id)?;
        tracing::info!(run_id = %id, "abort requested");
        active
            .commands
            .send(RunCommand::Abort)
            .await
            .map_err(|_| OrchestratorError::NotActive { id: id.clone() })
    }

    /// Wait until a run is terminal and return its final record.
    ///
    /// Returns at once for runs this orchestrator is not driving.
    pub async fn wait(&self, id: &RunId) -> Result<RunRecord, OrchestratorError> {
        if let Some(active) = self.shared.registry.active(id) {
            let mut state = active.state;
            let _ = state.wait_for(RunState::is_terminal).await;
        }
        self.shared.registry.get(id)
    }

    /// Current state of a driven run, without touching disk.
    pub fn state(&self, id: &RunId) -> Option<RunState> {
        self.shared
            .registry
            .active(id)
            .map(|active| *active.state.borrow())
    }

    pub fn status(&self, id: &RunId) -> Result<RunRecord, OrchestratorError> {
        self.shared.registry.get(id)
    }

    pub fn list(&self) -> Result<Vec<RunRecord>, OrchestratorError> {
        Ok(self.shared.registry.list()?)
    }

    /// Delete terminal runs older than `retention` (default: the configured window).
    pub fn purge(&self, retention: Option<chrono::Duration>) -> Result<Vec<RunId>, OrchestratorError> {
        let retention = match retention {
            Some(retention) => retention,
            None => self.shared.config.retention()?,
        };
        let purged = self.shared.registry.purge(retention, Utc::now())?;
        for id in &purged {
            self.shared.events.forget(id);
        }
        Ok(purged)
    }

    /// Stop driving runs. Workers keep running and are adopted on the next resume.
    pub fn shutdown(self) {
        let active = self.shared.registry.active_ids().len();
        tracing::info!(active, "orchestrator shutting down; workers keep running");
    }

    fn active(&self, id: &RunId) -> Result<ActiveRun, OrchestratorError> {
        if let Some(active) = self.shared.registry.active(id) {
            // The driver unregisters just after publishing its terminal state.
            if active.state.borrow().is_terminal() {
                return Err(OrchestratorError::RunFinished { id: id.clone() });
            }
            return Ok(active);
        }
        let record = self.shared.registry.get(id)?;
        if record.is_terminal() {
            Err(OrchestratorError::RunFinished { id: id.clone() })
        } else {
            Err(OrchestratorError::NotActive { id: id.clone() })
        }
    }

    /// A stage without a command can never launch; refuse the run up front.
    fn check_commands(&self, kind: &PipelineKind) -> Result<(), OrchestratorError> {
        for spec in pipeline::plan(kind, &self.shared.config.toml) {
            if spec.settings.command.trim().is_empty() {
                return Err(LaunchError::EmptyCommand { stage: spec.id }.into());
            }
        }
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shared.registry.detach_all();
    }
}
