//! End-to-end orchestrator tests.
//!
//! Every test drives real `sh` stage workers written into a temporary state
//! directory. The worker takes a mode argument and writes the artifacts its
//! stage declares.

use chrono::Utc;
use futures::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::json;
use slotflow::artifacts::RunManifest;
use slotflow::cache::KnowledgeCache;
use slotflow::config::SlotflowConfig;
use slotflow::errors::{LaunchError, OrchestratorError};
use slotflow::events::{EventRecord, RunEvent};
use slotflow::gates::Decision;
use slotflow::launcher;
use slotflow::pipeline::PipelineKind;
use slotflow::registry::{ExecutionStatus, ReconStatus, RunOutcome, RunRecord, RunRegistry};
use slotflow::{Orchestrator, RunRequest, RunState};
use slotflow_common::{RunId, StageId, WorkerInput};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const WORKER: &str = r#"#!/bin/sh
mode="${1:-ok}"
echo "stage $SLOTFLOW_STAGE attempt $SLOTFLOW_ATTEMPT mode $mode"
case "$mode" in
  fail) echo "boom" >&2; exit 3 ;;
  fail-once)
    if [ "$SLOTFLOW_ATTEMPT" = "1" ]; then echo "first attempt fails" >&2; exit 1; fi ;;
  slow) sleep 2 ;;
  sleep) sleep 30 ;;
  sleep-once)
    if [ "$SLOTFLOW_ATTEMPT" = "1" ]; then sleep 30; fi ;;
  no-output) exit 0 ;;
esac
case "$SLOTFLOW_STAGE" in
  preflight) out='[{"kind":"preflight_intel","body":{"ok":true}}]' ;;
  research) out='[{"kind":"research_payload","subject":"game","body":{"notes":"synthesis"}}]' ;;
  recon) out='[{"kind":"research_payload","subject":"jurisdiction","body":{"max_bet":100}}]' ;;
  design_math) out='[{"kind":"design_document","title":"GDD"},{"kind":"math_tables","body":{"rtp":0.96}}]' ;;
  art_audio) out='[{"kind":"art_asset_set","assets":[]},{"kind":"audio_asset_set","assets":[]}]' ;;
  assembly) out='[{"kind":"package","assets":[]}]' ;;
esac
printf '{"artifacts":%s}\n' "$out" > "$SLOTFLOW_OUTPUT"
echo "done"
"#;

const WAIT: Duration = Duration::from_secs(30);

struct Harness {
    dir: TempDir,
}

impl Harness {
    /// State directory with a fast-polling config; `extra` is appended to slotflow.toml.
    fn new(extra: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let worker = dir.path().join("worker.sh");
        fs::write(&worker, WORKER).unwrap();

        let state_dir = dir.path().join("state");
        fs::create_dir_all(&state_dir).unwrap();
        let toml = format!(
            r#"[orchestrator]
worker_cmd = "{}"
poll_interval_ms = 20
terminate_grace_secs = 1

[retry]
retries = 2
backoff_ms = 10

{}
"#,
            Self::command_for(&worker, "ok"),
            extra.replace("WORKER", &worker.display().to_string())
        );
        fs::write(state_dir.join("slotflow.toml"), toml).unwrap();

        Self { dir }
    }

    fn command_for(worker: &Path, mode: &str) -> String {
        format!("sh {} {}", worker.display(), mode)
    }

    fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    fn config(&self) -> SlotflowConfig {
        SlotflowConfig::new(self.state_dir()).unwrap()
    }

    fn open(&self) -> Orchestrator {
        Orchestrator::open(self.config()).unwrap()
    }

    fn cache(&self) -> KnowledgeCache {
        let config = self.config();
        KnowledgeCache::new(&config.cache_dir(), config.freshness().unwrap())
    }

    /// Seed a fresh cache entry so the run needs no recon.
    fn seed_cache(&self, jurisdiction: &str) {
        self.cache()
            .put(jurisdiction, json!({"seeded": true}), None)
            .unwrap();
    }

    fn input_of(&self, orchestrator: &Orchestrator, id: &RunId, stage: StageId, attempt: u32) -> WorkerInput {
        let path = orchestrator
            .registry()
            .exec_dir(id, stage, attempt)
            .join(launcher::INPUT_FILE);
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }
}

fn request(jurisdictions: &[&str], interactive: bool) -> RunRequest {
    RunRequest {
        theme: "pharaoh's gold".into(),
        jurisdictions: jurisdictions.iter().map(|j| j.to_string()).collect(),
        interactive,
    }
}

async fn finish(orchestrator: &Orchestrator, id: &RunId) -> RunRecord {
    tokio::time::timeout(WAIT, orchestrator.wait(id))
        .await
        .expect("run did not finish in time")
        .unwrap()
}

/// Poll the run record until `pred` holds.
async fn wait_until(orchestrator: &Orchestrator, id: &RunId, pred: impl Fn(&RunRecord) -> bool) -> RunRecord {
    tokio::time::timeout(WAIT, async {
        loop {
            let record = orchestrator.status(id).unwrap();
            if pred(&record) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

async fn wait_for_review(orchestrator: &Orchestrator, id: &RunId, gate: StageId, attempt: u32) {
    wait_until(orchestrator, id, |r| {
        r.state == (RunState::ReviewPending { gate })
            && r.open_review().is_some_and(|o| o.gate == gate && o.attempt == attempt)
    })
    .await;
    tokio::time::timeout(WAIT, async {
        while orchestrator.state(id) != Some(RunState::ReviewPending { gate }) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn events(orchestrator: &Orchestrator, id: &RunId) -> Vec<RunEvent> {
    orchestrator
        .history(id)
        .unwrap()
        .into_iter()
        .map(|r| r.event)
        .collect()
}

fn position(events: &[RunEvent], pred: impl Fn(&RunEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

fn launches(events: &[RunEvent], stage: StageId) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::StageLaunching { stage: s, .. } if *s == stage))
        .count()
}

/// Start a run whose preflight worker hangs on its first attempt, then stop
/// the orchestrator and SIGKILL the worker's process group behind its back.
async fn kill_preflight_while_detached(harness: &Harness) -> RunId {
    let first = harness.open();
    let id = first.start(request(&["Texas"], false)).unwrap();
    let record = wait_until(&first, &id, |r| {
        r.last_execution(StageId::PreFlight)
            .is_some_and(|e| e.status == ExecutionStatus::Running && e.pid.is_some())
    })
    .await;
    let pid = record
        .last_execution(StageId::PreFlight)
        .and_then(|e| e.pid)
        .unwrap();
    first.shutdown();

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => panic!("failed to kill worker group {}: {}", pid, e),
    }
    tokio::time::timeout(WAIT, async {
        while launcher::process_alive(pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("worker survived SIGKILL");
    id
}

/// Every game stage committed by exactly one attempt.
fn assert_each_stage_committed_once(events: &[RunEvent]) {
    for stage in StageId::GAME.iter().copied() {
        let attempts: HashSet<u32> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::ArtifactCommitted { stage: s, attempt, .. } if *s == stage => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts.len(), 1, "{} committed by attempts {:?}", stage, attempts);
    }
}

fn recon_runs(orchestrator: &Orchestrator) -> Vec<RunRecord> {
    orchestrator
        .list()
        .unwrap()
        .into_iter()
        .filter(|r| r.pipeline.is_recon())
        .collect()
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn test_run_completes_with_all_artifacts_and_auto_reviews() {
    let harness = Harness::new("");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;

    assert_eq!(record.state, RunState::Completed);
    let Some(RunOutcome::Succeeded { manifest }) = &record.outcome else {
        panic!("expected success, got {:?}", record.outcome);
    };
    let manifest: RunManifest = serde_json::from_str(&fs::read_to_string(manifest).unwrap()).unwrap();
    assert_eq!(manifest.artifacts.len(), 7);
    assert_eq!(manifest.cached.len(), 1);
    assert!(manifest.uncached.is_empty());
    for artifact in &manifest.artifacts {
        assert!(artifact.path.exists(), "missing {}", artifact.path.display());
    }

    let events = events(&orchestrator, &id);
    assert!(matches!(events.first(), Some(RunEvent::RunCreated { .. })));
    assert!(matches!(events.last(), Some(RunEvent::RunCompleted { .. })));

    // Research and design/math are gated by default and auto-approved.
    for gate in [StageId::Research, StageId::DesignMath] {
        let pending = position(&events, |e| matches!(e, RunEvent::ReviewPending { gate: g, .. } if *g == gate));
        let decided = position(&events, |e| {
            matches!(e, RunEvent::ReviewDecided { gate: g, automatic: true, decision } if *g == gate && decision.is_approve())
        });
        assert!(pending.unwrap() < decided.unwrap());
    }
    assert!(!events
        .iter()
        .any(|e| matches!(e, RunEvent::ReviewPending { gate: StageId::ArtAudio, .. })));

    // Texas was not cached, so a recon run filled the cache.
    assert_eq!(recon_runs(&orchestrator).len(), 1);
    assert!(harness.cache().get("texas").unwrap().is_some());
}

#[tokio::test]
async fn test_failed_recon_marks_jurisdiction_uncached() {
    let harness = Harness::new(
        r#"
[stages.recon]
command = "sh WORKER fail"
retries = 0
"#,
    );
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas", "Georgia"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;
    assert_eq!(record.state, RunState::Completed);

    // Only Georgia needed recon.
    let recon = recon_runs(&orchestrator);
    assert_eq!(recon.len(), 1);
    assert_eq!(recon[0].state, RunState::Failed);

    let texas = record.recon.iter().find(|l| l.key == "texas").unwrap();
    assert!(matches!(texas.status, ReconStatus::Cached { .. }));
    let georgia = record.recon.iter().find(|l| l.key == "georgia").unwrap();
    assert!(matches!(georgia.status, ReconStatus::Uncached { .. }));

    // Fan-in completes before research starts.
    let events = events(&orchestrator, &id);
    let finished = position(&events, |e| {
        matches!(e, RunEvent::ReconFinished { jurisdiction, cached: false, .. } if jurisdiction == "Georgia")
    })
    .unwrap();
    let researching = position(&events, |e| {
        matches!(e, RunEvent::StateChanged { to: RunState::Researching, .. })
    })
    .unwrap();
    assert!(finished < researching);
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::JurisdictionUncached { jurisdiction, .. } if jurisdiction == "Georgia")));

    let input = harness.input_of(&orchestrator, &id, StageId::Research, 1);
    assert_eq!(input.uncached, vec!["Georgia".to_string()]);
    assert_eq!(input.cached.len(), 1);
    assert_eq!(input.cached[0].jurisdiction, "Texas");
    assert_eq!(input.inputs.len(), 1);

    // Preflight never sees jurisdiction research.
    let preflight = harness.input_of(&orchestrator, &id, StageId::PreFlight, 1);
    assert!(preflight.cached.is_empty());
    assert!(preflight.uncached.is_empty());
}

// =============================================================================
// Retries and failures
// =============================================================================

#[tokio::test]
async fn test_failed_attempt_is_retried() {
    let harness = Harness::new(
        r#"
[stages.design_math]
command = "sh WORKER fail-once"
"#,
    );
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;
    assert_eq!(record.state, RunState::Completed);

    let attempts: Vec<_> = record.executions_of(StageId::DesignMath).collect();
    assert_eq!(attempts.len(), 2);
    assert!(matches!(attempts[0].status, ExecutionStatus::Failed { .. }));
    assert_eq!(attempts[0].exit_code, Some(1));
    assert_eq!(attempts[1].status, ExecutionStatus::Succeeded);

    let events = events(&orchestrator, &id);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::StageFailed { stage: StageId::DesignMath, attempt: 1, will_retry: true, .. }
    )));
    // The approved design is the second attempt's.
    let commit = orchestrator
        .artifacts()
        .committed(&id, StageId::DesignMath)
        .unwrap()
        .unwrap();
    assert_eq!(commit.attempt, 2);
}

#[tokio::test]
async fn test_exhausted_retry_budget_fails_run_with_diagnostic() {
    let harness = Harness::new(
        r#"
[stages.research]
command = "sh WORKER fail"
retries = 1
"#,
    );
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;

    assert_eq!(record.state, RunState::Failed);
    assert_eq!(record.executions_of(StageId::Research).count(), 2);
    let Some(RunOutcome::Failed { stage, error, diagnostic }) = &record.outcome else {
        panic!("expected failure, got {:?}", record.outcome);
    };
    assert_eq!(*stage, Some(StageId::Research));
    assert!(error.contains('3'));
    assert!(diagnostic.iter().any(|line| line.contains("boom")));

    let events = events(&orchestrator, &id);
    assert!(matches!(events.last(), Some(RunEvent::RunFailed { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::StageFailed { stage: StageId::Research, attempt: 2, will_retry: false, .. }
    )));
    // Nothing downstream ran.
    assert_eq!(launches(&events, StageId::DesignMath), 0);
}

#[tokio::test]
async fn test_missing_output_fails_attempt() {
    let harness = Harness::new(
        r#"
[stages.assembly]
command = "sh WORKER no-output"
retries = 0
"#,
    );
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;

    assert_eq!(record.state, RunState::Failed);
    let exec = record.last_execution(StageId::Assembly).unwrap();
    assert_eq!(exec.exit_code, Some(0));
    assert!(matches!(exec.status, ExecutionStatus::Failed { .. }));
    assert!(orchestrator
        .artifacts()
        .committed(&id, StageId::Assembly)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_stage_timeout_terminates_worker() {
    let harness = Harness::new(
        r#"
[stages.preflight]
command = "sh WORKER sleep"
timeout_secs = 1
retries = 0
"#,
    );
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;

    assert_eq!(record.state, RunState::Failed);
    let exec = record.last_execution(StageId::PreFlight).unwrap();
    let ExecutionStatus::Failed { error } = &exec.status else {
        panic!("expected failed execution, got {:?}", exec.status);
    };
    assert!(error.contains("timed out"), "{}", error);
    assert!(!launcher::process_alive(exec.pid.unwrap()));
}

#[tokio::test]
async fn test_start_rejects_stage_without_command() {
    let harness = Harness::new(
        r#"
[stages.art_audio]
command = "  "
"#,
    );
    let orchestrator = harness.open();

    let err = orchestrator.start(request(&["Texas"], false)).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Launch(LaunchError::EmptyCommand { stage: StageId::ArtAudio })
    ));
    assert!(orchestrator.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_start_requires_jurisdiction() {
    let harness = Harness::new("");
    let orchestrator = harness.open();

    let err = orchestrator.start(request(&["  "], false)).unwrap_err();
    assert!(matches!(err, OrchestratorError::NoJurisdictions));
}

// =============================================================================
// Review gates
// =============================================================================

#[tokio::test]
async fn test_rejection_reruns_stage_with_feedback() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], true)).unwrap();
    wait_for_review(&orchestrator, &id, StageId::Research, 1).await;

    // Only the pending gate accepts decisions.
    let err = orchestrator
        .decide(&id, StageId::DesignMath, Decision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotAwaitingReview { gate: StageId::DesignMath, .. }));

    orchestrator
        .decide(&id, StageId::Research, Decision::reject("more pyramids"))
        .await
        .unwrap();
    wait_for_review(&orchestrator, &id, StageId::Research, 2).await;

    let input = harness.input_of(&orchestrator, &id, StageId::Research, 2);
    assert_eq!(input.feedback, vec!["more pyramids".to_string()]);

    orchestrator
        .decide(&id, StageId::Research, Decision::Approve)
        .await
        .unwrap();
    wait_for_review(&orchestrator, &id, StageId::DesignMath, 1).await;
    orchestrator
        .decide(&id, StageId::DesignMath, Decision::Approve)
        .await
        .unwrap();

    let record = finish(&orchestrator, &id).await;
    assert_eq!(record.state, RunState::Completed);

    let research: Vec<_> = record.executions_of(StageId::Research).collect();
    assert_eq!(research.len(), 2);
    assert_eq!(research[0].status, ExecutionStatus::Superseded);
    assert_eq!(research[1].status, ExecutionStatus::Succeeded);

    // Design/math consumed the approved research attempt.
    let design = harness.input_of(&orchestrator, &id, StageId::DesignMath, 1);
    let research_input = design
        .inputs
        .iter()
        .find(|i| i.stage == StageId::Research)
        .unwrap();
    assert!(research_input.path.to_string_lossy().contains("attempt-2"));

    let events = events(&orchestrator, &id);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::ReviewDecided { gate: StageId::Research, automatic: false, decision } if !decision.is_approve()
    )));
}

#[tokio::test]
async fn test_decisions_on_finished_run_are_refused() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    finish(&orchestrator, &id).await;

    let err = orchestrator
        .decide(&id, StageId::Research, Decision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RunFinished { .. }));

    let missing = orchestrator.status(&RunId::new()).unwrap_err();
    assert!(matches!(missing, OrchestratorError::RunNotFound { .. }));
}

// =============================================================================
// Abort
// =============================================================================

#[tokio::test]
async fn test_abort_terminates_worker_group() {
    let harness = Harness::new(
        r#"
[stages.preflight]
command = "sh WORKER sleep"
"#,
    );
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let running = wait_until(&orchestrator, &id, |r| {
        r.last_execution(StageId::PreFlight)
            .is_some_and(|e| e.status == ExecutionStatus::Running)
    })
    .await;
    let pid = running.last_execution(StageId::PreFlight).unwrap().pid.unwrap();

    orchestrator.abort(&id).await.unwrap();
    let record = finish(&orchestrator, &id).await;

    assert_eq!(record.state, RunState::Aborted);
    assert_eq!(
        record.outcome,
        Some(RunOutcome::Aborted {
            stage: Some(StageId::PreFlight)
        })
    );
    assert_eq!(
        record.last_execution(StageId::PreFlight).unwrap().status,
        ExecutionStatus::Aborted
    );
    assert!(!launcher::process_alive(pid));
    assert!(matches!(
        events(&orchestrator, &id).last(),
        Some(RunEvent::RunAborted { .. })
    ));
}

#[tokio::test]
async fn test_abort_while_awaiting_review() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], true)).unwrap();
    wait_for_review(&orchestrator, &id, StageId::Research, 1).await;

    orchestrator.abort(&id).await.unwrap();
    let record = finish(&orchestrator, &id).await;
    assert_eq!(record.state, RunState::Aborted);
    assert_eq!(
        record.outcome,
        Some(RunOutcome::Aborted {
            stage: Some(StageId::Research)
        })
    );
}

// =============================================================================
// Restart and resume
// =============================================================================

#[tokio::test]
async fn test_resume_reattaches_running_worker() {
    let harness = Harness::new(
        r#"
[stages.preflight]
command = "sh WORKER slow"
"#,
    );
    harness.seed_cache("Texas");

    let first = harness.open();
    let id = first.start(request(&["Texas"], false)).unwrap();
    wait_until(&first, &id, |r| {
        r.last_execution(StageId::PreFlight)
            .is_some_and(|e| e.status == ExecutionStatus::Running)
    })
    .await;
    first.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = harness.open();
    let resumed = second.resume_all().unwrap();
    assert_eq!(resumed, vec![id.clone()]);

    let record = finish(&second, &id).await;
    assert_eq!(record.state, RunState::Completed);

    let events = events(&second, &id);
    assert_eq!(launches(&events, StageId::PreFlight), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::WorkerReattached { stage: StageId::PreFlight, attempt: 1, .. }
    )));
    assert_eq!(record.executions_of(StageId::PreFlight).count(), 1);

    // The worker's lines were relayed once each across both orchestrators.
    let done_lines = events
        .iter()
        .filter(|e| matches!(e, RunEvent::WorkerOutput { stage: StageId::PreFlight, line, .. } if line == "done"))
        .count();
    assert_eq!(done_lines, 1);
}

#[tokio::test]
async fn test_worker_killed_while_detached_is_retried_once() {
    let harness = Harness::new(
        r#"
[stages.preflight]
command = "sh WORKER sleep-once"
"#,
    );
    harness.seed_cache("Texas");
    let id = kill_preflight_while_detached(&harness).await;

    let second = harness.open();
    assert_eq!(second.resume_all().unwrap(), vec![id.clone()]);
    let record = finish(&second, &id).await;
    assert_eq!(record.state, RunState::Completed);

    let preflight: Vec<_> = record.executions_of(StageId::PreFlight).collect();
    assert_eq!(preflight.len(), 2);
    assert!(
        matches!(&preflight[0].status, ExecutionStatus::Failed { error } if error.contains("disappeared")),
        "unexpected first attempt: {:?}",
        preflight[0].status
    );
    assert_eq!(preflight[1].status, ExecutionStatus::Succeeded);

    let events = events(&second, &id);
    assert_eq!(launches(&events, StageId::PreFlight), 2);
    for stage in &StageId::GAME[1..] {
        assert_eq!(launches(&events, *stage), 1, "{} relaunched", stage);
    }
    assert_each_stage_committed_once(&events);
}

#[tokio::test]
async fn test_attempt_without_recorded_pid_is_retried() {
    let harness = Harness::new(
        r#"
[stages.preflight]
command = "sh WORKER sleep-once"
"#,
    );
    harness.seed_cache("Texas");
    let id = kill_preflight_while_detached(&harness).await;

    // Rewind the attempt to before the launcher recorded a pid.
    let registry = RunRegistry::new(harness.config().runs_dir());
    let mut record = registry.get(&id).unwrap();
    let exec = record.execution_mut(StageId::PreFlight, 1).unwrap();
    exec.pid = None;
    exec.status = ExecutionStatus::Launching;
    let _ = fs::remove_file(exec.exec_dir.join(launcher::PID_FILE));
    registry.save(&record).unwrap();

    let second = harness.open();
    assert_eq!(second.resume_all().unwrap(), vec![id.clone()]);
    let record = finish(&second, &id).await;
    assert_eq!(record.state, RunState::Completed);

    let preflight: Vec<_> = record.executions_of(StageId::PreFlight).collect();
    assert_eq!(preflight.len(), 2);
    assert!(
        matches!(&preflight[0].status, ExecutionStatus::Failed { error } if error.contains("never recorded")),
        "unexpected first attempt: {:?}",
        preflight[0].status
    );
    assert_each_stage_committed_once(&events(&second, &id));
}

#[tokio::test]
async fn test_resume_skips_finished_runs() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");

    let first = harness.open();
    let id = first.start(request(&["Texas"], false)).unwrap();
    finish(&first, &id).await;
    first.shutdown();

    let second = harness.open();
    assert!(second.resume_all().unwrap().is_empty());
    assert_eq!(second.status(&id).unwrap().state, RunState::Completed);
}

#[tokio::test]
async fn test_second_orchestrator_is_locked_out() {
    let harness = Harness::new("");
    let _first = harness.open();

    let err = Orchestrator::open(harness.config()).err().unwrap();
    assert!(matches!(err, OrchestratorError::LockHeld { .. }));
}

// =============================================================================
// Knowledge cache and recon
// =============================================================================

#[tokio::test]
async fn test_stale_cache_entry_triggers_recon() {
    let harness = Harness::new("");
    let old = Utc::now() - chrono::Duration::days(30);
    harness
        .cache()
        .put_at("Texas", json!({"old": true}), None, old)
        .unwrap();
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;
    assert_eq!(record.state, RunState::Completed);

    let events = events(&orchestrator, &id);
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::ReconStarted { joined: false, .. })));
    assert!(!events.iter().any(|e| matches!(e, RunEvent::CacheHit { .. })));

    let latest = harness.cache().get("Texas").unwrap().unwrap();
    assert!(latest.entry.fetched_at > old);
    assert_eq!(latest.entry.payload["max_bet"], 100);
    // The old entry is kept.
    assert_eq!(harness.cache().history("Texas").unwrap().len(), 2);

    let ReconStatus::Cached { entry } = &record.recon[0].status else {
        panic!("expected cached, got {:?}", record.recon[0].status);
    };
    assert_eq!(entry.fetched_at, latest.entry.fetched_at);
}

#[tokio::test]
async fn test_fresh_cache_entry_skips_recon() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas", " texas "], false)).unwrap();
    finish(&orchestrator, &id).await;

    let events = events(&orchestrator, &id);
    let hits = events
        .iter()
        .filter(|e| matches!(e, RunEvent::CacheHit { .. }))
        .count();
    assert_eq!(hits, 1);
    assert!(recon_runs(&orchestrator).is_empty());
}

#[tokio::test]
async fn test_mixed_cache_feeds_research_both_entries() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas", "Georgia"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;
    assert_eq!(record.state, RunState::Completed);

    // Only Georgia needed recon, and it succeeded.
    let recon = recon_runs(&orchestrator);
    assert_eq!(recon.len(), 1);
    assert_eq!(recon[0].state, RunState::Completed);
    assert!(record
        .recon
        .iter()
        .all(|l| matches!(l.status, ReconStatus::Cached { .. })));

    let events = events(&orchestrator, &id);
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::ReconFinished { jurisdiction, cached: true, .. } if jurisdiction == "Georgia")));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RunEvent::JurisdictionUncached { .. })));

    let input = harness.input_of(&orchestrator, &id, StageId::Research, 1);
    assert!(input.uncached.is_empty());
    let mut cached: Vec<_> = input.cached.iter().map(|c| c.jurisdiction.clone()).collect();
    cached.sort();
    assert_eq!(cached, vec!["Georgia".to_string(), "Texas".to_string()]);
    assert_eq!(harness.cache().get("Georgia").unwrap().unwrap().entry.payload["max_bet"], 100);
}

#[tokio::test]
async fn test_non_latin_jurisdiction_is_accepted() {
    let harness = Harness::new("");
    harness.seed_cache("北海道");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["北海道"], false)).unwrap();
    let record = finish(&orchestrator, &id).await;
    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.recon[0].key, "北海道");
    assert!(matches!(record.recon[0].status, ReconStatus::Cached { .. }));
    assert!(recon_runs(&orchestrator).is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_share_one_recon_run() {
    let harness = Harness::new(
        r#"
[stages.recon]
command = "sh WORKER slow"
"#,
    );
    let orchestrator = harness.open();

    let first = orchestrator.start(request(&["Georgia"], false)).unwrap();
    wait_until(&orchestrator, &first, |r| !r.recon.is_empty()).await;
    let second = orchestrator.start(request(&["georgia "], false)).unwrap();

    let a = finish(&orchestrator, &first).await;
    let b = finish(&orchestrator, &second).await;
    assert_eq!(a.state, RunState::Completed);
    assert_eq!(b.state, RunState::Completed);

    let recon = recon_runs(&orchestrator);
    assert_eq!(recon.len(), 1);

    let joined = events(&orchestrator, &second).into_iter().find_map(|e| match e {
        RunEvent::ReconStarted { recon_run, joined, .. } => Some((recon_run, joined)),
        _ => None,
    });
    assert_eq!(joined, Some((recon[0].id.clone(), true)));
    assert_eq!(harness.cache().history("Georgia").unwrap().len(), 1);
}

#[tokio::test]
async fn test_standalone_recon_fills_cache() {
    let harness = Harness::new("");
    let orchestrator = harness.open();

    let (id, joined) = orchestrator.recon("Nevada").unwrap();
    assert!(!joined);
    let record = finish(&orchestrator, &id).await;

    assert_eq!(record.state, RunState::Completed);
    assert_eq!(
        record.pipeline,
        PipelineKind::Recon {
            jurisdiction: "Nevada".into()
        }
    );
    let stored = harness.cache().get("nevada").unwrap().unwrap();
    assert_eq!(stored.entry.source_run, Some(id));
    // Recon runs are never gated.
    assert!(record.reviews.is_empty());
}

// =============================================================================
// Event stream
// =============================================================================

#[tokio::test]
async fn test_late_subscriber_replays_full_history() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    let live = orchestrator.subscribe(&id).unwrap();
    finish(&orchestrator, &id).await;

    let late: Vec<EventRecord> = orchestrator
        .subscribe(&id)
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    let live: Vec<EventRecord> = live.map(|r| r.unwrap()).collect().await;

    assert_eq!(late, live);
    assert_eq!(late, orchestrator.history(&id).unwrap());
    for (index, record) in late.iter().enumerate() {
        assert_eq!(record.seq, index as u64);
    }
    assert!(late.last().unwrap().event.is_terminal());
}

// =============================================================================
// Purge
// =============================================================================

#[tokio::test]
async fn test_purge_removes_finished_runs_but_keeps_artifacts() {
    let harness = Harness::new("");
    harness.seed_cache("Texas");
    let orchestrator = harness.open();

    let id = orchestrator.start(request(&["Texas"], false)).unwrap();
    finish(&orchestrator, &id).await;
    let manifest = orchestrator.artifacts().manifest_path(&id);
    assert!(manifest.exists());

    // Within the default retention window nothing goes.
    assert!(orchestrator.purge(None).unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let purged = orchestrator.purge(Some(chrono::Duration::zero())).unwrap();
    assert_eq!(purged, vec![id.clone()]);
    assert!(matches!(
        orchestrator.status(&id),
        Err(OrchestratorError::RunNotFound { .. })
    ));
    assert!(manifest.exists());
    assert!(harness.cache().get("Texas").unwrap().is_some());
}
