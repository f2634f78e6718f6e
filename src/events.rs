//! Per-run event log and subscriptions.
//!
//! Every run has one append-only log: an in-memory `Vec` mirrored to
//! `runs/<id>/events.jsonl`. A subscription replays the log from offset zero
//! and then follows live appends, so a late or reconnecting subscriber sees
//! exactly the sequence a subscriber present from the start saw. The stream
//! ends after the run's terminal event.
//!
//! A subscriber that lets more than `max_backlog` events appended after it
//! subscribed go unread is dropped: its stream yields [`SubscriberDropped`]
//! and ends. The run and other subscribers are unaffected.

use crate::artifacts::ArtifactRef;
use crate::gates::Decision;
use crate::orchestrator::state::RunState;
use crate::pipeline::PipelineKind;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use slotflow_common::{ArtifactKind, RunId, StageId};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

pub const EVENTS_FILE: &str = "events.jsonl";

/// Something that happened to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        pipeline: PipelineKind,
        theme: String,
        jurisdictions: Vec<String>,
        interactive: bool,
    },
    StateChanged {
        from: RunState,
        to: RunState,
    },
    CacheHit {
        jurisdiction: String,
        fetched_at: DateTime<Utc>,
    },
    /// A recon run was started, or an in-flight one joined, for a jurisdiction.
    ReconStarted {
        jurisdiction: String,
        recon_run: RunId,
        joined: bool,
    },
    ReconFinished {
        jurisdiction: String,
        recon_run: RunId,
        cached: bool,
    },
    /// Research for this jurisdiction proceeds with degraded context.
    JurisdictionUncached {
        jurisdiction: String,
        reason: String,
    },
    /// Emitted and persisted before the worker process is spawned.
    StageLaunching {
        stage: StageId,
        attempt: u32,
        exec_dir: PathBuf,
    },
    StageStarted {
        stage: StageId,
        attempt: u32,
        pid: u32,
    },
    WorkerReattached {
        stage: StageId,
        attempt: u32,
        pid: u32,
        log_offset: u64,
    },
    /// One line of worker output; `offset..end` is its byte range in the log.
    WorkerOutput {
        stage: StageId,
        attempt: u32,
        offset: u64,
        end: u64,
        line: String,
    },
    ArtifactCommitted {
        stage: StageId,
        attempt: u32,
        kind: ArtifactKind,
        path: PathBuf,
    },
    StageFailed {
        stage: StageId,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    ReviewPending {
        gate: StageId,
        attempt: u32,
        artifacts: Vec<PathBuf>,
    },
    ReviewDecided {
        gate: StageId,
        decision: Decision,
        automatic: bool,
    },
    RunCompleted {
        manifest: PathBuf,
    },
    RunFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<StageId>,
        error: String,
        #[serde(default)]
        diagnostic: Vec<String>,
    },
    RunAborted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<StageId>,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } | RunEvent::RunAborted { .. }
        )
    }

    pub fn artifact_committed(stage: StageId, artifact: &ArtifactRef) -> Self {
        RunEvent::ArtifactCommitted {
            stage,
            attempt: artifact.attempt,
            kind: artifact.kind,
            path: artifact.path.clone(),
        }
    }
}

/// An event with its position in the run's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub run_id: RunId,
    pub event: RunEvent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Subscriber fell {backlog} events behind and was dropped")]
pub struct SubscriberDropped {
    pub backlog: usize,
}

pub type EventStream = BoxStream<'static, Result<EventRecord, SubscriberDropped>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    len: usize,
    closed: bool,
}

struct RunLog {
    path: PathBuf,
    events: Mutex<Vec<EventRecord>>,
    cursor: watch::Sender<Cursor>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunLog {
    fn open(path: PathBuf) -> Result<Self> {
        let events = load_events(&path)?;
        let closed = events.last().is_some_and(|r| r.event.is_terminal());
        let (cursor, _) = watch::channel(Cursor {
            len: events.len(),
            closed,
        });
        Ok(Self {
            path,
            events: Mutex::new(events),
            cursor,
        })
    }

    fn append(&self, run_id: &RunId, event: RunEvent) -> Result<EventRecord> {
        let mut events = lock(&self.events);
        let terminal = event.is_terminal();
        let record = EventRecord {
            seq: events.len() as u64,
            at: Utc::now(),
            run_id: run_id.clone(),
            event,
        };

        let mut line = serde_json::to_string(&record).context("Failed to serialize event")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;

        events.push(record.clone());
        let len = events.len();
        self.cursor.send_modify(|cursor| {
            cursor.len = len;
            cursor.closed |= terminal;
        });
        Ok(record)
    }

    fn get(&self, index: usize) -> Option<EventRecord> {
        lock(&self.events).get(index).cloned()
    }
}

/// Read a persisted log. A torn final line from a crash mid-append is
/// truncated away so the next append starts on a line boundary.
fn load_events(path: &Path) -> Result<Vec<EventRecord>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read event log {}", path.display()));
        }
    };

    let complete = match content.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    if complete < content.len() {
        tracing::warn!(path = %path.display(), "truncating torn event log tail");
        fs::OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(complete as u64))
            .with_context(|| format!("Failed to truncate {}", path.display()))?;
    }

    let mut events = Vec::new();
    for (i, line) in content[..complete].split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let record: EventRecord = serde_json::from_slice(line)
            .with_context(|| format!("Corrupt event at line {} of {}", i + 1, path.display()))?;
        events.push(record);
    }
    Ok(events)
}

/// All run event logs of one state directory.
pub struct EventHub {
    runs_dir: PathBuf,
    max_backlog: usize,
    logs: Mutex<HashMap<RunId, Arc<RunLog>>>,
}

impl EventHub {
    pub fn new(runs_dir: PathBuf, max_backlog: usize) -> Self {
        Self {
            runs_dir,
            max_backlog,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join(EVENTS_FILE)
    }

    fn log(&self, run_id: &RunId) -> Result<Arc<RunLog>> {
        let mut logs = lock(&self.logs);
        if let Some(log) = logs.get(run_id) {
            return Ok(Arc::clone(log));
        }
        let log = Arc::new(RunLog::open(self.log_path(run_id))?);
        logs.insert(run_id.clone(), Arc::clone(&log));
        Ok(log)
    }

    /// Durably append an event and wake subscribers.
    pub fn append(&self, run_id: &RunId, event: RunEvent) -> Result<EventRecord> {
        self.log(run_id)?.append(run_id, event)
    }

    /// Everything logged so far.
    pub fn history(&self, run_id: &RunId) -> Result<Vec<EventRecord>> {
        let log = self.log(run_id)?;
        let events = lock(&log.events).clone();
        Ok(events)
    }

    /// Replay from offset zero, then follow live events until the run ends.
    pub fn subscribe(&self, run_id: &RunId) -> Result<EventStream> {
        let log = self.log(run_id)?;
        let rx = log.cursor.subscribe();
        let live_from = rx.borrow().len;

        let subscription = Subscription {
            run_id: run_id.clone(),
            log,
            rx,
            next: 0,
            live_from,
            max_backlog: self.max_backlog,
            dropped: false,
        };

        Ok(stream::unfold(subscription, |mut sub| async move {
            if sub.dropped {
                return None;
            }
            loop {
                let cursor = *sub.rx.borrow_and_update();
                if sub.next < cursor.len {
                    let backlog = cursor.len.saturating_sub(sub.next.max(sub.live_from));
                    if backlog > sub.max_backlog {
                        tracing::warn!(
                            run_id = %sub.run_id,
                            backlog,
                            "dropping slow event subscriber"
                        );
                        sub.dropped = true;
                        return Some((Err(SubscriberDropped { backlog }), sub));
                    }
                    let record = sub.log.get(sub.next)?;
                    sub.next += 1;
                    return Some((Ok(record), sub));
                }
                if cursor.closed {
                    return None;
                }
                if sub.rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed())
    }

    /// Drop the in-memory copy of a run's log. Open streams keep their own
    /// handle; the next reader loads the log from disk.
    pub fn forget(&self, run_id: &RunId) {
        lock(&self.logs).remove(run_id);
    }
}

struct Subscription {
    run_id: RunId,
    log: Arc<RunLog>,
    rx: watch::Receiver<Cursor>,
    next: usize,
    live_from: usize,
    max_backlog: usize,
    dropped: bool,
}
