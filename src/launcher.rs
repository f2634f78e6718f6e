//! Stage Worker Launcher.
//!
//! Each stage execution runs in its own process group, started through a
//! small `sh` wrapper that records the group leader's pid in `<exec_dir>/pid`
//! and, when the worker returns, its exit code in `<exec_dir>/exit`. Both
//! files are written via rename. stdout and stderr go to
//! `<exec_dir>/worker.log`.
//!
//! The orchestrator never kills workers when it exits. A restarted
//! orchestrator calls [`WorkerHandle::adopt`] with the recorded pid and keeps
//! observing the worker through liveness probes and the exit file.

use crate::errors::{LaunchError, WorkerFailure};
use crate::util::write_json_atomic;
use chrono::{DateTime, Utc};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use slotflow_common::{RunId, StageId, WorkerInput, env};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const LOG_FILE: &str = "worker.log";
pub const PID_FILE: &str = "pid";
pub const EXIT_FILE: &str = "exit";

/// `$1` is the worker command line.
const WRAPPER: &str = r#"d="$SLOTFLOW_EXEC_DIR"
echo $$ > "$d/pid.tmp" && mv "$d/pid.tmp" "$d/pid"
sh -c "$1"
code=$?
echo $code > "$d/exit.tmp" && mv "$d/exit.tmp" "$d/exit"
exit $code"#;

/// Everything needed to start one stage execution.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub run_id: &'a RunId,
    pub stage: StageId,
    pub attempt: u32,
    /// Shell command line of the worker
    pub command: &'a str,
    pub exec_dir: &'a Path,
    pub input: &'a WorkerInput,
}

/// Start a worker in a new process group.
pub fn launch(request: &LaunchRequest<'_>) -> Result<WorkerHandle, LaunchError> {
    let stage = request.stage;
    if request.command.trim().is_empty() {
        return Err(LaunchError::EmptyCommand { stage });
    }

    let exec_dir = request.exec_dir;
    let exec_err = |source: io::Error| LaunchError::ExecDir {
        path: exec_dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(exec_dir).map_err(exec_err)?;
    for stale in [PID_FILE, EXIT_FILE, OUTPUT_FILE] {
        match fs::remove_file(exec_dir.join(stale)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(exec_err(e)),
            _ => {}
        }
    }
    let input_path = exec_dir.join(INPUT_FILE);
    write_json_atomic(&input_path, request.input).map_err(exec_err)?;

    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(exec_dir.join(LOG_FILE))
        .map_err(exec_err)?;
    let log_err = log.try_clone().map_err(exec_err)?;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(WRAPPER)
        .arg("slotflow-worker")
        .arg(request.command)
        .env(env::RUN_ID, request.run_id.to_string())
        .env(env::STAGE, stage.as_str())
        .env(env::ATTEMPT, request.attempt.to_string())
        .env(env::INPUT, &input_path)
        .env(env::OUTPUT, exec_dir.join(OUTPUT_FILE))
        .env(env::EXEC_DIR, exec_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    let child = command
        .group_spawn()
        .map_err(|source| LaunchError::SpawnFailed { stage, source })?;
    let pid = child.id().ok_or(LaunchError::NoPid { stage })?;

    tracing::info!(
        run_id = %request.run_id,
        stage = %stage,
        attempt = request.attempt,
        pid,
        "worker launched"
    );

    Ok(WorkerHandle {
        pid,
        exec_dir: exec_dir.to_path_buf(),
        started_at: Utc::now(),
        child: Some(child),
    })
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exited(i32),
    Signaled,
    TimedOut,
    /// Dead without an exit file
    Lost,
}

impl WorkerExit {
    pub fn into_result(self, pid: u32, timeout: Duration) -> Result<(), WorkerFailure> {
        match self {
            WorkerExit::Exited(0) => Ok(()),
            WorkerExit::Exited(code) => Err(WorkerFailure::NonZeroExit { code }),
            WorkerExit::Signaled => Err(WorkerFailure::Signaled),
            WorkerExit::TimedOut => Err(WorkerFailure::TimedOut {
                secs: timeout.as_secs(),
            }),
            WorkerExit::Lost => Err(WorkerFailure::Lost { pid }),
        }
    }
}

/// Handle to a running or finished worker process group.
///
/// A handle from [`launch`] owns the child and reaps it. An adopted handle
/// only knows the pid and relies on the exit file.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: u32,
    exec_dir: PathBuf,
    started_at: DateTime<Utc>,
    child: Option<AsyncGroupChild>,
}

impl WorkerHandle {
    /// Re-attach to a worker started by an earlier orchestrator process.
    pub fn adopt(pid: u32, exec_dir: PathBuf, started_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            exec_dir,
            started_at,
            child: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn log_path(&self) -> PathBuf {
        self.exec_dir.join(LOG_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.exec_dir.join(OUTPUT_FILE)
    }

    /// Tail of the worker log starting at byte `offset`.
    pub fn log_tail(&self, offset: u64) -> LogTail {
        LogTail::new(self.log_path(), offset)
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => process_alive(self.pid),
        }
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> Option<WorkerExit> {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return None,
                Ok(Some(status)) => {
                    return Some(match read_exit_code(&self.exec_dir) {
                        Some(code) => WorkerExit::Exited(code),
                        None => match status.code() {
                            Some(code) => WorkerExit::Exited(code),
                            None => WorkerExit::Signaled,
                        },
                    });
                }
                Err(e) => {
                    tracing::debug!(pid = self.pid, error = %e, "try_wait failed, probing pid instead");
                    self.child = None;
                }
            }
        }

        if let Some(code) = read_exit_code(&self.exec_dir) {
            return Some(WorkerExit::Exited(code));
        }
        if process_alive(self.pid) {
            return None;
        }
        // The wrapper may have written the file between the two checks.
        Some(match read_exit_code(&self.exec_dir) {
            Some(code) => WorkerExit::Exited(code),
            None => WorkerExit::Lost,
        })
    }

    /// Wait up to `timeout` for the worker to exit. Returns
    /// [`WorkerExit::TimedOut`] without touching the worker if it is still running.
    pub async fn wait(&mut self, timeout: Duration, poll: Duration) -> WorkerExit {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.try_exit() {
                return exit;
            }
            if Instant::now() >= deadline {
                return WorkerExit::TimedOut;
            }
            tokio::time::sleep(poll.min(deadline - Instant::now())).await;
        }
    }

    /// SIGTERM the whole process group, then SIGKILL after `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        let group = Pid::from_raw(self.pid as i32);
        signal_group(group, Signal::SIGTERM, self.pid);

        let deadline = Instant::now() + grace;
        while self.is_alive() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Children of the worker may outlive the wrapper.
        signal_group(group, Signal::SIGKILL, self.pid);

        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.wait().await
        {
            tracing::warn!(pid = self.pid, error = %e, "failed to reap terminated worker");
        }
    }
}

fn signal_group(group: Pid, signal: Signal, pid: u32) {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::error!(pid, ?signal, error = %e, "failed to signal worker process group"),
    }
}

/// Liveness probe for a process this orchestrator did not spawn.
pub fn process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// Pid the wrapper recorded, if it got that far.
pub fn read_pid_file(exec_dir: &Path) -> Option<u32> {
    fs::read_to_string(exec_dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Exit code the wrapper recorded, if the worker returned.
pub fn read_exit_code(exec_dir: &Path) -> Option<i32> {
    fs::read_to_string(exec_dir.join(EXIT_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// One complete line of worker output and its byte range in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub offset: u64,
    pub end: u64,
    pub line: String,
}

/// Incremental reader over a worker log.
///
/// Only complete lines are returned until [`LogTail::finish`], so every byte
/// is reported exactly once and a new tail started at [`LogTail::offset`]
/// continues where this one stopped.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LogTail {
    pub fn new(path: PathBuf, offset: u64) -> Self {
        Self {
            path,
            offset,
            partial: Vec::new(),
        }
    }

    /// Byte offset just past the last line returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read whatever complete lines were appended since the last call.
    pub fn poll(&mut self) -> io::Result<Vec<LogLine>> {
        let mut file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(self.offset + self.partial.len() as u64))?;
        file.read_to_end(&mut self.partial)?;

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let rest = self.partial.split_off(pos + 1);
            let raw = std::mem::replace(&mut self.partial, rest);
            lines.push(self.take_line(&raw[..pos], raw.len()));
        }
        Ok(lines)
    }

    /// Like [`LogTail::poll`], but also returns a trailing line with no newline.
    pub fn finish(&mut self) -> io::Result<Vec<LogLine>> {
        let mut lines = self.poll()?;
        if !self.partial.is_empty() {
            let raw = std::mem::take(&mut self.partial);
            lines.push(self.take_line(&raw, raw.len()));
        }
        Ok(lines)
    }

    fn take_line(&mut self, content: &[u8], consumed: usize) -> LogLine {
        let start = self.offset;
        self.offset += consumed as u64;
        let text = String::from_utf8_lossy(content);
        LogLine {
            offset: start,
            end: self.offset,
            line: text.trim_end_matches('\r').to_string(),
        }
    }
}

/// Last `n` lines of a log, for failure diagnostics.
pub fn last_lines(path: &Path, n: usize) -> Vec<String> {
    const WINDOW: u64 = 8 * 1024;

    let Ok(mut file) = fs::File::open(path) else {
        return Vec::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file.seek(SeekFrom::Start(len.saturating_sub(WINDOW))).is_err() {
        return Vec::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}
