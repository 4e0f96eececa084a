//! Spawning a command in its own process group and forwarding its output.

use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::PreparedCommand;
use crate::error::SpawnError;
use crate::sink::{LineSink, PidTracker};
use crate::terminate::group_alive;

/// How long output still arriving after the leader exits is collected before
/// the sequence is closed.
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const MAX_BATCH: usize = 256;
/// Poll interval while a process group outlives its leader.
const GROUP_POLL: Duration = Duration::from_millis(200);

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    /// Terminating signal, when the child was killed.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, or the negated signal number for killed children.
    pub fn as_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => -signal,
            (None, None) => -1,
        }
    }

    /// Terminal line appended to the log once the child is gone.
    pub fn marker(&self) -> String {
        format!("[exit code: {}]", self.as_code())
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Exit status shared between the forwarding thread and every handle clone.
#[derive(Debug, Default)]
pub(crate) struct ExitWatch {
    outcome: Mutex<Option<ExitOutcome>>,
    cond: Condvar,
}

impl ExitWatch {
    fn set(&self, outcome: ExitOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.cond.notify_all();
    }

    pub(crate) fn get(&self) -> Option<ExitOutcome> {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait(&self) -> ExitOutcome {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<ExitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = *slot {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// A spawned command. Clones share the same exit status.
#[derive(Debug, Clone)]
pub struct RunningHandle {
    pid: u32,
    command: String,
    started_at: DateTime<Utc>,
    pub(crate) exit: Arc<ExitWatch>,
}

impl RunningHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The command as configured, before rewrites.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exit status once the child has exited and its output is flushed.
    pub fn exit_status(&self) -> Option<ExitOutcome> {
        self.exit.get()
    }

    pub fn is_running(&self) -> bool {
        self.exit.get().is_none()
    }

    pub fn wait(&self) -> ExitOutcome {
        self.exit.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitOutcome> {
        self.exit.wait_timeout(timeout)
    }
}

enum OutputEvent {
    Line(String),
    Exited(ExitOutcome),
}

/// Merged stdout/stderr lines of one child, in arrival order.
///
/// The sequence ends shortly after the child exits. It is owned by exactly
/// one forwarding thread, so it is consumed once.
pub struct OutputLines {
    rx: Receiver<OutputEvent>,
    exit: Option<ExitOutcome>,
    drain_deadline: Option<Instant>,
}

impl OutputLines {
    fn new(rx: Receiver<OutputEvent>) -> Self {
        Self {
            rx,
            exit: None,
            drain_deadline: None,
        }
    }

    /// Exit status observed while iterating, if the child has exited.
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit
    }

    /// Lines that are already buffered, without blocking.
    fn ready(&mut self, batch: &mut Vec<String>) {
        while batch.len() < MAX_BATCH {
            match self.rx.try_recv() {
                Ok(OutputEvent::Line(line)) => batch.push(line),
                Ok(OutputEvent::Exited(outcome)) => self.observe_exit(outcome),
                Err(_) => break,
            }
        }
    }

    fn observe_exit(&mut self, outcome: ExitOutcome) {
        self.exit = Some(outcome);
        self.drain_deadline = Some(Instant::now() + DRAIN_GRACE);
    }
}

impl Iterator for OutputLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let event = match self.drain_deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(remaining) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                            return None
                        }
                    }
                }
                None => self.rx.recv().ok()?,
            };
            match event {
                OutputEvent::Line(line) => return Some(line),
                OutputEvent::Exited(outcome) => self.observe_exit(outcome),
            }
        }
    }
}

/// Spawn `prepared` in `cwd` as the leader of a new process group.
///
/// Output is forwarded to `sink` by a background thread, which appends the
/// `[exit code: N]` marker once the child has exited. The pid is released
/// from `tracker` when the whole process group is gone, so descendants that
/// outlive the leader stay reachable through the tracked pid.
pub fn spawn(
    prepared: &PreparedCommand,
    cwd: &Path,
    sink: Arc<dyn LineSink>,
    tracker: Arc<dyn PidTracker>,
) -> Result<RunningHandle, SpawnError> {
    if !cwd.is_dir() {
        return Err(SpawnError::WorkingDirectoryMissing {
            path: cwd.to_path_buf(),
        });
    }

    let mut cmd = prepared.to_command();
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|source| SpawnError::classify(prepared.program(), &prepared.original, source))?;
    let pid = child.id();
    tracker.track(pid, &prepared.original);
    tracing::debug!(pid, command = %prepared.effective, cwd = %cwd.display(), "spawned process group");

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        pipe_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pipe_lines(stderr, tx.clone());
    }

    thread::spawn(move || {
        let outcome = match child.wait() {
            Ok(status) => ExitOutcome::from_status(status),
            Err(err) => {
                tracing::warn!(pid, error = %err, "failed to reap child");
                ExitOutcome::unknown()
            }
        };
        let _ = tx.send(OutputEvent::Exited(outcome));
    });

    let exit = Arc::new(ExitWatch::default());
    let watch = Arc::clone(&exit);
    thread::spawn(move || {
        let mut lines = OutputLines::new(rx);
        forward(&mut lines, sink.as_ref());
        let outcome = lines.exit_outcome().unwrap_or_else(ExitOutcome::unknown);
        sink.append(&outcome.marker());
        if group_alive(pid) {
            tracing::debug!(pid, %outcome, "leader exited, process group still alive");
            release_when_group_exits(pid, tracker);
        } else {
            tracker.release(pid);
            tracing::debug!(pid, %outcome, "process exited");
        }
        watch.set(outcome);
    });

    Ok(RunningHandle {
        pid,
        command: prepared.original.clone(),
        started_at: Utc::now(),
        exit,
    })
}

/// Push every line of `lines` into `sink`, batching lines that are already
/// buffered.
fn forward(lines: &mut OutputLines, sink: &dyn LineSink) {
    while let Some(first) = lines.next() {
        let mut batch = vec![first];
        lines.ready(&mut batch);
        sink.append_batch(&batch);
    }
}

/// Keep `pid` tracked until its group is empty or someone else released it.
fn release_when_group_exits(pid: u32, tracker: Arc<dyn PidTracker>) {
    thread::spawn(move || {
        while group_alive(pid) && tracker.is_tracked(pid) {
            thread::sleep(GROUP_POLL);
        }
        tracker.release(pid);
        tracing::debug!(pid, "process group exited");
    });
}

fn pipe_lines<R: Read + Send + 'static>(stream: R, tx: Sender<OutputEvent>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(OutputEvent::Line(line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
