//! Process-group termination: SIGTERM, a grace period, then SIGKILL.

use std::fs;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::process::RunningHandle;

/// How a termination request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationResult {
    /// The process had exited before any signal was sent.
    AlreadyExited,
    /// The group exited within the grace period after SIGTERM.
    Graceful,
    /// The grace period elapsed and the group was killed.
    Forced,
}

impl TerminationResult {
    pub fn was_forced(self) -> bool {
        matches!(self, TerminationResult::Forced)
    }
}

/// Send `signal` to the process group led by `pgid`.
///
/// `None` probes for existence. Returns `Ok(false)` when no such group exists.
pub fn signal_group(pgid: u32, signal: Option<Signal>) -> Result<bool, Errno> {
    let pid = Pid::from_raw(pgid as i32);
    match killpg(pid, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Whether group `pgid` still has a member that has not exited.
///
/// `kill(2)` succeeds for zombies, so on Linux the members found in `/proc`
/// are checked for the zombie state before the group counts as alive.
pub fn group_alive(pgid: u32) -> bool {
    if !signal_group(pgid, None).unwrap_or(false) {
        return false;
    }
    running_members(pgid).map_or(true, |members| members > 0)
}

/// Count non-zombie processes in group `pgid`, or `None` without `/proc`.
fn running_members(pgid: u32) -> Option<usize> {
    let pgid = pgid.to_string();
    let mut members = 0;
    for entry in fs::read_dir("/proc").ok()?.flatten() {
        let is_pid = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // The command name may contain spaces and parentheses.
        let Some((_, fields)) = stat.rsplit_once(')') else {
            continue;
        };
        let mut fields = fields.split_whitespace();
        let state = fields.next();
        let pgrp = fields.nth(1);
        if pgrp == Some(pgid.as_str()) && state != Some("Z") {
            members += 1;
        }
    }
    Some(members)
}

/// SIGKILL the group led by `pid`, falling back to the single process when
/// it was never a group leader.
pub fn kill_group(pid: u32) -> Result<bool, Errno> {
    if signal_group(pid, Some(Signal::SIGKILL))? {
        return Ok(true);
    }
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(err),
    }
}

impl RunningHandle {
    /// Stop the whole process group. Blocks until the leader is reaped.
    pub fn terminate(&self, grace: Duration) -> TerminationResult {
        if !self.is_running() {
            return TerminationResult::AlreadyExited;
        }
        let pid = self.pid();

        if let Err(err) = signal_group(pid, Some(Signal::SIGTERM)) {
            tracing::warn!(pid, error = %err, "failed to send SIGTERM");
        }
        if self.wait_timeout(grace).is_some() {
            // Descendants that ignored SIGTERM must not outlive the leader.
            let _ = signal_group(pid, Some(Signal::SIGKILL));
            return TerminationResult::Graceful;
        }

        tracing::warn!(
            pid,
            grace_ms = grace.as_millis() as u64,
            "process did not exit within grace period, sending SIGKILL"
        );
        if let Err(err) = kill_group(pid) {
            tracing::warn!(pid, error = %err, "failed to send SIGKILL");
        }
        self.wait();
        TerminationResult::Forced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::prepare_command;
    use crate::process::spawn;
    use crate::sink::testing::CollectSink;
    use crate::sink::{LineSink, NoTracking};
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn spawn_sh(script: &str) -> (RunningHandle, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink::default());
        let prepared = prepare_command(script, Some("sh")).expect("prepare");
        let handle = spawn(
            &prepared,
            Path::new("/tmp"),
            Arc::clone(&sink) as Arc<dyn LineSink>,
            Arc::new(NoTracking),
        )
        .expect("spawn");
        (handle, sink)
    }

    fn wait_for_line(sink: &CollectSink, line: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !sink.lines().iter().any(|l| l == line) {
            assert!(Instant::now() < deadline, "timed out waiting for {line:?}");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn sleeping_process_terminates_gracefully() {
        let (handle, sink) = spawn_sh("sleep 30");
        let result = handle.terminate(Duration::from_secs(5));

        assert_eq!(result, TerminationResult::Graceful);
        assert!(!handle.is_running());
        let outcome = handle.exit_status().expect("exit recorded");
        assert_eq!(outcome.code, None);
        assert_eq!(sink.lines().last().map(String::as_str), Some("[exit code: -15]"));
    }

    #[test]
    fn process_ignoring_sigterm_is_killed_after_grace() {
        let (handle, sink) = spawn_sh("trap '' TERM; echo ready; while true; do sleep 1; done");
        wait_for_line(&sink, "ready");

        let started = Instant::now();
        let result = handle.terminate(Duration::from_millis(300));

        assert_eq!(result, TerminationResult::Forced);
        assert!(result.was_forced());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(handle.exit_status().and_then(|o| o.signal), Some(9));
    }

    #[test]
    fn descendants_are_killed_with_the_leader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let beat = dir.path().join("beat");
        let script = format!(
            "sh -c 'while true; do echo x >> {0}; sleep 0.1; done' & echo ready; wait",
            beat.display()
        );
        let (handle, sink) = spawn_sh(&script);
        wait_for_line(&sink, "ready");

        handle.terminate(Duration::from_secs(5));

        thread::sleep(Duration::from_millis(300));
        let len = std::fs::metadata(&beat).map(|m| m.len()).unwrap_or(0);
        thread::sleep(Duration::from_millis(500));
        let later = std::fs::metadata(&beat).map(|m| m.len()).unwrap_or(0);
        assert_eq!(len, later, "background child kept running");
    }

    #[test]
    fn exited_process_reports_already_exited() {
        let (handle, _sink) = spawn_sh("true");
        handle.wait();
        assert_eq!(
            handle.terminate(Duration::from_secs(1)),
            TerminationResult::AlreadyExited
        );
    }

    #[test]
    fn killing_a_vanished_pid_is_not_an_error() {
        let (handle, _sink) = spawn_sh("true");
        handle.wait();
        assert_eq!(kill_group(handle.pid()), Ok(false));
    }

    #[test]
    fn zombie_members_do_not_keep_a_group_alive() {
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};

        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let pgid = child.id();
        assert!(group_alive(pgid));

        assert_eq!(kill_group(pgid), Ok(true));
        // Not reaped yet, so the member lingers as a zombie.
        let deadline = Instant::now() + Duration::from_secs(10);
        while group_alive(pgid) {
            assert!(Instant::now() < deadline, "group never went away");
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(signal_group(pgid, None), Ok(true));

        child.wait().expect("reap");
        assert!(!group_alive(pgid));
    }
}
