use std::path::Path;
use std::sync::Arc;

use crate::command::prepare_command;
use crate::error::SpawnError;
use crate::process::{spawn, ExitOutcome, RunningHandle};
use crate::sink::{LineSink, PidTracker};

/// Launches commands whose output lands in a shared sink and whose pids are
/// tracked until they exit.
#[derive(Clone)]
pub struct CommandRunner {
    shell: Option<String>,
    sink: Arc<dyn LineSink>,
    tracker: Arc<dyn PidTracker>,
}

impl CommandRunner {
    /// `shell` of `None` executes commands directly, split into words with
    /// shell quoting rules.
    pub fn new(
        shell: Option<String>,
        sink: Arc<dyn LineSink>,
        tracker: Arc<dyn PidTracker>,
    ) -> Self {
        Self {
            shell,
            sink,
            tracker,
        }
    }

    pub fn shell(&self) -> Option<&str> {
        self.shell.as_deref()
    }

    /// Start `command` in `cwd` without waiting for it.
    pub fn spawn(&self, command: &str, cwd: &Path) -> Result<RunningHandle, SpawnError> {
        let prepared = prepare_command(command, self.shell.as_deref())?;
        spawn(
            &prepared,
            cwd,
            Arc::clone(&self.sink),
            Arc::clone(&self.tracker),
        )
    }

    /// Run `command` to completion. Output is still streamed to the sink
    /// while it runs.
    pub fn run(&self, command: &str, cwd: &Path) -> Result<ExitOutcome, SpawnError> {
        let handle = self.spawn(command, cwd)?;
        Ok(handle.wait())
    }
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner")
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::{CollectSink, SetTracker};

    fn runner(shell: Option<&str>) -> (CommandRunner, Arc<CollectSink>, Arc<SetTracker>) {
        let sink = Arc::new(CollectSink::default());
        let tracker = Arc::new(SetTracker::default());
        let runner = CommandRunner::new(
            shell.map(str::to_string),
            Arc::clone(&sink) as Arc<dyn LineSink>,
            Arc::clone(&tracker) as Arc<dyn PidTracker>,
        );
        (runner, sink, tracker)
    }

    #[test]
    fn run_blocks_until_exit_and_reports_code() {
        let (runner, sink, tracker) = runner(Some("sh"));
        let outcome = runner.run("echo building; exit 2", Path::new("/tmp")).expect("run");

        assert_eq!(outcome.code, Some(2));
        assert_eq!(
            sink.lines(),
            vec!["building".to_string(), "[exit code: 2]".to_string()]
        );
        assert!(tracker.live.lock().expect("lock").is_empty());
    }

    #[test]
    fn commands_run_in_the_requested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker.txt"), "present\n").expect("write");
        let (runner, sink, _tracker) = runner(Some("sh"));

        let outcome = runner.run("cat marker.txt", dir.path()).expect("run");
        assert!(outcome.success());
        assert_eq!(sink.lines()[0], "present");
    }

    #[test]
    fn missing_program_under_shell_exits_127() {
        let (runner, sink, _tracker) = runner(Some("sh"));
        let outcome = runner
            .run("tend-no-such-program", Path::new("/tmp"))
            .expect("shell starts");

        assert_eq!(outcome.code, Some(127));
        assert_eq!(sink.lines().last().map(String::as_str), Some("[exit code: 127]"));
    }

    #[test]
    fn missing_shell_is_binary_not_found() {
        let (runner, _sink, _tracker) = runner(Some("/nonexistent/shell"));
        let err = runner.spawn("echo hi", Path::new("/tmp")).expect_err("no shell");
        assert!(matches!(err, SpawnError::BinaryNotFound { .. }));
    }

    #[test]
    fn spawned_pid_is_tracked_while_running() {
        let (runner, _sink, tracker) = runner(Some("sh"));
        let handle = runner.spawn("sleep 30", Path::new("/tmp")).expect("spawn");

        assert!(tracker.live.lock().expect("lock").contains(&handle.pid()));
        assert_eq!(handle.command(), "sleep 30");

        handle.terminate(std::time::Duration::from_secs(5));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while tracker.live.lock().expect("lock").contains(&handle.pid()) {
            assert!(std::time::Instant::now() < deadline, "pid never released");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        let (runner, _sink, _tracker) = runner(None);
        let err = runner.spawn("   ", Path::new("/tmp")).expect_err("empty");
        assert!(matches!(err, SpawnError::EmptyCommand));
    }
}
