//! The process supervisor.
//!
//! Owns the single managed process and serializes every lifecycle operation
//! behind one lock. State reads (`get_state`, `get_logs`) never take that
//! lock, so they stay responsive while a build or a graceful stop is running.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tend_core::config::{CommandConfig, CommandStore, CommandStoreError, FileCommandStore, TendConfig};
use tend_core::state::{transition, ProcessState};
use tend_core::sync::SourceSync;
use tend_core::types::{ProcessId, StateView};
use tend_git::{GitSourceSync, RemoteSpec};
use tend_runner::{
    CommandRunner, ExitOutcome, LineSink, PidTracker, RunningHandle, SpawnError,
    TerminationResult,
};

use crate::log_sink::{LogSink, LogSinkError};
use crate::pid_registry::{KillReport, PidRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("process already running (pid {pid})")]
    AlreadyRunning { pid: ProcessId },
    #[error("no process running")]
    NotRunning,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("source sync failed: {message}")]
    SyncFailure { message: String },
    #[error("build step failed ({command}): exit code {exit_code}")]
    BuildFailure { command: String, exit_code: i32 },
    #[error("script not found: {name}")]
    ScriptNotFound { name: String },
    #[error(transparent)]
    Config(#[from] CommandStoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Log(#[from] LogSinkError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Checkout of the managed program; every command runs here.
    pub runtime_dir: PathBuf,
    pub grace_period: Duration,
    /// `None` executes commands directly instead of through a shell.
    pub shell: Option<String>,
}

impl SupervisorSettings {
    pub fn from_config(config: &TendConfig) -> Self {
        Self {
            runtime_dir: config.paths.runtime_dir.clone(),
            grace_period: config.supervisor.grace_period(),
            shell: config.supervisor.shell().map(str::to_string),
        }
    }
}

/// The program currently owned by the supervisor.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub id: ProcessId,
    pub command: String,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    handle: RunningHandle,
}

impl ManagedProcess {
    pub fn handle(&self) -> &RunningHandle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: ProcessState,
    current: Option<ManagedProcess>,
    last_exit_code: Option<i32>,
}

impl Slot {
    /// Fold a natural exit of the managed process into the state.
    fn refresh(&mut self) {
        if self.state != ProcessState::Running {
            return;
        }
        let Some(outcome) = self.current.as_ref().and_then(|p| p.handle.exit_status()) else {
            return;
        };
        self.last_exit_code = Some(outcome.as_code());
        self.set_state(ProcessState::Stopped);
    }

    fn set_state(&mut self, to: ProcessState) {
        match transition(self.state, to) {
            Ok(next) => self.state = next,
            Err(err) => {
                tracing::warn!(error = %err, "forcing process state");
                self.state = to;
            }
        }
    }

    fn running_pid(&self) -> Option<ProcessId> {
        match (self.state, &self.current) {
            (ProcessState::Running, Some(process)) => Some(process.id),
            _ => None,
        }
    }
}

pub struct Supervisor {
    settings: SupervisorSettings,
    commands: Arc<dyn CommandStore>,
    source: Arc<dyn SourceSync>,
    logs: Arc<LogSink>,
    registry: Arc<PidRegistry>,
    runner: CommandRunner,
    lifecycle: Mutex<()>,
    slot: Mutex<Slot>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        commands: Arc<dyn CommandStore>,
        source: Arc<dyn SourceSync>,
        logs: Arc<LogSink>,
        registry: Arc<PidRegistry>,
    ) -> Self {
        let runner = CommandRunner::new(
            settings.shell.clone(),
            Arc::clone(&logs) as Arc<dyn LineSink>,
            Arc::clone(&registry) as Arc<dyn PidTracker>,
        );
        Self {
            settings,
            commands,
            source,
            logs,
            registry,
            runner,
            lifecycle: Mutex::new(()),
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Wire up the file-backed collaborators described by `config`.
    pub fn open(config: &TendConfig) -> Result<Self, SupervisorError> {
        let logs = LogSink::open(
            config.paths.terminal_log_path(),
            config.supervisor.log_max_lines,
        )?;
        let registry = PidRegistry::open(config.paths.pid_registry_path())?;
        registry.migrate()?;
        let source = GitSourceSync::new(
            RemoteSpec::from_config(&config.source),
            config.paths.runtime_dir.clone(),
        );
        Ok(Self::new(
            SupervisorSettings::from_config(config),
            Arc::new(FileCommandStore::new(config.paths.commands_file.clone())),
            Arc::new(source),
            Arc::new(logs),
            Arc::new(registry),
        ))
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    /// Kill whatever a previous daemon run left in the registry.
    pub fn recover(&self) -> Result<KillReport, SupervisorError> {
        let _guard = self.lock_lifecycle();
        let report = self.registry.kill_all()?;
        if report.total() > 0 {
            self.logs.audit(format!(
                "recovered {} orphaned process(es) from a previous run",
                report.total()
            ));
        }
        Ok(report)
    }

    /// Sync, prepare and launch the managed program.
    ///
    /// `build` and `run` override the configured build and run commands.
    pub fn start(&self, build: Option<&str>, run: Option<&str>) -> Result<ProcessId, SupervisorError> {
        let _guard = self.lock_lifecycle();
        self.start_locked(build, run)
    }

    /// Terminate the managed program and everything else in the registry.
    ///
    /// When another operation holds the lifecycle lock, registered build and
    /// script processes are killed first so a long build step cannot delay
    /// the stop. The managed program keeps its grace period.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        let (_guard, preempted) = match self.lifecycle.try_lock() {
            Ok(guard) => (guard, false),
            Err(TryLockError::Poisoned(poisoned)) => (poisoned.into_inner(), false),
            Err(TryLockError::WouldBlock) => {
                self.preempt()?;
                (self.lock_lifecycle(), true)
            }
        };
        match self.stop_locked() {
            Err(SupervisorError::NotRunning) if preempted => Ok(()),
            Err(SupervisorError::NotRunning) => {
                self.logs.audit("stop refused: no process running");
                Err(SupervisorError::NotRunning)
            }
            other => other,
        }
    }

    /// Stop (if anything is running), then start.
    pub fn restart(&self) -> Result<ProcessId, SupervisorError> {
        let _guard = self.lock_lifecycle();
        self.stop_unless_idle()?;
        self.start_locked(None, None)
    }

    /// Stop, fetch a fresh checkout and rebuild it.
    ///
    /// The program is launched again only if it was running before the call.
    /// Returns the new pid in that case.
    pub fn update(&self) -> Result<Option<ProcessId>, SupervisorError> {
        let _guard = self.lock_lifecycle();
        let config = self.commands.load()?;
        let was_running = self.lock_slot_refreshed().running_pid().is_some();
        self.stop_unless_idle()?;

        let prior = self.lock_slot().state;
        if was_running {
            self.lock_slot().set_state(ProcessState::Starting);
        }

        self.logs.audit("updating source");
        if let Err(err) = self.source.resync() {
            self.abort_start(was_running, prior);
            return Err(self.sync_failure(err.message));
        }
        match self.source.describe() {
            Some(rev) => self.logs.audit(format!("source updated to {rev}")),
            None => self.logs.audit("source updated"),
        }

        if let Err(err) = self.prepare(&config, None) {
            if matches!(err, SupervisorError::Spawn(_)) && was_running {
                self.lock_slot().set_state(ProcessState::Failed);
            } else {
                self.abort_start(was_running, prior);
            }
            return Err(err);
        }

        if !was_running {
            self.logs.audit("update finished, program left stopped");
            return Ok(None);
        }
        self.launch(&config.run_command_or(None)).map(Some)
    }

    /// Launch a named custom script alongside the managed program.
    ///
    /// The script is tracked in the registry and logged, but does not affect
    /// the managed process state.
    pub fn run_script(&self, name: &str) -> Result<RunningHandle, SupervisorError> {
        let _guard = self.lock_lifecycle();
        let config = self.commands.load()?;
        let Some(command) = config.script(name) else {
            self.logs.audit(format!("script not found: {name}"));
            return Err(SupervisorError::ScriptNotFound {
                name: name.to_string(),
            });
        };

        self.logs.audit(format!("running script {name}: {command}"));
        let handle = self
            .runner
            .spawn(command, &self.settings.runtime_dir)
            .inspect_err(|err| self.logs.audit(format!("script {name} failed to start: {err}")))?;
        tracing::info!(script = name, pid = handle.pid(), "script started");
        Ok(handle)
    }

    /// Run an ad-hoc command in the runtime directory and wait for it.
    ///
    /// `clear` and `cls` clear the log instead. Returns `None` in that case.
    pub fn exec(&self, command: &str) -> Result<Option<ExitOutcome>, SupervisorError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SpawnError::EmptyCommand.into());
        }
        if matches!(command, "clear" | "cls") {
            self.clear_logs()?;
            return Ok(None);
        }

        self.logs.append(&format!("> {command}"));
        let outcome = self.runner.run(command, &self.settings.runtime_dir);
        if let Err(err) = &outcome {
            self.logs.append(&format!("error: {err}"));
        }
        Ok(Some(outcome?))
    }

    pub fn get_logs(&self, max_lines: Option<usize>) -> Vec<String> {
        self.logs.snapshot(max_lines)
    }

    pub fn clear_logs(&self) -> Result<(), SupervisorError> {
        self.logs.clear()?;
        tracing::info!("terminal log cleared");
        Ok(())
    }

    pub fn get_state(&self) -> StateView {
        let slot = self.lock_slot_refreshed();
        let mut view = StateView {
            running: slot.running_pid().is_some(),
            state: slot.state,
            last_exit_code: slot.last_exit_code,
            ..StateView::idle()
        };
        if let Some(process) = &slot.current {
            view.pid = Some(process.id);
            view.command = Some(process.command.clone());
            view.started_at = Some(process.started_at);
        }
        view
    }

    /// Revision of the checkout, if the source sync can tell.
    pub fn source_revision(&self) -> Option<String> {
        self.source.describe()
    }

    fn start_locked(&self, build: Option<&str>, run: Option<&str>) -> Result<ProcessId, SupervisorError> {
        let prior = {
            let slot = self.lock_slot_refreshed();
            if let Some(pid) = slot.running_pid() {
                self.logs
                    .audit(format!("start refused: already running (pid {pid})"));
                return Err(SupervisorError::AlreadyRunning { pid });
            }
            slot.state
        };
        let config = self.commands.load()?;

        self.lock_slot().set_state(ProcessState::Starting);
        if let Err(err) = self.source.ensure_present() {
            self.abort_start(true, prior);
            return Err(self.sync_failure(err.message));
        }
        if let Err(err) = self.prepare(&config, build) {
            if matches!(err, SupervisorError::Spawn(_)) {
                self.lock_slot().set_state(ProcessState::Failed);
            } else {
                self.abort_start(true, prior);
            }
            return Err(err);
        }
        self.launch(&config.run_command_or(run))
    }

    /// Run setup and build steps in order, stopping at the first failure.
    fn prepare(&self, config: &CommandConfig, build: Option<&str>) -> Result<(), SupervisorError> {
        for step in config.prepare_steps(build) {
            self.logs.audit(format!("running: {step}"));
            let outcome = match self.runner.run(&step, &self.settings.runtime_dir) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.logs.audit(format!("failed to start {step}: {err}"));
                    return Err(err.into());
                }
            };
            if !outcome.success() {
                let exit_code = outcome.as_code();
                tracing::warn!(command = %step, exit_code, "build step failed");
                self.logs
                    .audit(format!("build failed ({step}), exit code {exit_code}"));
                return Err(SupervisorError::BuildFailure {
                    command: step,
                    exit_code,
                });
            }
        }
        Ok(())
    }

    /// Spawn the run command. Expects the slot to be `Starting`.
    ///
    /// The slot stays locked from spawn until the process is recorded, so a
    /// preempting stop never mistakes the new program for a build step.
    fn launch(&self, command: &str) -> Result<ProcessId, SupervisorError> {
        let mut slot = self.lock_slot();
        let handle = match self.runner.spawn(command, &self.settings.runtime_dir) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(command, error = %err, "failed to start managed process");
                self.logs.audit(format!("failed to start {command}: {err}"));
                slot.set_state(ProcessState::Failed);
                return Err(err.into());
            }
        };

        let id = ProcessId::new(handle.pid());
        slot.current = Some(ManagedProcess {
            id,
            command: handle.command().to_string(),
            working_dir: self.settings.runtime_dir.clone(),
            started_at: handle.started_at(),
            handle,
        });
        slot.last_exit_code = None;
        slot.set_state(ProcessState::Running);
        drop(slot);
        tracing::info!(pid = id.as_u32(), command, "managed process started");
        self.logs.audit(format!("started {command} (pid {id})"));
        Ok(id)
    }

    fn stop_locked(&self) -> Result<(), SupervisorError> {
        let current = {
            let mut slot = self.lock_slot_refreshed();
            let current = slot.running_pid().and(slot.current.clone());
            if current.is_some() {
                slot.set_state(ProcessState::Stopping);
            }
            current
        };
        if current.is_none() && self.registry.is_empty()? {
            return Err(SupervisorError::NotRunning);
        }

        let result = current
            .as_ref()
            .map(|process| process.handle.terminate(self.settings.grace_period));
        let report = self.registry.kill_all()?;

        if let Some(process) = &current {
            let mut slot = self.lock_slot();
            slot.last_exit_code = process.handle.exit_status().map(|o| o.as_code());
            slot.current = None;
            if result.is_some_and(TerminationResult::was_forced) {
                slot.set_state(ProcessState::Failed);
            } else {
                slot.set_state(ProcessState::Stopped);
            }
        }

        match (&current, result) {
            (Some(process), Some(TerminationResult::Forced)) => self.logs.audit(format!(
                "stopped pid {} (forced kill after {}s grace period)",
                process.id,
                self.settings.grace_period.as_secs()
            )),
            (Some(process), _) => self.logs.audit(format!("stopped pid {}", process.id)),
            (None, _) => self.logs.audit(format!(
                "stopped {} background process(es)",
                report.total()
            )),
        }
        tracing::info!(
            pid = current.as_ref().map(|p| p.id.as_u32()),
            registry_killed = report.killed.len(),
            "stop complete"
        );
        Ok(())
    }

    /// Kill registered pids other than the managed program.
    fn preempt(&self) -> Result<(), SupervisorError> {
        let slot = self.lock_slot();
        let managed = slot.current.as_ref().map(|process| process.id.as_u32());
        tracing::info!(
            managed,
            "stop requested during another operation, killing build and script processes"
        );
        self.logs.audit(
            "stop requested during another operation, killing build and script processes",
        );
        let report = self.registry.kill_all_except(managed)?;
        drop(slot);
        tracing::debug!(killed = report.killed.len(), "preempted registered processes");
        Ok(())
    }

    fn stop_unless_idle(&self) -> Result<(), SupervisorError> {
        match self.stop_locked() {
            Ok(()) | Err(SupervisorError::NotRunning) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Return the slot to where it was before a start that failed before
    /// launching.
    fn abort_start(&self, entered_starting: bool, prior: ProcessState) {
        if entered_starting {
            self.lock_slot().set_state(prior);
        }
    }

    fn sync_failure(&self, message: String) -> SupervisorError {
        tracing::warn!(error = %message, "source sync failed");
        self.logs.audit(format!("source sync failed: {message}"));
        SupervisorError::SyncFailure { message }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot_refreshed(&self) -> MutexGuard<'_, Slot> {
        let mut slot = self.lock_slot();
        slot.refresh();
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tend_core::sync::{SyncError, SyncOutcome};

    struct NoopSync;

    impl SourceSync for NoopSync {
        fn ensure_present(&self) -> Result<SyncOutcome, SyncError> {
            Ok(SyncOutcome::AlreadyPresent)
        }

        fn resync(&self) -> Result<SyncOutcome, SyncError> {
            Ok(SyncOutcome::Cloned)
        }
    }

    fn supervisor(config: CommandConfig) -> Supervisor {
        let registry = PidRegistry::open_in_memory().expect("registry");
        registry.migrate().expect("migrate");
        Supervisor::new(
            SupervisorSettings {
                runtime_dir: std::env::temp_dir(),
                grace_period: Duration::from_secs(2),
                shell: Some("sh".to_string()),
            },
            Arc::new(config),
            Arc::new(NoopSync),
            Arc::new(LogSink::in_memory(100)),
            Arc::new(registry),
        )
    }

    fn config(run: &str) -> CommandConfig {
        CommandConfig {
            run_command: run.to_string(),
            ..CommandConfig::default()
        }
    }

    #[test]
    fn slot_refresh_records_natural_exit() {
        let sup = supervisor(config("exit 4"));
        let pid = sup.start(None, None).expect("start");

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while sup.get_state().running {
            assert!(std::time::Instant::now() < deadline, "process never exited");
            std::thread::sleep(Duration::from_millis(20));
        }

        let view = sup.get_state();
        assert_eq!(view.state, ProcessState::Stopped);
        assert_eq!(view.pid, Some(pid));
        assert_eq!(view.last_exit_code, Some(4));
    }

    #[test]
    fn stop_without_anything_running_is_not_running() {
        let sup = supervisor(config("sleep 30"));
        assert!(matches!(sup.stop(), Err(SupervisorError::NotRunning)));
        assert_eq!(sup.get_state().state, ProcessState::Idle);
    }

    #[test]
    fn spawn_failure_marks_state_failed() {
        let sup = supervisor(config("sleep 30"));
        let sup = Supervisor {
            settings: SupervisorSettings {
                runtime_dir: PathBuf::from("/definitely/not/here"),
                ..sup.settings.clone()
            },
            ..sup
        };

        let err = sup.start(None, None).expect_err("cwd missing");
        assert!(matches!(
            err,
            SupervisorError::Spawn(SpawnError::WorkingDirectoryMissing { .. })
        ));
        assert_eq!(sup.get_state().state, ProcessState::Failed);
        assert!(!sup.get_state().running);
    }

    #[test]
    fn exec_clear_empties_the_log() {
        let sup = supervisor(config("sleep 30"));
        sup.logs().append("old output");
        assert_eq!(sup.exec("  clear ").expect("exec"), None);
        assert!(sup.get_logs(None).is_empty());
        assert!(matches!(
            sup.exec("   "),
            Err(SupervisorError::Spawn(SpawnError::EmptyCommand))
        ));
    }

    #[test]
    fn exec_echoes_command_and_output() {
        let sup = supervisor(config("sleep 30"));
        let outcome = sup.exec("echo adhoc").expect("exec").expect("ran");

        assert!(outcome.success());
        assert_eq!(
            sup.get_logs(None),
            vec!["> echo adhoc", "adhoc", "[exit code: 0]"]
        );
        assert!(!sup.get_state().running);
    }
}
