//! Lifecycle states of the managed process.

use serde::{Deserialize, Serialize};

/// Where the managed process is in its lifecycle.
///
/// ```text
/// Idle → Starting → Running → Stopping → Stopped
///           ↓          ↓          ↓
///         Failed     Stopped    Failed (forced kill)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Nothing has been started since the supervisor came up.
    #[default]
    Idle,
    /// Source sync / build / spawn in progress.
    Starting,
    Running,
    /// Graceful termination in progress.
    Stopping,
    Stopped,
    /// Spawn failed, or the last stop had to escalate to a forced kill.
    Failed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Idle => "IDLE",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Stopped => "STOPPED",
            ProcessState::Failed => "FAILED",
        }
    }

    /// Returns true if a lifecycle operation is mid-flight.
    pub fn is_transient(self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Stopping)
    }

    /// Returns true if a new `start` may begin from this state.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            ProcessState::Idle | ProcessState::Stopped | ProcessState::Failed
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid process state transition: {from} -> {to}")]
    InvalidTransition { from: ProcessState, to: ProcessState },
}

/// Check if a process state transition is valid.
pub fn is_transition_allowed(from: ProcessState, to: ProcessState) -> bool {
    use ProcessState::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Idle | Stopped | Failed, Starting) => true,
        (Starting, Running) => true,
        // Sync or build aborted before anything was spawned: back to the
        // resting state the operation started from. Spawn errors land on
        // Failed.
        (Starting, Idle | Stopped | Failed) => true,
        (Running, Stopping) => true,
        // Natural exit.
        (Running, Stopped) => true,
        (Stopping, Stopped) => true,
        (Stopping, Failed) => true,
        _ => false,
    }
}

/// Validate a transition, returning the target state on success.
pub fn transition(from: ProcessState, to: ProcessState) -> Result<ProcessState, StateError> {
    if is_transition_allowed(from, to) {
        Ok(to)
    } else {
        Err(StateError::InvalidTransition { from, to })
    }
}
