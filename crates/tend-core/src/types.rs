//! Core types shared between the supervisor and its callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::ProcessState;

/// OS process identifier of a child spawned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub fn new(pid: u32) -> Self {
        Self(pid)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time answer to "is the managed program up?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateView {
    pub running: bool,
    pub state: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<ProcessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Exit code of the last managed process that ended on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
}

impl StateView {
    pub fn idle() -> Self {
        Self {
            running: false,
            state: ProcessState::Idle,
            pid: None,
            command: None,
            started_at: None,
            last_exit_code: None,
        }
    }
}

impl Default for StateView {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_serializes_as_bare_number() {
        let json = serde_json::to_string(&ProcessId::new(4242)).expect("serialize pid");
        assert_eq!(json, "4242");
        assert_eq!(ProcessId::from(7).to_string(), "7");
    }

    #[test]
    fn idle_view_omits_absent_fields() {
        let json = serde_json::to_value(StateView::idle()).expect("serialize view");
        assert_eq!(json["running"], false);
        assert_eq!(json["state"], "IDLE");
        assert!(json.get("pid").is_none());
        assert!(json.get("command").is_none());
    }
}
