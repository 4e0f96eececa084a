//! Seams between the runner and the components that consume its side effects.

/// Destination for output lines. Implementations must tolerate concurrent
/// callers: every running command has its own forwarding thread.
pub trait LineSink: Send + Sync {
    fn append(&self, line: &str);

    /// Append lines that arrived together, in order.
    fn append_batch(&self, lines: &[String]) {
        for line in lines {
            self.append(line);
        }
    }
}

/// Bookkeeping for spawned pids. `release` must be idempotent: a pid may
/// already have been dropped by an external cleanup.
pub trait PidTracker: Send + Sync {
    fn track(&self, pid: u32, command: &str);
    fn release(&self, pid: u32);
    fn is_tracked(&self, pid: u32) -> bool;
}

/// Tracker for runners whose children do not need to outlive the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTracking;

impl PidTracker for NoTracking {
    fn track(&self, _pid: u32, _command: &str) {}

    fn release(&self, _pid: u32) {}

    fn is_tracked(&self, _pid: u32) -> bool {
        false
    }
}
