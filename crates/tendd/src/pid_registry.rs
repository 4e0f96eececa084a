//! Durable set of pids spawned by the daemon, so a restarted daemon can
//! reap what a previous run left behind.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tend_runner::{kill_group, PidTracker};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    pub command: String,
    pub registered_at: DateTime<Utc>,
}

/// Result of [`PidRegistry::kill_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    /// Pids that were signalled.
    pub killed: Vec<u32>,
    /// Pids that had already exited.
    pub vanished: Vec<u32>,
    /// Pids that could not be signalled, with the reason.
    pub failed: Vec<(u32, String)>,
}

impl KillReport {
    pub fn total(&self) -> usize {
        self.killed.len() + self.vanished.len() + self.failed.len()
    }
}

#[derive(Debug)]
pub struct PidRegistry {
    conn: Mutex<Connection>,
}

impl PidRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<(), RegistryError> {
        self.conn().execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS pids (
    pid INTEGER PRIMARY KEY,
    command TEXT NOT NULL,
    registered_at TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    /// Record `pid`. Re-adding a pid (reused by the OS) replaces the entry.
    pub fn add(&self, pid: u32, command: &str) -> Result<(), RegistryError> {
        self.conn().execute(
            r#"
INSERT INTO pids (pid, command, registered_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(pid) DO UPDATE SET
  command = excluded.command,
  registered_at = excluded.registered_at
"#,
            params![pid, command, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Forget `pid`. Returns whether it was present; removing twice is fine.
    pub fn remove(&self, pid: u32) -> Result<bool, RegistryError> {
        let removed = self
            .conn()
            .execute("DELETE FROM pids WHERE pid = ?1", params![pid])?;
        Ok(removed > 0)
    }

    pub fn all_active(&self) -> Result<BTreeSet<u32>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT pid FROM pids")?;
        let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
        let mut pids = BTreeSet::new();
        for pid in rows {
            pids.insert(pid?);
        }
        Ok(pids)
    }

    pub fn contains(&self, pid: u32) -> Result<bool, RegistryError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM pids WHERE pid = ?1",
            params![pid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM pids", [], |row| row.get(0))?;
        Ok(count == 0)
    }

    pub fn entries(&self) -> Result<Vec<PidRecord>, RegistryError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT pid, command, registered_at FROM pids ORDER BY registered_at, pid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (pid, command, registered_at) = row?;
            out.push(PidRecord {
                pid,
                command,
                registered_at: parse_rfc3339(&registered_at)?,
            });
        }
        Ok(out)
    }

    /// SIGKILL every registered pid's process group and clear the registry.
    ///
    /// A pid that no longer exists counts as already handled. Every pid is
    /// removed, including ones that could not be signalled.
    pub fn kill_all(&self) -> Result<KillReport, RegistryError> {
        self.kill_all_except(None)
    }

    /// Like [`kill_all`](Self::kill_all), but leaves `keep` alive and
    /// registered.
    pub fn kill_all_except(&self, keep: Option<u32>) -> Result<KillReport, RegistryError> {
        let mut report = KillReport::default();
        for pid in self.all_active()? {
            if Some(pid) == keep {
                continue;
            }
            match kill_group(pid) {
                Ok(true) => report.killed.push(pid),
                Ok(false) => report.vanished.push(pid),
                Err(err) => {
                    tracing::warn!(pid, error = %err, "failed to kill registered pid");
                    report.failed.push((pid, err.to_string()));
                }
            }
            self.remove(pid)?;
        }
        if report.total() > 0 {
            tracing::info!(
                killed = report.killed.len(),
                vanished = report.vanished.len(),
                failed = report.failed.len(),
                "cleared pid registry"
            );
        }
        Ok(report)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PidTracker for PidRegistry {
    fn track(&self, pid: u32, command: &str) {
        if let Err(err) = self.add(pid, command) {
            tracing::warn!(pid, error = %err, "failed to register pid");
        }
    }

    fn release(&self, pid: u32) {
        if let Err(err) = self.remove(pid) {
            tracing::warn!(pid, error = %err, "failed to release pid");
        }
    }

    fn is_tracked(&self, pid: u32) -> bool {
        self.contains(pid).unwrap_or_else(|err| {
            tracing::warn!(pid, error = %err, "failed to look up pid");
            false
        })
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| RegistryError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    fn registry() -> PidRegistry {
        let registry = PidRegistry::open_in_memory().expect("open registry");
        registry.migrate().expect("migrate");
        registry
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let registry = registry();
        registry.add(100, "python app.py").expect("add");
        registry.add(100, "python app.py").expect("add again");
        registry.add(200, "npm run build").expect("add");

        assert_eq!(registry.all_active().expect("list"), BTreeSet::from([100, 200]));
        assert!(registry.remove(100).expect("remove"));
        assert!(!registry.remove(100).expect("remove twice"));
        assert_eq!(registry.all_active().expect("list"), BTreeSet::from([200]));
    }

    #[test]
    fn entries_carry_command_and_time() {
        let registry = registry();
        let before = Utc::now();
        registry.add(7, "sleep 5").expect("add");

        let entries = registry.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pid, 7);
        assert_eq!(entries[0].command, "sleep 5");
        assert!(entries[0].registered_at >= before - chrono::Duration::seconds(1));
    }

    #[test]
    fn registry_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pids.sqlite");
        {
            let registry = PidRegistry::open(&path).expect("open");
            registry.migrate().expect("migrate");
            registry.add(4242, "python app.py").expect("add");
        }

        let registry = PidRegistry::open(&path).expect("reopen");
        registry.migrate().expect("migrate");
        assert_eq!(registry.all_active().expect("list"), BTreeSet::from([4242]));
    }

    #[test]
    fn kill_all_kills_live_groups_and_tolerates_exited_pids() {
        let registry = registry();

        let mut live = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let mut done = Command::new("true").spawn().expect("spawn true");
        done.wait().expect("wait true");

        registry.add(live.id(), "sleep 30").expect("add live");
        registry.add(done.id(), "true").expect("add done");

        let report = registry.kill_all().expect("kill all");
        assert_eq!(report.killed, vec![live.id()]);
        assert_eq!(report.vanished, vec![done.id()]);
        assert!(report.failed.is_empty());
        assert!(registry.is_empty().expect("empty"));

        let status = live.wait().expect("wait sleep");
        assert!(!status.success());
    }

    #[test]
    fn kill_all_except_spares_the_kept_pid() {
        let registry = registry();
        let spawn_sleep = || {
            Command::new("sleep")
                .arg("30")
                .stdin(Stdio::null())
                .process_group(0)
                .spawn()
                .expect("spawn sleep")
        };
        let mut kept = spawn_sleep();
        let mut build = spawn_sleep();
        registry.add(kept.id(), "python app.py").expect("add kept");
        registry.add(build.id(), "sleep 30").expect("add build");

        let report = registry.kill_all_except(Some(kept.id())).expect("kill");
        assert_eq!(report.killed, vec![build.id()]);
        assert!(!build.wait().expect("wait build").success());
        assert_eq!(registry.all_active().expect("list"), BTreeSet::from([kept.id()]));
        assert_eq!(kept.try_wait().expect("try_wait"), None);

        registry.kill_all().expect("cleanup");
        kept.wait().expect("wait kept");
    }

    #[test]
    fn tracker_seam_writes_through() {
        let registry = registry();
        registry.track(55, "echo hi");
        assert!(!registry.is_empty().expect("count"));
        assert!(registry.is_tracked(55));
        assert!(!registry.is_tracked(56));
        registry.release(55);
        assert!(!registry.is_tracked(55));
        registry.release(55);
        assert!(registry.is_empty().expect("count"));
    }
}
