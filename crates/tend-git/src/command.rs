//! Thin wrapper around the `git` binary for the few commands source sync
//! needs.

use std::path::Path;
use std::process::Command;

use crate::error::GitError;

/// Runs `git` non-interactively and keeps one credential out of everything
/// it renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    program: String,
    secret: Option<String>,
}

impl GitCli {
    /// `git` from `PATH`. A blank `secret` is ignored.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            program: "git".to_string(),
            secret: secret
                .filter(|secret| !secret.is_empty())
                .map(str::to_string),
        }
    }

    /// Run `git <args>` in `cwd` and return its stdout.
    pub fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let rendered = self.redact(&format!("{} {}", self.program, args.join(" ")));
        tracing::debug!(command = %rendered, cwd = %cwd.display(), "running git");

        let output = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|source| GitError::Io {
                command: rendered.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stderr: self.redact(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn redact(&self, text: &str) -> String {
        match &self.secret {
            Some(secret) => text.replace(secret.as_str(), "***"),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GitCli;
    use crate::error::GitError;

    #[test]
    fn version_is_read_from_stdout() {
        let cwd = tempfile::tempdir().expect("tempdir");
        let stdout = GitCli::new(None)
            .run(cwd.path(), &["--version"])
            .expect("git --version");
        assert!(stdout.to_ascii_lowercase().contains("git version"));
    }

    #[test]
    fn failing_command_carries_status_and_stderr() {
        let cwd = tempfile::tempdir().expect("tempdir");
        let err = GitCli::new(None)
            .run(cwd.path(), &["tend-unknown-subcommand"])
            .expect_err("unknown subcommand");
        match err {
            GitError::CommandFailed {
                command,
                status,
                stderr,
            } => {
                assert_eq!(command, "git tend-unknown-subcommand");
                assert!(status.is_some());
                assert!(!stderr.trim().is_empty());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let cwd = tempfile::tempdir().expect("tempdir");
        let git = GitCli {
            program: "/definitely/missing/git".to_string(),
            secret: None,
        };
        let err = git.run(cwd.path(), &["status"]).expect_err("missing binary");
        assert!(matches!(
            err,
            GitError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::NotFound
        ));
    }

    #[test]
    fn token_never_appears_in_errors() {
        let cwd = tempfile::tempdir().expect("tempdir");
        let err = GitCli::new(Some("s3cr3t-token"))
            .run(cwd.path(), &["clone", "https://s3cr3t-token@127.0.0.1:1/x.git"])
            .expect_err("unreachable remote");
        let rendered = format!("{err:?}");
        assert!(!rendered.contains("s3cr3t-token"));
        assert!(rendered.contains("https://***@127.0.0.1:1/x.git"));
    }

    #[test]
    fn blank_secret_redacts_nothing() {
        assert_eq!(GitCli::new(Some("")).redact("plain text"), "plain text");
    }
}
