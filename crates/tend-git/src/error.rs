use std::path::PathBuf;

use tend_core::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git command returned non-zero exit ({command}) status={status:?}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("path is not a git checkout: {path}")]
    NotARepository { path: PathBuf },
    #[error("checkout path {path} exists, is not empty, and is not a git checkout")]
    Occupied { path: PathBuf },
    #[error("failed to prepare checkout directory {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<GitError> for SyncError {
    fn from(err: GitError) -> Self {
        let message = match &err {
            GitError::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => {
                format!("{err}: {}", stderr.trim())
            }
            _ => err.to_string(),
        };
        SyncError::new(message)
    }
}
