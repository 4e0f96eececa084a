use std::path::Path;

use crate::command::GitCli;
use crate::error::GitError;

pub fn is_checkout(dir: &Path) -> bool {
    dir.join(".git").exists()
}

/// Short sha plus relative commit time, e.g. `1a2b3c4 (2 hours ago)`.
pub fn describe_head(dir: &Path, git: &GitCli) -> Result<String, GitError> {
    if !is_checkout(dir) {
        return Err(GitError::NotARepository {
            path: dir.to_path_buf(),
        });
    }
    let stdout = git.run(dir, &["log", "-1", "--format=%h (%cr)"])?;
    Ok(stdout.trim().to_string())
}
