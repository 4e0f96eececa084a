//! Git-backed source sync: clone when absent, remove-and-reclone on resync.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tend_core::{SourceConfig, SourceSync, SyncError, SyncOutcome};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::{describe_head, is_checkout};

/// Where the source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub url: String,
    pub branch: Option<String>,
    pub token: Option<String>,
}

impl RemoteSpec {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            url: config.repo_url.trim().to_string(),
            branch: config
                .branch
                .as_deref()
                .map(str::trim)
                .filter(|branch| !branch.is_empty())
                .map(str::to_string),
            token: config.token(),
        }
    }

    /// URL with the token spliced in as userinfo for https remotes.
    ///
    /// Remotes that already carry userinfo, or are not https, are returned
    /// unchanged.
    pub fn authenticated_url(&self) -> String {
        let Some(token) = self.token.as_deref() else {
            return self.url.clone();
        };
        match self.url.strip_prefix("https://") {
            Some(rest) => {
                let authority = rest.split('/').next().unwrap_or_default();
                if authority.contains('@') {
                    self.url.clone()
                } else {
                    format!("https://{token}@{rest}")
                }
            }
            None => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitSourceSync {
    git: GitCli,
    remote: RemoteSpec,
    checkout: PathBuf,
}

impl GitSourceSync {
    pub fn new(remote: RemoteSpec, checkout: impl Into<PathBuf>) -> Self {
        Self {
            git: GitCli::new(remote.token.as_deref()),
            remote,
            checkout: checkout.into(),
        }
    }

    fn clone_fresh(&self) -> Result<(), GitError> {
        let parent = match self.checkout.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|source| GitError::Filesystem {
            path: parent.clone(),
            source,
        })?;
        let target = match self.checkout.file_name() {
            Some(name) => name.to_string_lossy(),
            None => self.checkout.to_string_lossy(),
        };
        let url = self.remote.authenticated_url();

        let mut args = vec!["clone"];
        if let Some(branch) = &self.remote.branch {
            args.extend(["--branch", branch.as_str()]);
        }
        args.extend([url.as_str(), &*target]);

        tracing::info!(
            remote = %self.git.redact(&self.remote.url),
            checkout = %self.checkout.display(),
            "cloning source"
        );
        self.git.run(&parent, &args)?;
        Ok(())
    }

    fn checkout_is_empty_dir(&self) -> Result<bool, GitError> {
        match fs::read_dir(&self.checkout) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(source) => Err(GitError::Filesystem {
                path: self.checkout.clone(),
                source,
            }),
        }
    }
}

impl SourceSync for GitSourceSync {
    fn ensure_present(&self) -> Result<SyncOutcome, SyncError> {
        if is_checkout(&self.checkout) {
            return Ok(SyncOutcome::AlreadyPresent);
        }
        if !self.checkout_is_empty_dir()? {
            return Err(GitError::Occupied {
                path: self.checkout.clone(),
            }
            .into());
        }
        self.clone_fresh()?;
        Ok(SyncOutcome::Cloned)
    }

    fn resync(&self) -> Result<SyncOutcome, SyncError> {
        remove_tree(&self.checkout).map_err(|source| GitError::Filesystem {
            path: self.checkout.clone(),
            source,
        })?;
        tracing::info!(checkout = %self.checkout.display(), "removed local checkout");
        self.clone_fresh()?;
        Ok(SyncOutcome::Cloned)
    }

    fn describe(&self) -> Option<String> {
        describe_head(&self.checkout, &self.git).ok()
    }
}

/// Remove a directory tree, clearing read-only bits and retrying once if the
/// first attempt fails. A missing tree is not an error.
fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(first) => {
            tracing::debug!(path = %path.display(), error = %first, "retrying removal after clearing read-only bits");
            make_writable(path)?;
            fs::remove_dir_all(path)
        }
    }
}

fn make_writable(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            make_writable(&entry?.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::tests::{commit_file, init_origin};

    fn local_sync(origin: &Path, checkout: &Path) -> GitSourceSync {
        let remote = RemoteSpec {
            url: origin.to_string_lossy().into_owned(),
            branch: None,
            token: None,
        };
        GitSourceSync::new(remote, checkout)
    }

    #[test]
    fn authenticated_url_injects_token_for_https_only() {
        let mut remote = RemoteSpec {
            url: "https://github.com/acme/widget.git".to_string(),
            branch: None,
            token: None,
        };
        assert_eq!(remote.authenticated_url(), "https://github.com/acme/widget.git");

        remote.token = Some("tok".to_string());
        assert_eq!(
            remote.authenticated_url(),
            "https://tok@github.com/acme/widget.git"
        );

        remote.url = "https://bot@github.com/acme/widget.git".to_string();
        assert_eq!(remote.authenticated_url(), remote.url);

        remote.url = "git@github.com:acme/widget.git".to_string();
        assert_eq!(remote.authenticated_url(), remote.url);
    }

    #[test]
    fn from_config_drops_blank_branch() {
        let config = SourceConfig {
            repo_url: " https://example.com/r.git ".to_string(),
            branch: Some("  ".to_string()),
            token_env: "TEND_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
        };
        let remote = RemoteSpec::from_config(&config);
        assert_eq!(remote.url, "https://example.com/r.git");
        assert_eq!(remote.branch, None);
        assert_eq!(remote.token, None);
    }

    #[test]
    fn ensure_present_clones_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = dir.path().join("origin");
        init_origin(&origin);
        let checkout = dir.path().join("work").join("runtime");

        let sync = local_sync(&origin, &checkout);
        assert_eq!(sync.ensure_present().expect("clone"), SyncOutcome::Cloned);
        assert!(checkout.join("README.md").exists());
        assert_eq!(
            sync.ensure_present().expect("second call"),
            SyncOutcome::AlreadyPresent
        );
        assert!(sync.describe().is_some());
    }

    #[test]
    fn ensure_present_refuses_occupied_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = dir.path().join("origin");
        init_origin(&origin);
        let checkout = dir.path().join("runtime");
        fs::create_dir_all(&checkout).expect("create checkout");
        fs::write(checkout.join("stray.txt"), "x").expect("write stray");

        let err = local_sync(&origin, &checkout)
            .ensure_present()
            .expect_err("occupied");
        assert!(err.message.contains("not a git checkout"));
    }

    #[test]
    fn resync_discards_local_changes_and_picks_up_new_commits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let origin = dir.path().join("origin");
        init_origin(&origin);
        let checkout = dir.path().join("runtime");
        let sync = local_sync(&origin, &checkout);
        sync.ensure_present().expect("clone");

        fs::write(checkout.join("local-only.txt"), "scratch").expect("write local");
        commit_file(&origin, "NEW.md", "fresh\n");

        assert_eq!(sync.resync().expect("resync"), SyncOutcome::Cloned);
        assert!(!checkout.join("local-only.txt").exists());
        assert!(checkout.join("NEW.md").exists());
    }

    #[test]
    fn resync_with_unreachable_remote_reports_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let checkout = dir.path().join("runtime");
        let sync = local_sync(&dir.path().join("no-such-origin"), &checkout);

        let err = sync.resync().expect_err("clone should fail");
        assert!(err.message.contains("git command returned non-zero exit"));
        assert!(sync.describe().is_none());
    }

    #[test]
    fn remove_tree_handles_read_only_entries_and_missing_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("nested")).expect("create tree");
        let file = tree.join("nested").join("locked.txt");
        fs::write(&file, "x").expect("write file");
        let mut perms = fs::metadata(&file).expect("meta").permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).expect("set readonly");

        remove_tree(&tree).expect("remove tree");
        assert!(!tree.exists());
        remove_tree(&tree).expect("missing tree is fine");
    }
}
