//! Git-backed workspace: every improvement becomes a commit on a run branch.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use super::{Workspace, WorkspaceError};

/// Check whether `dir` is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorkspaceError::Git {
            command: args.join(" "),
            stderr: format!("failed to run git: {e}"),
        })?;

    if !output.status.success() {
        return Err(WorkspaceError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// HEAD commit SHA of the repository at `dir`.
pub fn capture_head_sha(dir: &Path) -> Result<String, WorkspaceError> {
    let sha = git(dir, &["rev-parse", "HEAD"])?;
    if sha.is_empty() {
        return Err(WorkspaceError::Git {
            command: "rev-parse HEAD".to_string(),
            stderr: "empty output".to_string(),
        });
    }
    Ok(sha)
}

/// Git workspace pinned to a per-run branch.
#[derive(Debug)]
pub struct GitWorkspace {
    root: PathBuf,
    branch: String,
    base: String,
    last: String,
    /// Relative paths never staged, cleaned or counted as dirt.
    exclude: Vec<String>,
    identity: Vec<String>,
}

impl GitWorkspace {
    /// Open the repository at `root`, refuse a dirty tree and switch to a
    /// fresh `mendloop/<run_id>` branch.
    pub fn open(root: &Path, run_id: &str, exclude: Vec<String>) -> Result<Self, WorkspaceError> {
        if !is_git_repo(root) {
            return Err(WorkspaceError::NotARepo(root.to_path_buf()));
        }

        let mut status_args = vec!["status", "--porcelain", "--", "."];
        let pathspecs: Vec<String> = exclude.iter().map(|p| format!(":(exclude){p}")).collect();
        status_args.extend(pathspecs.iter().map(String::as_str));
        let dirt = git(root, &status_args)?;
        if !dirt.is_empty() {
            return Err(WorkspaceError::Dirty(dirt));
        }

        let base = capture_head_sha(root)?;
        let branch = format!("mendloop/{run_id}");
        git(root, &["checkout", "-q", "-b", &branch])?;

        let identity = if git(root, &["config", "user.email"]).is_ok() {
            Vec::new()
        } else {
            vec![
                "-c".to_string(),
                "user.name=mendloop".to_string(),
                "-c".to_string(),
                "user.email=mendloop@localhost".to_string(),
            ]
        };

        info!(root = %root.display(), %branch, %base, "git workspace opened");
        Ok(Self {
            root: root.to_path_buf(),
            branch,
            base: base.clone(),
            last: base,
            exclude,
            identity,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Commit the run started from.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Last known-good commit.
    pub fn last(&self) -> &str {
        &self.last
    }

    fn exclude_pathspecs(&self) -> Vec<String> {
        self.exclude
            .iter()
            .map(|p| format!(":(exclude){p}"))
            .collect()
    }
}

impl Workspace for GitWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn commit(&mut self, message: &str, paths: &[String]) -> Result<String, WorkspaceError> {
        if !paths.is_empty() {
            let mut pathspecs: Vec<String> =
                paths.iter().map(|p| format!(":(literal){p}")).collect();
            pathspecs.extend(self.exclude_pathspecs());
            let mut add = vec!["add", "-A", "--"];
            add.extend(pathspecs.iter().map(String::as_str));
            git(&self.root, &add)?;
        }

        let mut commit: Vec<&str> = self.identity.iter().map(String::as_str).collect();
        commit.extend(["commit", "-q", "--allow-empty", "--no-verify", "-m", message]);
        git(&self.root, &commit)?;

        self.last = capture_head_sha(&self.root)?;
        debug!(sha = %self.last, "workspace committed");
        Ok(self.last.clone())
    }

    fn reset(&mut self) -> Result<(), WorkspaceError> {
        git(&self.root, &["reset", "-q", "--hard", &self.last])?;
        let mut clean = vec!["clean", "-q", "-f", "-d"];
        for p in &self.exclude {
            clean.push("-e");
            clean.push(p);
        }
        git(&self.root, &clean)?;
        debug!(sha = %self.last, "workspace reset");
        Ok(())
    }
}
