//! The working tree the orchestrator mutates.
//!
//! A [`Workspace`] knows how to record the current tree as the new
//! known-good state and how to return to that state. Git-backed trees use
//! [`GitWorkspace`]; anything else can use the in-memory
//! [`SnapshotWorkspace`].

pub mod git;
pub mod snapshot;

use std::path::{Path, PathBuf};

pub use git::{is_git_repo, GitWorkspace};
pub use snapshot::SnapshotWorkspace;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("{0} is not a git work tree")]
    NotARepo(PathBuf),

    #[error("working tree has uncommitted changes:\n{0}")]
    Dirty(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
        move |source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Minimal version-control surface used by a recovery run.
pub trait Workspace: Send {
    /// Root directory patches are applied against.
    fn root(&self) -> &Path;

    /// Record the current state of `paths` (root-relative, as the applied
    /// patch named them) into the known-good state; returns its id. Other
    /// changes in the tree, such as test-runner output, are left out.
    fn commit(&mut self, message: &str, paths: &[String]) -> Result<String, WorkspaceError>;

    /// Discard every change since the last known-good state.
    fn reset(&mut self) -> Result<(), WorkspaceError>;
}

/// Whether `rel` (relative to the root, `/`-separated) falls under one of
/// the `excluded` relative prefixes.
pub(crate) fn is_excluded(rel: &Path, excluded: &[PathBuf]) -> bool {
    excluded.iter().any(|ex| rel.starts_with(ex))
}
