//! In-memory workspace for trees that are not under git.
//!
//! `open` captures every file's bytes and `commit` folds the named paths
//! into that capture. `reset` rewrites changed files, recreates deleted ones
//! and removes files and directories that are not part of the capture.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use super::{is_excluded, Workspace, WorkspaceError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Tree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

impl Tree {
    fn id(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in &self.files {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(Sha256::digest(content));
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug)]
pub struct SnapshotWorkspace {
    root: PathBuf,
    exclude: Vec<PathBuf>,
    snapshot: Tree,
}

impl SnapshotWorkspace {
    /// Capture the tree at `root`. `exclude` holds root-relative paths that
    /// are neither captured nor touched by `reset`; `.git` is always excluded.
    pub fn open(root: &Path, exclude: Vec<String>) -> Result<Self, WorkspaceError> {
        let mut exclude: Vec<PathBuf> = exclude.into_iter().map(PathBuf::from).collect();
        exclude.push(PathBuf::from(".git"));
        let mut ws = Self {
            root: root.to_path_buf(),
            exclude,
            snapshot: Tree::default(),
        };
        ws.snapshot = ws.scan()?;
        debug!(root = %root.display(), files = ws.snapshot.files.len(), "snapshot workspace opened");
        Ok(ws)
    }

    /// Number of files in the current known-good snapshot.
    pub fn tracked_files(&self) -> usize {
        self.snapshot.files.len()
    }

    fn scan(&self) -> Result<Tree, WorkspaceError> {
        let mut tree = Tree::default();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                e.path()
                    .strip_prefix(&self.root)
                    .map(|rel| !is_excluded(rel, &self.exclude))
                    .unwrap_or(false)
            });

        for entry in walker {
            let entry = entry.map_err(|e| WorkspaceError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
                source: e.into(),
            })?;
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let rel = rel.to_path_buf();
            if entry.file_type().is_dir() {
                tree.dirs.insert(rel);
            } else if entry.file_type().is_file() {
                let content = fs::read(entry.path()).map_err(WorkspaceError::io(entry.path()))?;
                tree.files.insert(rel, content);
            }
        }
        Ok(tree)
    }
}

impl Workspace for SnapshotWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn commit(&mut self, _message: &str, paths: &[String]) -> Result<String, WorkspaceError> {
        for rel in paths {
            let rel = PathBuf::from(rel);
            if is_excluded(&rel, &self.exclude) {
                continue;
            }
            let abs = self.root.join(&rel);
            match fs::read(&abs) {
                Ok(content) => {
                    let parents = rel.ancestors().skip(1).filter(|d| !d.as_os_str().is_empty());
                    self.snapshot.dirs.extend(parents.map(Path::to_path_buf));
                    self.snapshot.files.insert(rel, content);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.snapshot.files.remove(&rel);
                }
                Err(e) => return Err(WorkspaceError::io(&abs)(e)),
            }
        }
        let id = self.snapshot.id();
        debug!(%id, files = self.snapshot.files.len(), "snapshot committed");
        Ok(id)
    }

    fn reset(&mut self) -> Result<(), WorkspaceError> {
        let current = self.scan()?;

        for path in current.files.keys() {
            if !self.snapshot.files.contains_key(path) {
                let abs = self.root.join(path);
                fs::remove_file(&abs).map_err(WorkspaceError::io(&abs))?;
            }
        }

        for dir in &self.snapshot.dirs {
            let abs = self.root.join(dir);
            fs::create_dir_all(&abs).map_err(WorkspaceError::io(&abs))?;
        }

        for (path, content) in &self.snapshot.files {
            if current.files.get(path) != Some(content) {
                let abs = self.root.join(path);
                fs::write(&abs, content).map_err(WorkspaceError::io(&abs))?;
            }
        }

        // Deepest first so parents are empty by the time they are reached.
        for dir in current.dirs.iter().rev() {
            if !self.snapshot.dirs.contains(dir) {
                let abs = self.root.join(dir);
                fs::remove_dir_all(&abs).map_err(WorkspaceError::io(&abs))?;
            }
        }

        debug!(files = self.snapshot.files.len(), "snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    #[test]
    fn test_reset_undoes_all_change_kinds() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.rs", "a\n");
        write(dir.path(), "src/b.rs", "b\n");
        let mut ws = SnapshotWorkspace::open(dir.path(), Vec::new()).unwrap();
        assert_eq!(ws.tracked_files(), 2);

        write(dir.path(), "src/a.rs", "changed\n");
        fs::remove_file(dir.path().join("src/b.rs")).unwrap();
        write(dir.path(), "new/deep/c.rs", "c\n");
        ws.reset().unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("src/a.rs")).unwrap(), "a\n");
        assert_eq!(fs::read_to_string(dir.path().join("src/b.rs")).unwrap(), "b\n");
        assert!(!dir.path().join("new").exists());
    }

    #[test]
    fn test_commit_moves_known_good_state() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "1\n");
        let mut ws = SnapshotWorkspace::open(dir.path(), Vec::new()).unwrap();
        let before = ws.commit("noop", &[]).unwrap();

        write(dir.path(), "a.txt", "2\n");
        let after = ws.commit("iteration 1", &["a.txt".to_string()]).unwrap();
        assert_ne!(before, after);

        write(dir.path(), "a.txt", "3\n");
        ws.reset().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "2\n");
    }

    #[test]
    fn test_commit_ignores_unnamed_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.txt", "bug\n");
        let mut ws = SnapshotWorkspace::open(dir.path(), Vec::new()).unwrap();

        write(dir.path(), "src/a.txt", "fixed\n");
        write(dir.path(), "src/new/b.txt", "b\n");
        write(dir.path(), "coverage/lcov.info", "TN:\n");
        ws.commit("iteration 1", &["src/a.txt".to_string(), "src/new/b.txt".to_string()])
            .unwrap();
        assert_eq!(ws.tracked_files(), 2);

        ws.reset().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("src/a.txt")).unwrap(), "fixed\n");
        assert!(dir.path().join("src/new/b.txt").exists());
        assert!(!dir.path().join("coverage").exists());
    }

    #[test]
    fn test_excluded_paths_survive_reset() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "1\n");
        let mut ws = SnapshotWorkspace::open(dir.path(), vec![".mendloop".to_string()]).unwrap();
        write(dir.path(), ".mendloop/runs/r/events.jsonl", "{}\n");
        ws.reset().unwrap();
        assert!(dir.path().join(".mendloop/runs/r/events.jsonl").exists());
    }
}
