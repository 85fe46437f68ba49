//! All-or-nothing application of a [`Patch`] to a working tree.
//!
//! Every path the patch touches is snapshotted before the first write. If any
//! file change fails, all snapshots are restored verbatim and directories
//! created along the way are removed, so a failed apply leaves the tree
//! byte-identical to how it was found. Snapshots keep file modes and
//! symbolic links as well as contents.
//!
//! Targets are confined to the root. A path whose existing parent directory
//! resolves outside the canonical root is refused, as is any path that goes
//! through a symlinked directory or rewrites a symlinked file in place.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::patch::{ChangeKind, FileChange, Patch};

/// Why a single file change could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplyErrorKind {
    #[error("hunk {hunk} does not match at line {line}: expected {expected:?}, found {actual:?}")]
    HunkMismatch {
        hunk: usize,
        line: usize,
        expected: String,
        actual: Option<String>,
    },

    #[error("file already exists")]
    AlreadyExists,

    #[error("file does not exist")]
    MissingFile,

    #[error("file is not valid UTF-8")]
    NotUtf8,

    #[error("path escapes the working tree")]
    OutsideRoot,

    #[error("path goes through or names a symbolic link")]
    Symlink,

    #[error("io error: {message}")]
    Io { message: String },
}

/// Failure of the whole apply; the tree has already been restored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("file change {index} ({path}): {kind}")]
pub struct ApplyError {
    /// Index of the failing change within the patch.
    pub index: usize,
    pub path: String,
    pub kind: ApplyErrorKind,
}

/// What a successful apply did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub modified: Vec<String>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub hunks_applied: usize,
}

impl ApplyReport {
    pub fn files_changed(&self) -> usize {
        self.modified.len() + self.created.len() + self.deleted.len()
    }
}

// ---------------------------------------------------------------------------
// Snapshot / restore
// ---------------------------------------------------------------------------

enum Saved {
    Absent,
    File {
        content: Vec<u8>,
        perms: fs::Permissions,
    },
    Link(PathBuf),
}

struct Snapshot {
    path: PathBuf,
    saved: Saved,
}

#[derive(Default)]
struct Journal {
    snapshots: Vec<Snapshot>,
    created_dirs: Vec<PathBuf>,
}

impl Journal {
    fn capture(&mut self, path: PathBuf) -> std::io::Result<()> {
        if self.snapshots.iter().any(|s| s.path == path) {
            return Ok(());
        }
        let saved = match fs::symlink_metadata(&path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Saved::Absent,
            Err(e) => return Err(e),
            Ok(meta) if meta.file_type().is_symlink() => Saved::Link(fs::read_link(&path)?),
            Ok(meta) => Saved::File {
                content: fs::read(&path)?,
                perms: meta.permissions(),
            },
        };
        self.snapshots.push(Snapshot { path, saved });
        Ok(())
    }

    /// Create missing ancestors of `file`, remembering each one created.
    fn ensure_parent(&mut self, file: &Path) -> std::io::Result<()> {
        let Some(parent) = file.parent() else {
            return Ok(());
        };
        let mut missing = Vec::new();
        let mut cur = Some(parent);
        while let Some(dir) = cur {
            if dir.as_os_str().is_empty() || dir.exists() {
                break;
            }
            missing.push(dir.to_path_buf());
            cur = dir.parent();
        }
        fs::create_dir_all(parent)?;
        // Deepest last, so restore can pop in order.
        self.created_dirs.extend(missing.into_iter().rev());
        Ok(())
    }

    fn restore(self) {
        for snap in self.snapshots.iter().rev() {
            let result = match &snap.saved {
                Saved::File { content, perms } => {
                    write_atomic(&snap.path, content, Some(perms))
                }
                Saved::Link(target) => {
                    remove_entry(&snap.path).and_then(|()| make_symlink(target, &snap.path))
                }
                Saved::Absent => remove_entry(&snap.path),
            };
            if let Err(e) = result {
                warn!(path = %snap.path.display(), error = %e, "failed to restore file");
            }
        }
        for dir in self.created_dirs.iter().rev() {
            if let Err(e) = fs::remove_dir(dir) {
                debug!(path = %dir.display(), error = %e, "left created directory in place");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Text handling
// ---------------------------------------------------------------------------

/// Line layout of an existing file, kept so rewrites preserve it.
struct TextFile {
    lines: Vec<String>,
    crlf: bool,
    final_newline: bool,
}

impl TextFile {
    fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
            crlf: content.contains("\r\n"),
            final_newline: content.is_empty() || content.ends_with('\n'),
        }
    }

    fn render(&self, lines: &[String]) -> String {
        if lines.is_empty() {
            return String::new();
        }
        let eol = if self.crlf { "\r\n" } else { "\n" };
        let mut out = lines.join(eol);
        if self.final_newline {
            out.push_str(eol);
        }
        out
    }
}

fn write_atomic(path: &Path, data: &[u8], like: Option<&fs::Permissions>) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    match like {
        Some(perms) => fs::set_permissions(tmp.path(), perms.clone())?,
        None => set_default_permissions(tmp.path())?,
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn set_default_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        format!("cannot recreate symbolic link {}", link.display()),
    ))
}

/// Remove a file or link; a missing entry is not an error.
fn remove_entry(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Whether anything (including a dangling link) sits at `path`.
fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Join `rel` onto `root`, refusing anything that lands outside it.
fn resolve(root: &Path, rel: &str) -> Result<PathBuf, ApplyErrorKind> {
    let rel_path = Path::new(rel);
    let escapes = rel.is_empty()
        || rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ApplyErrorKind::OutsideRoot);
    }

    let path = root.join(rel_path);
    let canon_root = root.canonicalize().map_err(io_kind)?;
    // Missing directories cannot be links, so the nearest existing ancestor
    // decides where the file really lands.
    let mut ancestor = path.parent();
    while let Some(dir) = ancestor {
        if entry_exists(dir) {
            let real = dir.canonicalize().map_err(|_| ApplyErrorKind::OutsideRoot)?;
            if !real.starts_with(&canon_root) {
                return Err(ApplyErrorKind::OutsideRoot);
            }
            // Symlinked directories inside the tree are refused too.
            let lexical = match dir.strip_prefix(root) {
                Ok(rest) => canon_root.join(rest),
                Err(_) => canon_root.clone(),
            };
            if real != lexical {
                return Err(ApplyErrorKind::Symlink);
            }
            break;
        }
        ancestor = dir.parent();
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

fn io_kind(e: std::io::Error) -> ApplyErrorKind {
    ApplyErrorKind::Io {
        message: e.to_string(),
    }
}

fn read_text(path: &Path) -> Result<(String, fs::Permissions), ApplyErrorKind> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ApplyErrorKind::MissingFile),
        Err(e) => return Err(io_kind(e)),
    };
    let perms = fs::metadata(path).map_err(io_kind)?.permissions();
    let text = String::from_utf8(bytes).map_err(|_| ApplyErrorKind::NotUtf8)?;
    Ok((text, perms))
}

/// Splice every hunk of `change` into `file`, in order.
fn splice(change: &FileChange, file: &TextFile) -> Result<Vec<String>, ApplyErrorKind> {
    let src = &file.lines;
    let mut out = Vec::with_capacity(src.len());
    let mut cursor = 0usize;

    for (idx, hunk) in change.hunks.iter().enumerate() {
        let old: Vec<&str> = hunk.old_lines().collect();
        // A pure insertion goes after `old_start`; anything else starts at it.
        let pos = if old.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };

        if pos < cursor || pos > src.len() {
            return Err(ApplyErrorKind::HunkMismatch {
                hunk: idx,
                line: hunk.old_start,
                expected: old.first().copied().unwrap_or_default().to_string(),
                actual: src.get(pos).cloned(),
            });
        }

        for (k, expected) in old.iter().enumerate() {
            let actual = src.get(pos + k);
            if actual.map(String::as_str) != Some(*expected) {
                return Err(ApplyErrorKind::HunkMismatch {
                    hunk: idx,
                    line: pos + k + 1,
                    expected: expected.to_string(),
                    actual: actual.cloned(),
                });
            }
        }

        out.extend_from_slice(&src[cursor..pos]);
        out.extend(hunk.new_lines().map(str::to_string));
        cursor = pos + old.len();
    }

    out.extend_from_slice(&src[cursor..]);
    Ok(out)
}

fn apply_one(
    change: &FileChange,
    root: &Path,
    journal: &mut Journal,
    report: &mut ApplyReport,
) -> Result<(), ApplyErrorKind> {
    let mut targets = Vec::with_capacity(2);
    for rel in change.touched_paths() {
        let abs = resolve(root, rel)?;
        journal.capture(abs.clone()).map_err(io_kind)?;
        targets.push((rel, abs));
    }

    match change.kind {
        ChangeKind::Create => {
            let rel = change.new_path.as_deref().ok_or(ApplyErrorKind::MissingFile)?;
            let path = resolve(root, rel)?;
            if entry_exists(&path) {
                return Err(ApplyErrorKind::AlreadyExists);
            }
            journal.ensure_parent(&path).map_err(io_kind)?;
            write_atomic(&path, change.created_content().as_bytes(), None).map_err(io_kind)?;
            report.created.push(rel.to_string());
        }
        ChangeKind::Delete => {
            let rel = change.old_path.as_deref().ok_or(ApplyErrorKind::MissingFile)?;
            let path = resolve(root, rel)?;
            let (text, _) = read_text(&path)?;
            if !change.hunks.is_empty() {
                let file = TextFile::parse(&text);
                let remaining = splice(change, &file)?;
                if let Some(left) = remaining.first() {
                    return Err(ApplyErrorKind::HunkMismatch {
                        hunk: change.hunks.len().saturating_sub(1),
                        line: file.lines.len().saturating_sub(remaining.len()) + 1,
                        expected: String::new(),
                        actual: Some(left.clone()),
                    });
                }
            }
            fs::remove_file(&path).map_err(io_kind)?;
            report.deleted.push(rel.to_string());
        }
        ChangeKind::Modify => {
            let old_rel = change.old_path.as_deref().unwrap_or(change.path());
            let new_rel = change.path();
            let old_abs = resolve(root, old_rel)?;
            let new_abs = resolve(root, new_rel)?;
            let renamed = old_abs != new_abs;
            if is_symlink(&old_abs) {
                return Err(ApplyErrorKind::Symlink);
            }

            let (text, perms) = read_text(&old_abs)?;
            if renamed && entry_exists(&new_abs) {
                return Err(ApplyErrorKind::AlreadyExists);
            }
            let file = TextFile::parse(&text);
            let lines = splice(change, &file)?;

            if renamed {
                journal.ensure_parent(&new_abs).map_err(io_kind)?;
            }
            write_atomic(&new_abs, file.render(&lines).as_bytes(), Some(&perms))
                .map_err(io_kind)?;
            if renamed {
                fs::remove_file(&old_abs).map_err(io_kind)?;
            }
            report.modified.push(new_rel.to_string());
        }
    }

    report.hunks_applied += change.hunks.len();
    debug!(path = %change.path(), targets = targets.len(), "file change applied");
    Ok(())
}

/// Apply `patch` to the tree at `root`, or leave the tree untouched.
pub fn apply_patch(patch: &Patch, root: &Path) -> Result<ApplyReport, ApplyError> {
    let mut journal = Journal::default();
    let mut report = ApplyReport::default();

    for (index, change) in patch.files.iter().enumerate() {
        if let Err(kind) = apply_one(change, root, &mut journal, &mut report) {
            warn!(index, path = %change.path(), error = %kind, "apply failed; restoring tree");
            journal.restore();
            return Err(ApplyError {
                index,
                path: change.path().to_string(),
                kind,
            });
        }
    }

    debug!(
        files = report.files_changed(),
        hunks = report.hunks_applied,
        "patch applied"
    );
    Ok(report)
}
