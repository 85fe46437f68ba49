//! Patch repair: restore hunk invariants before application.
//!
//! Generators routinely miscount hunk lines or drift the start offset. The
//! [`Repairer`] recounts every hunk, re-anchors hunks whose old side does not
//! match the current file, and drops hunks it cannot place. It only reads
//! the tree, never fails, and is idempotent.

pub mod anchor;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::patch::{ChangeKind, FileChange, Hunk, Patch};

// ---------------------------------------------------------------------------
// Source access
// ---------------------------------------------------------------------------

/// Read-only view of current file contents, one entry per line.
pub trait SourceView {
    /// Lines of `path` without terminators, or `None` when unreadable.
    fn lines(&self, path: &str) -> Option<Vec<String>>;
}

/// [`SourceView`] over a directory on disk.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SourceView for DirSource {
    fn lines(&self, path: &str) -> Option<Vec<String>> {
        let content = std::fs::read_to_string(self.root.join(path)).ok()?;
        Some(content.lines().map(str::to_string).collect())
    }
}

/// In-memory [`SourceView`], mainly for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(
            path.to_string(),
            content.lines().map(str::to_string).collect(),
        );
        self
    }
}

impl SourceView for MemorySource {
    fn lines(&self, path: &str) -> Option<Vec<String>> {
        self.files.get(path).cloned()
    }
}

/// A view with no files; repair then only recounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSource;

impl SourceView for NoSource {
    fn lines(&self, _path: &str) -> Option<Vec<String>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Minimum LCS similarity for re-anchoring a hunk (`0.0..=1.0`).
    pub min_similarity: f64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.6,
        }
    }
}

/// One correction applied to one hunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairAction {
    /// Declared counts rewritten to the body's real counts.
    Recounted {
        path: String,
        hunk: usize,
        declared: (usize, usize),
        actual: (usize, usize),
    },
    /// Start offset moved to where the old side was found.
    Relocated {
        path: String,
        hunk: usize,
        from: usize,
        to: usize,
        score: f64,
    },
    /// Hunk body rebuilt from the file's real lines at the anchor.
    Reconstructed { path: String, hunk: usize },
}

/// A hunk excluded from the repaired patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedHunk {
    pub path: String,
    pub hunk: usize,
    pub reason: String,
    pub best_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub patch: Patch,
    pub actions: Vec<RepairAction>,
    pub dropped: Vec<DroppedHunk>,
}

impl RepairOutcome {
    /// True when at least one hunk could not be placed.
    pub fn is_partial(&self) -> bool {
        !self.dropped.is_empty()
    }

    /// True when the output differs from the input in any way.
    pub fn changed(&self) -> bool {
        !self.actions.is_empty() || !self.dropped.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

fn expected_new_start(old_start: usize, old_count: usize, new_count: usize, delta: isize) -> usize {
    let base = old_start as isize + delta;
    let v = if old_count == 0 {
        base + 1
    } else if new_count == 0 {
        base - 1
    } else {
        base
    };
    v.max(0) as usize
}

fn recount(hunk: &mut Hunk) -> Option<((usize, usize), (usize, usize))> {
    if hunk.counts_consistent() {
        return None;
    }
    let declared = (hunk.old_count, hunk.new_count);
    hunk.old_count = hunk.actual_old_count();
    hunk.new_count = hunk.actual_new_count();
    Some((declared, (hunk.old_count, hunk.new_count)))
}

/// Normalizing transform over patches.
#[derive(Debug, Clone, Default)]
pub struct Repairer {
    config: RepairConfig,
}

impl Repairer {
    pub fn new(config: RepairConfig) -> Self {
        Self { config }
    }

    /// Repair every file change in `patch` against `source`.
    pub fn repair(&self, patch: &Patch, source: &dyn SourceView) -> RepairOutcome {
        let mut actions = Vec::new();
        let mut dropped = Vec::new();
        let mut files = Vec::with_capacity(patch.files.len());

        for change in &patch.files {
            let repaired = match change.kind {
                ChangeKind::Delete => change.clone(),
                ChangeKind::Create => self.repair_create(change, &mut actions),
                ChangeKind::Modify => {
                    self.repair_modify(change, source, &mut actions, &mut dropped)
                }
            };
            if !change.hunks.is_empty() && repaired.hunks.is_empty() {
                debug!(path = %change.path(), "every hunk dropped; file removed from patch");
                continue;
            }
            files.push(repaired);
        }

        RepairOutcome {
            patch: Patch { files },
            actions,
            dropped,
        }
    }

    fn repair_create(&self, change: &FileChange, actions: &mut Vec<RepairAction>) -> FileChange {
        let mut out = change.clone();
        for (idx, hunk) in out.hunks.iter_mut().enumerate() {
            if let Some((declared, actual)) = recount(hunk) {
                actions.push(RepairAction::Recounted {
                    path: change.path().to_string(),
                    hunk: idx,
                    declared,
                    actual,
                });
            }
        }
        out
    }

    fn repair_modify(
        &self,
        change: &FileChange,
        source: &dyn SourceView,
        actions: &mut Vec<RepairAction>,
        dropped: &mut Vec<DroppedHunk>,
    ) -> FileChange {
        let path = change.path().to_string();
        let read_path = change.old_path.as_deref().unwrap_or(&path);
        let file_lines = source.lines(read_path);

        let mut hunks: Vec<(Hunk, bool)> = Vec::with_capacity(change.hunks.len());

        for (idx, original) in change.hunks.iter().enumerate() {
            let mut hunk = original.clone();
            let mut modified = false;

            if let Some((declared, actual)) = recount(&mut hunk) {
                actions.push(RepairAction::Recounted {
                    path: path.clone(),
                    hunk: idx,
                    declared,
                    actual,
                });
                modified = true;
            }

            if let Some(lines) = &file_lines {
                match self.place(&mut hunk, lines) {
                    Placement::InPlace => {}
                    Placement::Moved { from, to, score, rebuilt } => {
                        actions.push(RepairAction::Relocated {
                            path: path.clone(),
                            hunk: idx,
                            from,
                            to,
                            score,
                        });
                        if rebuilt {
                            actions.push(RepairAction::Reconstructed {
                                path: path.clone(),
                                hunk: idx,
                            });
                        }
                        modified = true;
                    }
                    Placement::Unplaceable { best_score } => {
                        dropped.push(DroppedHunk {
                            path: path.clone(),
                            hunk: idx,
                            reason: format!(
                                "old side of hunk @@ -{},{} @@ not found in {}",
                                original.old_start, original.old_count, read_path
                            ),
                            best_score,
                        });
                        continue;
                    }
                }
            }

            hunks.push((hunk, modified));
        }

        hunks.sort_by_key(|(h, _)| h.old_start);

        let mut delta: isize = 0;
        for (hunk, modified) in hunks.iter_mut() {
            if *modified {
                hunk.new_start =
                    expected_new_start(hunk.old_start, hunk.old_count, hunk.new_count, delta);
            }
            delta += hunk.new_count as isize - hunk.old_count as isize;
        }

        FileChange {
            old_path: change.old_path.clone(),
            new_path: change.new_path.clone(),
            kind: change.kind,
            hunks: hunks.into_iter().map(|(h, _)| h).collect(),
        }
    }

    fn place(&self, hunk: &mut Hunk, lines: &[String]) -> Placement {
        let needle: Vec<&str> = hunk.old_lines().collect();

        if needle.is_empty() {
            if hunk.old_start <= lines.len() {
                return Placement::InPlace;
            }
            let from = hunk.old_start;
            hunk.old_start = lines.len();
            return Placement::Moved {
                from,
                to: hunk.old_start,
                score: 1.0,
                rebuilt: false,
            };
        }

        let hint = hunk.old_start.saturating_sub(1);
        if hunk.old_start >= 1 && anchor::matches_at(lines, &needle, hint) {
            return Placement::InPlace;
        }

        match anchor::locate(lines, &needle, hint) {
            Some(a) if a.exact => {
                let from = hunk.old_start;
                hunk.old_start = a.start + 1;
                Placement::Moved {
                    from,
                    to: hunk.old_start,
                    score: a.score,
                    rebuilt: false,
                }
            }
            Some(a) if a.score >= self.config.min_similarity => {
                let from = hunk.old_start;
                hunk.lines = anchor::reconstruct(&hunk.lines, &lines[a.start..a.start + a.len]);
                hunk.old_count = hunk.actual_old_count();
                hunk.new_count = hunk.actual_new_count();
                hunk.old_start = a.start + 1;
                Placement::Moved {
                    from,
                    to: hunk.old_start,
                    score: a.score,
                    rebuilt: true,
                }
            }
            other => Placement::Unplaceable {
                best_score: other.map(|a| a.score),
            },
        }
    }
}

enum Placement {
    InPlace,
    Moved {
        from: usize,
        to: usize,
        score: f64,
        rebuilt: bool,
    },
    Unplaceable {
        best_score: Option<f64>,
    },
}

/// Repair with the default configuration.
pub fn repair(patch: &Patch, source: &dyn SourceView) -> RepairOutcome {
    Repairer::default().repair(patch, source)
}
