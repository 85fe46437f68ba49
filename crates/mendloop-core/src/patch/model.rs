//! Structured representation of a multi-file unified diff.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single tagged line inside a hunk body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "text", rename_all = "snake_case")]
pub enum HunkLine {
    Context(String),
    Added(String),
    Removed(String),
}

impl HunkLine {
    pub fn text(&self) -> &str {
        match self {
            HunkLine::Context(s) | HunkLine::Added(s) | HunkLine::Removed(s) => s,
        }
    }

    /// Whether the line exists in the old file (context or removed).
    pub fn is_old_side(&self) -> bool {
        !matches!(self, HunkLine::Added(_))
    }

    /// Whether the line exists in the new file (context or added).
    pub fn is_new_side(&self) -> bool {
        !matches!(self, HunkLine::Removed(_))
    }

    fn prefix(&self) -> char {
        match self {
            HunkLine::Context(_) => ' ',
            HunkLine::Added(_) => '+',
            HunkLine::Removed(_) => '-',
        }
    }

    fn inverted(&self) -> Self {
        match self {
            HunkLine::Context(s) => HunkLine::Context(s.clone()),
            HunkLine::Added(s) => HunkLine::Removed(s.clone()),
            HunkLine::Removed(s) => HunkLine::Added(s.clone()),
        }
    }
}

/// A contiguous block of change against one file.
///
/// # Invariants
///
/// `old_count` must equal the number of context + removed lines and
/// `new_count` the number of context + added lines. The parser records the
/// declared values verbatim; [`crate::repair`] restores the invariant when a
/// generator got them wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    /// Free text after the closing `@@` (usually the enclosing function).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Context + removed lines actually present in the body.
    pub fn actual_old_count(&self) -> usize {
        self.lines.iter().filter(|l| l.is_old_side()).count()
    }

    /// Context + added lines actually present in the body.
    pub fn actual_new_count(&self) -> usize {
        self.lines.iter().filter(|l| l.is_new_side()).count()
    }

    /// Whether the declared header counts match the body.
    pub fn counts_consistent(&self) -> bool {
        self.old_count == self.actual_old_count() && self.new_count == self.actual_new_count()
    }

    pub fn added(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Added(_)))
            .count()
    }

    pub fn removed(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Removed(_)))
            .count()
    }

    /// The lines the hunk expects to find in the old file, in order.
    pub fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.is_old_side())
            .map(HunkLine::text)
    }

    /// The lines the hunk leaves in the new file, in order.
    pub fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.is_new_side())
            .map(HunkLine::text)
    }

    fn reversed(&self) -> Self {
        Self {
            old_start: self.new_start,
            old_count: self.new_count,
            new_start: self.old_start,
            new_count: self.old_count,
            section: self.section.clone(),
            lines: self.lines.iter().map(HunkLine::inverted).collect(),
        }
    }
}

/// How a file is affected by a [`FileChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Modify,
    Create,
    Delete,
}

/// All hunks that target one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path in the old tree (`None` for created files).
    pub old_path: Option<String>,
    /// Path in the new tree (`None` for deleted files).
    pub new_path: Option<String>,
    pub kind: ChangeKind,
    pub hunks: Vec<Hunk>,
}

impl FileChange {
    /// The path the change operates on in the working tree.
    pub fn path(&self) -> &str {
        match self.kind {
            ChangeKind::Delete => self.old_path.as_deref().unwrap_or_default(),
            _ => self
                .new_path
                .as_deref()
                .or(self.old_path.as_deref())
                .unwrap_or_default(),
        }
    }

    /// Every distinct path the change touches (both sides of a rename).
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths = Vec::with_capacity(2);
        for p in [self.old_path.as_deref(), self.new_path.as_deref()]
            .into_iter()
            .flatten()
        {
            if !paths.contains(&p) {
                paths.push(p);
            }
        }
        paths
    }

    pub fn added(&self) -> usize {
        self.hunks.iter().map(Hunk::added).sum()
    }

    pub fn removed(&self) -> usize {
        self.hunks.iter().map(Hunk::removed).sum()
    }

    /// Full content a `Create` change writes: every added line, newline-terminated.
    pub fn created_content(&self) -> String {
        let mut out = String::new();
        for line in self.hunks.iter().flat_map(|h| h.lines.iter()) {
            if let HunkLine::Added(text) = line {
                out.push_str(text);
                out.push('\n');
            }
        }
        out
    }

    fn reversed(&self) -> Self {
        let kind = match self.kind {
            ChangeKind::Create => ChangeKind::Delete,
            ChangeKind::Delete => ChangeKind::Create,
            ChangeKind::Modify => ChangeKind::Modify,
        };
        Self {
            old_path: self.new_path.clone(),
            new_path: self.old_path.clone(),
            kind,
            hunks: self.hunks.iter().map(Hunk::reversed).collect(),
        }
    }
}

/// An ordered, multi-file patch. File order is preserved from the input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub files: Vec<FileChange>,
}

impl Patch {
    /// True when the patch carries no file changes at all.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn hunk_count(&self) -> usize {
        self.files.iter().map(|f| f.hunks.len()).sum()
    }

    /// The exact inverse: applying `p` then `p.reversed()` restores the tree.
    pub fn reversed(&self) -> Self {
        Self {
            files: self.files.iter().map(FileChange::reversed).collect(),
        }
    }
}

fn fmt_range(start: usize, count: usize) -> String {
    if count == 1 {
        start.to_string()
    } else {
        format!("{start},{count}")
    }
}

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@@ -{} +{} @@",
            fmt_range(self.old_start, self.old_count),
            fmt_range(self.new_start, self.new_count)
        )?;
        if let Some(section) = &self.section {
            write!(f, " {section}")?;
        }
        writeln!(f)?;
        for line in &self.lines {
            writeln!(f, "{}{}", line.prefix(), line.text())?;
        }
        Ok(())
    }
}

impl fmt::Display for FileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let old = self
            .old_path
            .as_deref()
            .map(|p| format!("a/{p}"))
            .unwrap_or_else(|| "/dev/null".to_string());
        let new = self
            .new_path
            .as_deref()
            .map(|p| format!("b/{p}"))
            .unwrap_or_else(|| "/dev/null".to_string());
        let git_old = self.old_path.as_deref().unwrap_or_else(|| self.path());
        let git_new = self.new_path.as_deref().unwrap_or_else(|| self.path());
        writeln!(f, "diff --git a/{git_old} b/{git_new}")?;
        match self.kind {
            ChangeKind::Create => writeln!(f, "new file mode 100644")?,
            ChangeKind::Delete => writeln!(f, "deleted file mode 100644")?,
            ChangeKind::Modify => {}
        }
        writeln!(f, "--- {old}")?;
        writeln!(f, "+++ {new}")?;
        for hunk in &self.hunks {
            write!(f, "{hunk}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for file in &self.files {
            write!(f, "{file}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hunk() -> Hunk {
        Hunk {
            old_start: 3,
            old_count: 3,
            new_start: 3,
            new_count: 3,
            section: Some("fn main()".to_string()),
            lines: vec![
                HunkLine::Context("a".to_string()),
                HunkLine::Removed("b".to_string()),
                HunkLine::Added("B".to_string()),
                HunkLine::Context("c".to_string()),
            ],
        }
    }

    #[test]
    fn test_hunk_counts() {
        let hunk = sample_hunk();
        assert_eq!(hunk.actual_old_count(), 3);
        assert_eq!(hunk.actual_new_count(), 3);
        assert!(hunk.counts_consistent());
        assert_eq!(hunk.added(), 1);
        assert_eq!(hunk.removed(), 1);
        assert_eq!(hunk.old_lines().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(hunk.new_lines().collect::<Vec<_>>(), vec!["a", "B", "c"]);
    }

    #[test]
    fn test_hunk_display() {
        let rendered = sample_hunk().to_string();
        assert_eq!(rendered, "@@ -3,3 +3,3 @@ fn main()\n a\n-b\n+B\n c\n");
    }

    #[test]
    fn test_single_line_range_omits_count() {
        let hunk = Hunk {
            old_start: 1,
            old_count: 1,
            new_start: 1,
            new_count: 1,
            section: None,
            lines: vec![
                HunkLine::Removed("x".to_string()),
                HunkLine::Added("y".to_string()),
            ],
        };
        assert!(hunk.to_string().starts_with("@@ -1 +1 @@\n"));
    }

    #[test]
    fn test_reversed_swaps_sides() {
        let patch = Patch {
            files: vec![FileChange {
                old_path: None,
                new_path: Some("new.txt".to_string()),
                kind: ChangeKind::Create,
                hunks: vec![Hunk {
                    old_start: 0,
                    old_count: 0,
                    new_start: 1,
                    new_count: 1,
                    section: None,
                    lines: vec![HunkLine::Added("hello".to_string())],
                }],
            }],
        };
        let rev = patch.reversed();
        assert_eq!(rev.files[0].kind, ChangeKind::Delete);
        assert_eq!(rev.files[0].path(), "new.txt");
        assert_eq!(
            rev.files[0].hunks[0].lines,
            vec![HunkLine::Removed("hello".to_string())]
        );
        assert_eq!(rev.reversed(), patch);
    }

    #[test]
    fn test_created_content() {
        let change = FileChange {
            old_path: None,
            new_path: Some("n.txt".to_string()),
            kind: ChangeKind::Create,
            hunks: vec![Hunk {
                old_start: 0,
                old_count: 0,
                new_start: 1,
                new_count: 2,
                section: None,
                lines: vec![
                    HunkLine::Added("one".to_string()),
                    HunkLine::Added("two".to_string()),
                ],
            }],
        };
        assert_eq!(change.created_content(), "one\ntwo\n");
    }

    #[test]
    fn test_touched_paths_for_rename() {
        let change = FileChange {
            old_path: Some("a.rs".to_string()),
            new_path: Some("b.rs".to_string()),
            kind: ChangeKind::Modify,
            hunks: Vec::new(),
        };
        assert_eq!(change.touched_paths(), vec!["a.rs", "b.rs"]);
        assert_eq!(change.path(), "b.rs");
    }
}
