//! Unified diff tokenizer.
//!
//! Accepts plain `diff -u` output and `git diff` output:
//!
//! ```text
//! diff --git a/src/foo.rs b/src/foo.rs
//! --- a/src/foo.rs
//! +++ b/src/foo.rs
//! @@ -10,7 +10,8 @@ fn foo()
//!  context line
//! -removed line
//! +added line
//! ```
//!
//! Hunk bodies run until the next header or end of input. Declared counts are
//! stored exactly as written, so a miscounted hunk parses fine and is left for
//! the repair engine.

use std::sync::OnceLock;

use regex::Regex;

use super::model::{ChangeKind, FileChange, Hunk, HunkLine, Patch};
use super::PatchError;

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@ ?(.*)$")
            .expect("hunk header regex is valid")
    })
}

#[derive(Debug)]
struct FileBuilder {
    old_path: Option<String>,
    new_path: Option<String>,
    kind: ChangeKind,
    saw_file_lines: bool,
    hunks: Vec<Hunk>,
}

impl FileBuilder {
    fn new(old_path: Option<String>, new_path: Option<String>) -> Self {
        Self {
            old_path,
            new_path,
            kind: ChangeKind::Modify,
            saw_file_lines: false,
            hunks: Vec::new(),
        }
    }

    fn finish(self) -> FileChange {
        FileChange {
            old_path: self.old_path,
            new_path: self.new_path,
            kind: self.kind,
            hunks: self.hunks,
        }
    }
}

/// Hunk under construction plus the raw blank lines seen since its last
/// tagged line. Blanks only become context once another body line follows.
#[derive(Debug)]
struct HunkBuilder {
    hunk: Hunk,
    pending_blanks: usize,
}

impl HunkBuilder {
    fn push(&mut self, line: HunkLine) {
        for _ in 0..self.pending_blanks {
            self.hunk.lines.push(HunkLine::Context(String::new()));
        }
        self.pending_blanks = 0;
        self.hunk.lines.push(line);
    }
}

/// Strip `a/` / `b/` prefixes and trailing timestamps from a `---`/`+++` path.
fn clean_path(raw: &str, prefix: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

/// Split `a/old b/new` from a `diff --git` header.
fn parse_git_header(rest: &str) -> (Option<String>, Option<String>) {
    if let Some(stripped) = rest.strip_prefix("a/") {
        if let Some(idx) = stripped.find(" b/") {
            return (
                Some(stripped[..idx].to_string()),
                Some(stripped[idx + 3..].to_string()),
            );
        }
    }
    let mut parts = rest.split_whitespace();
    let old = parts.next().map(|p| p.trim_start_matches("a/").to_string());
    let new = parts.next().map(|p| p.trim_start_matches("b/").to_string());
    (old, new)
}

fn parse_hunk_header(line: &str, line_no: usize) -> Result<Hunk, PatchError> {
    let caps = hunk_header_re()
        .captures(line)
        .ok_or_else(|| PatchError::Malformed {
            line: line_no,
            reason: format!("unparsable hunk header: {line}"),
        })?;

    let num = |idx: usize, default: usize| -> Result<usize, PatchError> {
        match caps.get(idx) {
            Some(m) => m.as_str().parse().map_err(|_| PatchError::Malformed {
                line: line_no,
                reason: format!("hunk header number out of range: {}", m.as_str()),
            }),
            None => Ok(default),
        }
    };

    let section = caps
        .get(5)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Hunk {
        old_start: num(1, 0)?,
        old_count: num(2, 1)?,
        new_start: num(3, 0)?,
        new_count: num(4, 1)?,
        section,
        lines: Vec::new(),
    })
}

/// Parse raw patch text into a [`Patch`].
///
/// Empty or whitespace-only input yields an empty patch. Text that never
/// reaches a file header is rejected as malformed.
pub fn parse_patch(text: &str) -> Result<Patch, PatchError> {
    if text.trim().is_empty() {
        return Ok(Patch::default());
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut files: Vec<FileChange> = Vec::new();
    let mut file: Option<FileBuilder> = None;
    let mut hunk: Option<HunkBuilder> = None;

    let flush_hunk = |file: &mut Option<FileBuilder>, hunk: &mut Option<HunkBuilder>| {
        if let (Some(f), Some(h)) = (file.as_mut(), hunk.take()) {
            f.hunks.push(h.hunk);
        }
    };

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let line_no = i + 1;

        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush_hunk(&mut file, &mut hunk);
            if let Some(done) = file.take() {
                files.push(done.finish());
            }
            let (old, new) = parse_git_header(rest);
            file = Some(FileBuilder::new(old, new));
            i += 1;
            continue;
        }

        let next_is_plus = lines
            .get(i + 1)
            .is_some_and(|next| next.starts_with("+++ "));
        if line.starts_with("--- ") && next_is_plus {
            flush_hunk(&mut file, &mut hunk);
            let reuse = file
                .as_ref()
                .is_some_and(|f| !f.saw_file_lines && f.hunks.is_empty());
            if !reuse {
                if let Some(done) = file.take() {
                    files.push(done.finish());
                }
                file = Some(FileBuilder::new(None, None));
            }
            let old = clean_path(&line[4..], "a/");
            let new = clean_path(&lines[i + 1][4..], "b/");
            if let Some(f) = file.as_mut() {
                f.saw_file_lines = true;
                f.kind = match (&old, &new) {
                    (None, _) => ChangeKind::Create,
                    (_, None) => ChangeKind::Delete,
                    _ => f.kind,
                };
                f.old_path = old;
                f.new_path = new;
            }
            i += 2;
            continue;
        }

        if line.starts_with("@@") {
            if file.is_none() {
                return Err(PatchError::Malformed {
                    line: line_no,
                    reason: "hunk header before any file header".to_string(),
                });
            }
            flush_hunk(&mut file, &mut hunk);
            hunk = Some(HunkBuilder {
                hunk: parse_hunk_header(line, line_no)?,
                pending_blanks: 0,
            });
            i += 1;
            continue;
        }

        if let Some(h) = hunk.as_mut() {
            match line.chars().next() {
                None => h.pending_blanks += 1,
                Some(' ') => h.push(HunkLine::Context(line[1..].to_string())),
                Some('+') => h.push(HunkLine::Added(line[1..].to_string())),
                Some('-') => h.push(HunkLine::Removed(line[1..].to_string())),
                Some('\\') => {}
                Some(_) => {
                    return Err(PatchError::Malformed {
                        line: line_no,
                        reason: format!("unexpected line inside hunk: {line}"),
                    })
                }
            }
            i += 1;
            continue;
        }

        if let Some(f) = file.as_mut() {
            if line.starts_with("new file mode") {
                f.kind = ChangeKind::Create;
                f.old_path = None;
            } else if line.starts_with("deleted file mode") {
                f.kind = ChangeKind::Delete;
                f.new_path = None;
            } else if let Some(from) = line.strip_prefix("rename from ") {
                f.old_path = Some(from.trim().to_string());
            } else if let Some(to) = line.strip_prefix("rename to ") {
                f.new_path = Some(to.trim().to_string());
            }
            // index, mode and similarity lines carry nothing we apply.
        }
        i += 1;
    }

    flush_hunk(&mut file, &mut hunk);
    if let Some(done) = file.take() {
        files.push(done.finish());
    }

    if files.is_empty() {
        return Err(PatchError::Malformed {
            line: 1,
            reason: "no file headers found".to_string(),
        });
    }

    Ok(Patch { files })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_hunk() {
        let text = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,3 @@\n context\n-old\n+new\n context\n";
        let patch = parse_patch(text).unwrap();
        assert_eq!(patch.files.len(), 1);
        let file = &patch.files[0];
        assert_eq!(file.kind, ChangeKind::Modify);
        assert_eq!(file.path(), "src/lib.rs");
        assert_eq!(file.hunks.len(), 1);
        assert_eq!(
            file.hunks[0].lines,
            vec![
                HunkLine::Context("context".to_string()),
                HunkLine::Removed("old".to_string()),
                HunkLine::Added("new".to_string()),
                HunkLine::Context("context".to_string()),
            ]
        );
    }

    #[test]
    fn test_declared_counts_kept_verbatim() {
        let text = "--- a/f.py\n+++ b/f.py\n@@ -23,7 +23,7 @@\n a\n-b\n+c\n d\n";
        let patch = parse_patch(text).unwrap();
        let hunk = &patch.files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (23, 7));
        assert_eq!((hunk.new_start, hunk.new_count), (23, 7));
        assert_eq!(hunk.lines.len(), 4);
        assert!(!hunk.counts_consistent());
    }

    #[test]
    fn test_omitted_counts_default_to_one() {
        let text = "--- a/x\n+++ b/x\n@@ -5 +5 @@ fn x()\n-a\n+b\n";
        let hunk = &parse_patch(text).unwrap().files[0].hunks[0];
        assert_eq!(hunk.old_count, 1);
        assert_eq!(hunk.new_count, 1);
        assert_eq!(hunk.section.as_deref(), Some("fn x()"));
    }

    #[test]
    fn test_multi_file_order_preserved() {
        let text = "\
diff --git a/b.rs b/b.rs
--- a/b.rs
+++ b/b.rs
@@ -1 +1 @@
-x
+y
diff --git a/a.rs b/a.rs
--- a/a.rs
+++ b/a.rs
@@ -1 +1 @@
-p
+q
";
        let patch = parse_patch(text).unwrap();
        let paths: Vec<_> = patch.files.iter().map(|f| f.path()).collect();
        assert_eq!(paths, vec!["b.rs", "a.rs"]);
    }

    #[test]
    fn test_create_and_delete_kinds() {
        let text = "\
diff --git a/new.txt b/new.txt
new file mode 100644
index 0000000..e69de29
--- /dev/null
+++ b/new.txt
@@ -0,0 +1,2 @@
+hello
+world
diff --git a/old.txt b/old.txt
deleted file mode 100644
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";
        let patch = parse_patch(text).unwrap();
        assert_eq!(patch.files[0].kind, ChangeKind::Create);
        assert_eq!(patch.files[0].old_path, None);
        assert_eq!(patch.files[0].path(), "new.txt");
        assert_eq!(patch.files[1].kind, ChangeKind::Delete);
        assert_eq!(patch.files[1].new_path, None);
        assert_eq!(patch.files[1].path(), "old.txt");
    }

    #[test]
    fn test_empty_input_is_empty_patch() {
        assert!(parse_patch("").unwrap().is_empty());
        assert!(parse_patch("  \n\n").unwrap().is_empty());
    }

    #[test]
    fn test_header_only_patch_is_not_empty() {
        let text = "diff --git a/x.rs b/y.rs\nsimilarity index 100%\nrename from x.rs\nrename to y.rs\n";
        let patch = parse_patch(text).unwrap();
        assert!(!patch.is_empty());
        assert_eq!(patch.hunk_count(), 0);
        assert_eq!(patch.files[0].old_path.as_deref(), Some("x.rs"));
        assert_eq!(patch.files[0].new_path.as_deref(), Some("y.rs"));
    }

    #[test]
    fn test_prose_without_headers_is_malformed() {
        let err = parse_patch("I could not find a fix for this test.").unwrap_err();
        assert!(matches!(err, PatchError::Malformed { .. }));
    }

    #[test]
    fn test_hunk_before_file_header_is_malformed() {
        let err = parse_patch("@@ -1 +1 @@\n-a\n+b\n").unwrap_err();
        match err {
            PatchError::Malformed { line, reason } => {
                assert_eq!(line, 1);
                assert!(reason.contains("before any file header"));
            }
        }
    }

    #[test]
    fn test_bad_hunk_header_is_malformed() {
        let err = parse_patch("--- a/x\n+++ b/x\n@@ -a,b +c,d @@\n-a\n").unwrap_err();
        match err {
            PatchError::Malformed { line, .. } => assert_eq!(line, 3),
        }
    }

    #[test]
    fn test_blank_lines_inside_hunk_are_context_but_trailing_dropped() {
        let text = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n\n-b\n+c\n\n\n";
        let hunk = &parse_patch(text).unwrap().files[0].hunks[0];
        assert_eq!(
            hunk.lines,
            vec![
                HunkLine::Context("a".to_string()),
                HunkLine::Context(String::new()),
                HunkLine::Removed("b".to_string()),
                HunkLine::Added("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_removed_line_resembling_header_stays_in_hunk() {
        let text = "--- a/x.md\n+++ b/x.md\n@@ -1,2 +1,1 @@\n--- heading\n keep\n";
        let hunk = &parse_patch(text).unwrap().files[0].hunks[0];
        assert_eq!(hunk.lines[0], HunkLine::Removed("-- heading".to_string()));
    }

    #[test]
    fn test_no_newline_marker_ignored_and_timestamps_stripped() {
        let text = "--- a/x\t2024-01-01 00:00:00\n+++ b/x\t2024-01-01 00:00:01\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n";
        let patch = parse_patch(text).unwrap();
        assert_eq!(patch.files[0].path(), "x");
        assert_eq!(patch.files[0].hunks[0].lines.len(), 2);
    }

    #[test]
    fn test_display_roundtrips_through_parser() {
        let text = "diff --git a/src/a.rs b/src/a.rs\n--- a/src/a.rs\n+++ b/src/a.rs\n@@ -2,3 +2,3 @@ impl A\n x\n-y\n+z\n w\n";
        let patch = parse_patch(text).unwrap();
        assert_eq!(patch.to_string(), text);
        assert_eq!(parse_patch(&patch.to_string()).unwrap(), patch);
    }
}
