//! Locating a hunk's old-side lines inside the current file.
//!
//! Exact contiguous matches win; otherwise every window of the same length
//! is scored by longest-common-subsequence similarity over whitespace-trimmed
//! lines, and the LCS alignment is used to rebuild the hunk against the
//! file's real text.
//!
//! The fuzzy pass is bounded: it only scans windows within [`FUZZY_RADIUS`]
//! lines of the hint and gives up on needles longer than
//! [`FUZZY_MAX_NEEDLE`].

use crate::patch::HunkLine;

/// Where a hunk's old side was found and how well it matched.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    /// 0-based index of the first matched file line.
    pub start: usize,
    /// Matched window length in file lines.
    pub len: usize,
    /// LCS similarity in `0.0..=1.0`; `1.0` with `exact` means byte-equal.
    pub score: f64,
    pub exact: bool,
}

/// Fuzzy windows start at most this many lines from the hint.
pub const FUZZY_RADIUS: usize = 500;

/// Longest old side (in lines) that is scored fuzzily.
pub const FUZZY_MAX_NEEDLE: usize = 120;

fn norm(s: &str) -> &str {
    s.trim()
}

/// Does `needle` occur verbatim in `file` at `start`?
pub fn matches_at(file: &[String], needle: &[&str], start: usize) -> bool {
    start + needle.len() <= file.len()
        && needle
            .iter()
            .zip(&file[start..start + needle.len()])
            .all(|(n, f)| *n == f.as_str())
}

/// LCS length table between `a` and `b` (normalized comparison).
fn lcs_table(a: &[&str], b: &[String]) -> Vec<Vec<usize>> {
    let mut t = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            t[i][j] = if norm(a[i]) == norm(&b[j]) {
                t[i + 1][j + 1] + 1
            } else {
                t[i + 1][j].max(t[i][j + 1])
            };
        }
    }
    t
}

fn lcs_len(a: &[&str], b: &[String]) -> usize {
    lcs_table(a, b)[0][0]
}

/// Find the best location for `needle` in `file`, preferring positions close
/// to `hint` (0-based) on ties.
pub fn locate(file: &[String], needle: &[&str], hint: usize) -> Option<Anchor> {
    if needle.is_empty() || file.is_empty() {
        return None;
    }

    let distance = |pos: usize| pos.abs_diff(hint);

    let exact = (0..file.len())
        .filter(|&pos| matches_at(file, needle, pos))
        .min_by_key(|&pos| distance(pos));
    if let Some(start) = exact {
        return Some(Anchor {
            start,
            len: needle.len(),
            score: 1.0,
            exact: true,
        });
    }

    if needle.len() > FUZZY_MAX_NEEDLE {
        return None;
    }

    let len = needle.len().min(file.len());
    let last = file.len() - len;
    let centre = hint.min(last);
    let mut best: Option<(usize, usize)> = None;
    for pos in centre.saturating_sub(FUZZY_RADIUS)..=(centre + FUZZY_RADIUS).min(last) {
        let common = lcs_len(needle, &file[pos..pos + len]);
        let better = match best {
            None => true,
            Some((best_pos, best_common)) => {
                common > best_common || (common == best_common && distance(pos) < distance(best_pos))
            }
        };
        if better {
            best = Some((pos, common));
        }
    }

    best.map(|(start, common)| Anchor {
        start,
        len,
        score: common as f64 / needle.len() as f64,
        exact: false,
    })
}

/// Rebuild hunk lines so that the old side equals `window` exactly.
///
/// Aligned old-side lines take the file's text; file lines the hunk did not
/// mention become context; old-side lines with no counterpart are dropped.
/// Added lines keep their position relative to the old-side line they
/// followed.
pub fn reconstruct(lines: &[HunkLine], window: &[String]) -> Vec<HunkLine> {
    let old: Vec<&str> = lines
        .iter()
        .filter(|l| l.is_old_side())
        .map(HunkLine::text)
        .collect();

    // added_after[k] = added lines that follow the k-th old-side line
    // (index 0 holds those before any old-side line).
    let mut added_after: Vec<Vec<String>> = vec![Vec::new(); old.len() + 1];
    let mut tags: Vec<bool> = Vec::with_capacity(old.len());
    let mut seen = 0usize;
    for line in lines {
        match line {
            HunkLine::Added(s) => added_after[seen].push(s.clone()),
            HunkLine::Removed(_) => {
                tags.push(true);
                seen += 1;
            }
            HunkLine::Context(_) => {
                tags.push(false);
                seen += 1;
            }
        }
    }

    let table = lcs_table(&old, window);
    let mut out = Vec::with_capacity(lines.len() + window.len());
    out.extend(added_after[0].iter().cloned().map(HunkLine::Added));

    let (mut i, mut j) = (0usize, 0usize);
    while i < old.len() || j < window.len() {
        if i < old.len() && j < window.len() && norm(old[i]) == norm(&window[j]) {
            let text = window[j].clone();
            out.push(if tags[i] {
                HunkLine::Removed(text)
            } else {
                HunkLine::Context(text)
            });
            i += 1;
            j += 1;
            out.extend(added_after[i].iter().cloned().map(HunkLine::Added));
        } else if j < window.len() && (i >= old.len() || table[i][j + 1] >= table[i + 1][j]) {
            out.push(HunkLine::Context(window[j].clone()));
            j += 1;
        } else {
            i += 1;
            out.extend(added_after[i].iter().cloned().map(HunkLine::Added));
        }
    }

    out
}
