//! Static, pre-application safety checks for candidate patches.
//!
//! [`validate`] inspects a parsed [`Patch`] against a resolved
//! [`SafetyPolicy`] and returns every violation at once. It never touches the
//! filesystem, so it is safe to call before and after repair.

pub mod deny;

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::patch::{ChangeKind, HunkLine, Patch};

pub use deny::{DenyCategory, DenyList, DenyRule, DenyRuleError, PatternKind};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Serializable safety settings, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Ceiling on added + removed lines across the whole patch.
    pub max_changed_lines: usize,
    /// Ceiling on distinct files touched.
    pub max_files: usize,
    /// Also deny edits to test files.
    pub protect_tests: bool,
    /// Use the built-in deny rules in addition to `deny_rules`.
    pub use_default_rules: bool,
    /// Extra rules appended after the built-in ones.
    pub deny_rules: Vec<DenyRule>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_changed_lines: 200,
            max_files: 10,
            protect_tests: false,
            use_default_rules: true,
            deny_rules: Vec::new(),
        }
    }
}

/// A fully resolved policy: limits plus a compiled deny-list.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    pub max_changed_lines: usize,
    pub max_files: usize,
    pub deny: DenyList,
}

impl SafetyPolicy {
    /// Compile a [`SafetyConfig`] into a policy.
    pub fn from_config(config: &SafetyConfig) -> Result<Self, DenyRuleError> {
        let mut rules = Vec::new();
        if config.use_default_rules {
            rules.extend(deny::default_rules());
        }
        if config.protect_tests {
            rules.extend(deny::test_rules());
        }
        rules.extend(config.deny_rules.iter().cloned());

        Ok(Self {
            max_changed_lines: config.max_changed_lines,
            max_files: config.max_files,
            deny: DenyList::compile(&rules)?,
        })
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::from_config(&SafetyConfig::default()).expect("built-in deny rules compile")
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Per-file change counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub path: String,
    pub kind: ChangeKind,
    pub added: usize,
    pub removed: usize,
}

/// A touched path that matched the deny-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictedMatch {
    pub path: String,
    pub category: DenyCategory,
    pub pattern: String,
}

/// Derived facts about a patch. Recomputed on every [`validate`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchAnalysis {
    pub added: usize,
    pub removed: usize,
    /// `added + removed`; context lines never count.
    pub changed_lines: usize,
    pub files_touched: usize,
    pub files: Vec<FileStats>,
    pub restricted: Vec<RestrictedMatch>,
}

/// Compute a [`PatchAnalysis`] for `patch` under `deny`.
pub fn analyze(patch: &Patch, deny: &DenyList) -> PatchAnalysis {
    let mut touched: Vec<&str> = Vec::new();
    let mut files = Vec::with_capacity(patch.files.len());

    for change in &patch.files {
        files.push(FileStats {
            path: change.path().to_string(),
            kind: change.kind,
            added: change.added(),
            removed: change.removed(),
        });
        for p in change.touched_paths() {
            if !touched.contains(&p) {
                touched.push(p);
            }
        }
    }

    let restricted = touched
        .iter()
        .filter_map(|path| {
            deny.first_match(path).map(|rule| RestrictedMatch {
                path: path.to_string(),
                category: rule.category,
                pattern: rule.pattern.clone(),
            })
        })
        .collect();

    let added = files.iter().map(|f| f.added).sum();
    let removed = files.iter().map(|f| f.removed).sum();

    PatchAnalysis {
        added,
        removed,
        changed_lines: added + removed,
        files_touched: touched.len(),
        files,
        restricted,
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ExceedsLineLimit,
    ExceedsFileLimit,
    RestrictedPath,
    StructurallyInvalid,
}

/// A single policy violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Human-readable explanation.
    pub detail: String,
}

impl Violation {
    fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Outcome of validating one patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
    pub analysis: PatchAnalysis,
}

impl ValidationReport {
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    /// One-line summary of all violations.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.detail.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

fn path_problem(path: &str) -> Option<&'static str> {
    if path.trim().is_empty() {
        return Some("empty path");
    }
    let p = Path::new(path);
    if p.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Some("absolute path");
    }
    if p.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        )
    }) {
        return Some("path escapes the working tree");
    }
    None
}

fn structural_violations(patch: &Patch) -> Vec<Violation> {
    let mut out = Vec::new();

    for (idx, change) in patch.files.iter().enumerate() {
        let label = change.path();

        let paths: Vec<Option<&str>> = match change.kind {
            ChangeKind::Create => vec![change.new_path.as_deref()],
            ChangeKind::Delete => vec![change.old_path.as_deref()],
            ChangeKind::Modify => vec![change.old_path.as_deref(), change.new_path.as_deref()],
        };
        for path in paths {
            let problem = match path {
                Some(p) => path_problem(p),
                None => Some("missing path"),
            };
            if let Some(problem) = problem {
                out.push(Violation::new(
                    ViolationKind::StructurallyInvalid,
                    format!("file change #{idx} ({label:?}): {problem}"),
                ));
            }
        }

        for (h, hunk) in change.hunks.iter().enumerate() {
            if hunk.lines.is_empty() {
                out.push(Violation::new(
                    ViolationKind::StructurallyInvalid,
                    format!("{label}: hunk #{h} has no lines"),
                ));
            }
            let wrong_line = match change.kind {
                ChangeKind::Create => hunk
                    .lines
                    .iter()
                    .any(|l| !matches!(l, HunkLine::Added(_))),
                ChangeKind::Delete => hunk.lines.iter().any(|l| matches!(l, HunkLine::Added(_))),
                ChangeKind::Modify => false,
            };
            if wrong_line {
                out.push(Violation::new(
                    ViolationKind::StructurallyInvalid,
                    format!(
                        "{label}: hunk #{h} has lines that do not fit a {:?} change",
                        change.kind
                    ),
                ));
            }
        }
    }

    out
}

/// Validate `patch` against `policy`, evaluating every check.
pub fn validate(patch: &Patch, policy: &SafetyPolicy) -> ValidationReport {
    let analysis = analyze(patch, &policy.deny);
    let mut violations = Vec::new();

    if analysis.changed_lines > policy.max_changed_lines {
        violations.push(Violation::new(
            ViolationKind::ExceedsLineLimit,
            format!(
                "patch changes {} lines (limit {})",
                analysis.changed_lines, policy.max_changed_lines
            ),
        ));
    }

    if analysis.files_touched > policy.max_files {
        violations.push(Violation::new(
            ViolationKind::ExceedsFileLimit,
            format!(
                "patch touches {} files (limit {})",
                analysis.files_touched, policy.max_files
            ),
        ));
    }

    for m in &analysis.restricted {
        violations.push(Violation::new(
            ViolationKind::RestrictedPath,
            format!(
                "{} is a protected {} path (rule `{}`)",
                m.path, m.category, m.pattern
            ),
        ));
    }

    violations.extend(structural_violations(patch));

    ValidationReport {
        ok: violations.is_empty(),
        violations,
        analysis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parse_patch;

    fn modify(path: &str, removed: usize, added: usize, context: usize) -> String {
        let mut s = format!(
            "--- a/{path}\n+++ b/{path}\n@@ -1,{} +1,{} @@\n",
            removed + context,
            added + context
        );
        for i in 0..context {
            s.push_str(&format!(" ctx{i}\n"));
        }
        for i in 0..removed {
            s.push_str(&format!("-old{i}\n"));
        }
        for i in 0..added {
            s.push_str(&format!("+new{i}\n"));
        }
        s
    }

    #[test]
    fn test_small_patch_passes() {
        let patch = parse_patch(&modify("src/lib.rs", 2, 3, 4)).unwrap();
        let report = validate(&patch, &SafetyPolicy::default());
        assert!(report.ok, "{:?}", report.violations);
        assert_eq!(report.analysis.changed_lines, 5);
        assert_eq!(report.analysis.files_touched, 1);
    }

    #[test]
    fn test_context_lines_do_not_count() {
        let patch = parse_patch(&modify("src/lib.rs", 1, 1, 500)).unwrap();
        let policy = SafetyPolicy {
            max_changed_lines: 2,
            ..SafetyPolicy::default()
        };
        assert!(validate(&patch, &policy).ok);
    }

    #[test]
    fn test_line_limit_boundary() {
        let patch = parse_patch(&modify("src/lib.rs", 5, 5, 0)).unwrap();
        let at_limit = SafetyPolicy {
            max_changed_lines: 10,
            ..SafetyPolicy::default()
        };
        assert!(validate(&patch, &at_limit).ok);

        let below = SafetyPolicy {
            max_changed_lines: 9,
            ..SafetyPolicy::default()
        };
        let report = validate(&patch, &below);
        assert!(!report.ok);
        assert!(report.has(ViolationKind::ExceedsLineLimit));
    }

    #[test]
    fn test_file_limit() {
        let text: String = (0..4).map(|i| modify(&format!("src/m{i}.rs"), 1, 1, 0)).collect();
        let patch = parse_patch(&text).unwrap();
        let policy = SafetyPolicy {
            max_files: 3,
            ..SafetyPolicy::default()
        };
        let report = validate(&patch, &policy);
        assert!(report.has(ViolationKind::ExceedsFileLimit));
        assert_eq!(report.analysis.files_touched, 4);
    }

    #[test]
    fn test_all_checks_reported_together() {
        let text = format!(
            "{}{}",
            modify(".github/workflows/ci.yml", 30, 30, 0),
            modify("src/a.rs", 1, 1, 0)
        );
        let patch = parse_patch(&text).unwrap();
        let policy = SafetyPolicy {
            max_changed_lines: 10,
            max_files: 1,
            ..SafetyPolicy::default()
        };
        let report = validate(&patch, &policy);
        assert!(report.has(ViolationKind::ExceedsLineLimit));
        assert!(report.has(ViolationKind::ExceedsFileLimit));
        assert!(report.has(ViolationKind::RestrictedPath));
        assert_eq!(report.violations.len(), 3);
    }

    #[test]
    fn test_path_traversal_is_structural_violation() {
        let patch = parse_patch(&modify("../outside.rs", 1, 1, 0)).unwrap();
        let report = validate(&patch, &SafetyPolicy::default());
        assert!(report.has(ViolationKind::StructurallyInvalid));
        assert!(report.summary().contains("escapes"));
    }

    #[test]
    fn test_absolute_path_is_structural_violation() {
        let text = "--- /etc/passwd\n+++ /etc/passwd\n@@ -1 +1 @@\n-a\n+b\n";
        let report = validate(&parse_patch(text).unwrap(), &SafetyPolicy::default());
        assert!(report.has(ViolationKind::StructurallyInvalid));
    }

    #[test]
    fn test_protect_tests_opt_in() {
        let patch = parse_patch(&modify("tests/test_api.py", 1, 1, 0)).unwrap();
        assert!(validate(&patch, &SafetyPolicy::default()).ok);

        let config = SafetyConfig {
            protect_tests: true,
            ..SafetyConfig::default()
        };
        let policy = SafetyPolicy::from_config(&config).unwrap();
        let report = validate(&patch, &policy);
        assert!(report.has(ViolationKind::RestrictedPath));
        assert_eq!(report.analysis.restricted[0].category, DenyCategory::Test);
    }

    #[test]
    fn test_custom_rules_extend_defaults() {
        let config = SafetyConfig {
            deny_rules: vec![DenyRule::glob(DenyCategory::Secrets, "config/prod/**")],
            ..SafetyConfig::default()
        };
        let policy = SafetyPolicy::from_config(&config).unwrap();
        let patch = parse_patch(&modify("config/prod/app.yaml", 1, 1, 0)).unwrap();
        assert!(validate(&patch, &policy).has(ViolationKind::RestrictedPath));
    }

    #[test]
    fn test_validate_does_not_mutate() {
        let patch = parse_patch(&modify("Cargo.lock", 3, 3, 1)).unwrap();
        let before = patch.clone();
        let first = validate(&patch, &SafetyPolicy::default());
        let second = validate(&patch, &SafetyPolicy::default());
        assert_eq!(patch, before);
        assert_eq!(first, second);
    }
}
