//! Path deny-list: glob and regex rules grouped by category.

use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What kind of file a deny rule protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCategory {
    CiCd,
    Deployment,
    Secrets,
    LockFile,
    BuildArtifact,
    Migration,
    Test,
}

impl std::fmt::Display for DenyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenyCategory::CiCd => "ci/cd",
            DenyCategory::Deployment => "deployment",
            DenyCategory::Secrets => "secrets",
            DenyCategory::LockFile => "lock file",
            DenyCategory::BuildArtifact => "build artifact",
            DenyCategory::Migration => "migration",
            DenyCategory::Test => "test",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Glob,
    Regex,
}

/// A single configured rule, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub category: DenyCategory,
    #[serde(default = "default_kind")]
    pub kind: PatternKind,
    pub pattern: String,
}

fn default_kind() -> PatternKind {
    PatternKind::Glob
}

impl DenyRule {
    pub fn glob(category: DenyCategory, pattern: &str) -> Self {
        Self {
            category,
            kind: PatternKind::Glob,
            pattern: pattern.to_string(),
        }
    }

    pub fn regex(category: DenyCategory, pattern: &str) -> Self {
        Self {
            category,
            kind: PatternKind::Regex,
            pattern: pattern.to_string(),
        }
    }
}

/// Errors raised when a configured rule does not compile.
#[derive(Debug, thiserror::Error)]
pub enum DenyRuleError {
    #[error("invalid glob `{pattern}`: {reason}")]
    Glob { pattern: String, reason: String },

    #[error("invalid regex `{pattern}`: {reason}")]
    Regex { pattern: String, reason: String },
}

#[derive(Debug, Clone)]
enum Matcher {
    Glob(Pattern),
    Regex(Regex),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: DenyRule,
    matcher: Matcher,
}

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl CompiledRule {
    fn compile(rule: &DenyRule) -> Result<Self, DenyRuleError> {
        let matcher = match rule.kind {
            PatternKind::Glob => {
                Matcher::Glob(Pattern::new(&rule.pattern).map_err(|e| DenyRuleError::Glob {
                    pattern: rule.pattern.clone(),
                    reason: e.to_string(),
                })?)
            }
            PatternKind::Regex => {
                Matcher::Regex(Regex::new(&rule.pattern).map_err(|e| DenyRuleError::Regex {
                    pattern: rule.pattern.clone(),
                    reason: e.to_string(),
                })?)
            }
        };
        Ok(Self {
            rule: rule.clone(),
            matcher,
        })
    }

    fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Glob(p) => {
                if p.matches_with(path, GLOB_OPTIONS) {
                    return true;
                }
                // Slash-free patterns also match the bare file name.
                !self.rule.pattern.contains('/')
                    && path
                        .rsplit('/')
                        .next()
                        .is_some_and(|name| p.matches_with(name, GLOB_OPTIONS))
            }
            Matcher::Regex(re) => re.is_match(path),
        }
    }
}

/// A compiled, ordered deny-list. The first matching rule is reported.
#[derive(Debug, Clone)]
pub struct DenyList {
    rules: Vec<CompiledRule>,
}

impl DenyList {
    pub fn compile(rules: &[DenyRule]) -> Result<Self, DenyRuleError> {
        let rules = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Return the first rule that matches `path`, if any.
    pub fn first_match(&self, path: &str) -> Option<&DenyRule> {
        let normalized = normalize(path);
        self.rules
            .iter()
            .find(|r| r.matches(&normalized))
            .map(|r| &r.rule)
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.trim_start_matches("./").to_string()
}

/// Built-in rules for every category except [`DenyCategory::Test`].
pub fn default_rules() -> Vec<DenyRule> {
    use DenyCategory::*;

    let globs: &[(DenyCategory, &str)] = &[
        (CiCd, ".github/workflows/**"),
        (CiCd, ".github/actions/**"),
        (CiCd, ".gitlab-ci.yml"),
        (CiCd, ".circleci/**"),
        (CiCd, ".buildkite/**"),
        (CiCd, ".travis.yml"),
        (CiCd, "azure-pipelines.yml"),
        (CiCd, "bitbucket-pipelines.yml"),
        (CiCd, "Jenkinsfile"),
        (Deployment, "Dockerfile"),
        (Deployment, "docker-compose*.yml"),
        (Deployment, "docker-compose*.yaml"),
        (Deployment, "k8s/**"),
        (Deployment, "kubernetes/**"),
        (Deployment, "helm/**"),
        (Deployment, "charts/**"),
        (Deployment, "deploy/**"),
        (Deployment, "*.tf"),
        (Deployment, "*.tfvars"),
        (Deployment, "Procfile"),
        (Deployment, "fly.toml"),
        (Secrets, "*.pem"),
        (Secrets, "*.key"),
        (Secrets, "*.p12"),
        (Secrets, "*.pfx"),
        (Secrets, "id_rsa*"),
        (Secrets, "id_ed25519*"),
        (Secrets, "**/secrets/**"),
        (Secrets, ".npmrc"),
        (Secrets, ".pypirc"),
        (Secrets, ".netrc"),
        (LockFile, "Cargo.lock"),
        (LockFile, "package-lock.json"),
        (LockFile, "yarn.lock"),
        (LockFile, "pnpm-lock.yaml"),
        (LockFile, "poetry.lock"),
        (LockFile, "Pipfile.lock"),
        (LockFile, "Gemfile.lock"),
        (LockFile, "composer.lock"),
        (LockFile, "go.sum"),
        (LockFile, "uv.lock"),
        (BuildArtifact, "target/**"),
        (BuildArtifact, "**/node_modules/**"),
        (BuildArtifact, "dist/**"),
        (BuildArtifact, "build/**"),
        (BuildArtifact, "**/__pycache__/**"),
        (BuildArtifact, "*.pyc"),
        (BuildArtifact, "*.min.js"),
        (BuildArtifact, "*.class"),
        (BuildArtifact, "*.o"),
        (BuildArtifact, "*.so"),
        (Migration, "**/migrations/**"),
        (Migration, "**/migrate/**"),
        (Migration, "**/alembic/versions/**"),
    ];
    let regexes: &[(DenyCategory, &str)] = &[
        (Secrets, r"(^|/)\.env(\.[^/]*)?$"),
        (Secrets, r"(^|/)[^/]*credentials[^/]*$"),
    ];

    globs
        .iter()
        .map(|(c, p)| DenyRule::glob(*c, p))
        .chain(regexes.iter().map(|(c, p)| DenyRule::regex(*c, p)))
        .collect()
}

/// Rules that protect test files; only active when the caller opts in.
pub fn test_rules() -> Vec<DenyRule> {
    use DenyCategory::Test;

    vec![
        DenyRule::glob(Test, "**/tests/**"),
        DenyRule::glob(Test, "**/test/**"),
        DenyRule::glob(Test, "**/__tests__/**"),
        DenyRule::glob(Test, "**/spec/**"),
        DenyRule::regex(Test, r"(^|/)test_[^/]*\.py$"),
        DenyRule::regex(Test, r"_test\.(py|go)$"),
        DenyRule::regex(Test, r"\.(test|spec)\.[cm]?[jt]sx?$"),
        DenyRule::regex(Test, r"(^|/)[^/]*Tests?\.java$"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> DenyList {
        DenyList::compile(&default_rules()).unwrap()
    }

    fn category_of(list: &DenyList, path: &str) -> Option<DenyCategory> {
        list.first_match(path).map(|r| r.category)
    }

    #[test]
    fn test_default_rules_compile() {
        assert!(!defaults().is_empty());
        assert!(DenyList::compile(&test_rules()).is_ok());
    }

    #[test]
    fn test_categories_match() {
        let list = defaults();
        assert_eq!(
            category_of(&list, ".github/workflows/ci.yml"),
            Some(DenyCategory::CiCd)
        );
        assert_eq!(
            category_of(&list, "services/api/Dockerfile"),
            Some(DenyCategory::Deployment)
        );
        assert_eq!(category_of(&list, ".env"), Some(DenyCategory::Secrets));
        assert_eq!(
            category_of(&list, "config/.env.production"),
            Some(DenyCategory::Secrets)
        );
        assert_eq!(
            category_of(&list, "web/package-lock.json"),
            Some(DenyCategory::LockFile)
        );
        assert_eq!(
            category_of(&list, "target/debug/app"),
            Some(DenyCategory::BuildArtifact)
        );
        assert_eq!(
            category_of(&list, "app/db/migrations/0001_init.py"),
            Some(DenyCategory::Migration)
        );
    }

    #[test]
    fn test_ordinary_sources_pass() {
        let list = defaults();
        for path in ["src/lib.rs", "app/models.py", "pkg/server/handler.go", "README.md"] {
            assert!(list.first_match(path).is_none(), "{path} should not match");
        }
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let list = DenyList::compile(&[DenyRule::glob(DenyCategory::CiCd, "ci/*.yml")]).unwrap();
        assert!(list.first_match("ci/build.yml").is_some());
        assert!(list.first_match("ci/nested/build.yml").is_none());
    }

    #[test]
    fn test_leading_dot_slash_normalized() {
        assert!(defaults().first_match("./Cargo.lock").is_some());
    }

    #[test]
    fn test_test_rules() {
        let list = DenyList::compile(&test_rules()).unwrap();
        assert!(list.first_match("tests/test_api.py").is_some());
        assert!(list.first_match("src/test_utils.py").is_some());
        assert!(list.first_match("pkg/handler_test.go").is_some());
        assert!(list.first_match("web/src/App.test.tsx").is_some());
        assert!(list.first_match("src/handler.go").is_none());
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let bad_regex = DenyList::compile(&[DenyRule::regex(DenyCategory::Secrets, "(")]);
        assert!(matches!(bad_regex, Err(DenyRuleError::Regex { .. })));

        let bad_glob = DenyList::compile(&[DenyRule::glob(DenyCategory::Secrets, "a/***")]);
        assert!(matches!(bad_glob, Err(DenyRuleError::Glob { .. })));
    }

    #[test]
    fn test_rule_serde_defaults_to_glob() {
        let rule: DenyRule =
            serde_json::from_str(r#"{"category":"secrets","pattern":"*.vault"}"#).unwrap();
        assert_eq!(rule.kind, PatternKind::Glob);
        assert_eq!(rule.category, DenyCategory::Secrets);
    }
}
