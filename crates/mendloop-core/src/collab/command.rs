//! Subprocess-backed collaborators.
//!
//! Each adapter runs a shell command in the working tree. The test runner
//! parses the command's output; the proposer and reviewer exchange one JSON
//! document over stdin/stdout. Children are killed if the orchestrator drops
//! the call (timeout or interrupt).

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::report::parse_failures;
use super::{
    CollaboratorError, FailingTest, Proposal, Proposer, ReviewVerdict, Reviewer, TestRun,
    TestRunner,
};
use crate::orchestrator::IterationRecord;
use crate::patch::Patch;

fn shell(command: &str, cwd: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.current_dir(cwd).kill_on_drop(true);
    cmd
}

async fn run_with_input(
    command: &str,
    cwd: &Path,
    input: Option<Vec<u8>>,
) -> Result<Output, CollaboratorError> {
    let mut cmd = shell(command, cwd);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn().map_err(|source| CollaboratorError::Spawn {
        command: command.to_string(),
        source,
    })?;

    if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
        // A child that exits without reading stdin is not an error.
        if let Err(e) = stdin.write_all(&bytes).await {
            debug!(command, error = %e, "child closed stdin early");
        }
        drop(stdin);
    }

    Ok(child.wait_with_output().await?)
}

fn ensure_success(command: &str, output: &Output) -> Result<(), CollaboratorError> {
    if output.status.success() {
        return Ok(());
    }
    Err(CollaboratorError::Failed {
        command: command.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Test runner
// ---------------------------------------------------------------------------

/// Runs the project's test command and extracts failing tests.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: String,
    cwd: PathBuf,
}

impl CommandTestRunner {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
        }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self) -> Result<TestRun, CollaboratorError> {
        let output = run_with_input(&self.command, &self.cwd, None).await?;

        let mut report = output.stdout.clone();
        if !output.stderr.is_empty() {
            report.extend_from_slice(b"\n--- stderr ---\n");
            report.extend_from_slice(&output.stderr);
        }

        if output.status.success() {
            return Ok(TestRun {
                failing: Vec::new(),
                report,
            });
        }

        let mut failing = parse_failures(&String::from_utf8_lossy(&report));
        if failing.is_empty() {
            warn!(command = %self.command, status = %output.status, "test command failed without recognisable failures");
            failing.push(
                FailingTest::new(self.command.clone())
                    .with_detail(format!("test command exited with {}", output.status)),
            );
        }
        debug!(command = %self.command, failing = failing.len(), "test run finished");
        Ok(TestRun { failing, report })
    }
}

// ---------------------------------------------------------------------------
// Proposer
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ProposeRequest<'a> {
    failing: &'a [FailingTest],
    history: &'a [IterationRecord],
}

/// Asks an external command for a patch.
///
/// The request `{"failing": [...], "history": [...]}` is written to stdin.
/// The response is `{"plan": "...", "patch": "..."}`; stdout that is not a
/// JSON object is taken verbatim as the patch text.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    command: String,
    cwd: PathBuf,
}

impl CommandProposer {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
        }
    }
}

#[async_trait]
impl Proposer for CommandProposer {
    async fn propose(
        &self,
        failing: &[FailingTest],
        history: &[IterationRecord],
    ) -> Result<Proposal, CollaboratorError> {
        let request = serde_json::to_vec(&ProposeRequest { failing, history })
            .map_err(|e| CollaboratorError::Other(format!("encode request: {e}")))?;
        let output = run_with_input(&self.command, &self.cwd, Some(request)).await?;
        ensure_success(&self.command, &output)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(match serde_json::from_str::<Proposal>(&stdout) {
            Ok(proposal) => proposal,
            Err(_) => Proposal {
                plan: String::new(),
                patch: stdout.into_owned(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Reviewer
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ReviewRequest<'a> {
    patch: String,
    failing: &'a [FailingTest],
}

#[derive(Deserialize)]
struct ReviewResponse {
    approved: bool,
    #[serde(default)]
    reason: String,
}

/// Asks an external command to approve or reject a patch.
///
/// Any response that is not `{"approved": bool, "reason": "..."}` is a
/// rejection.
#[derive(Debug, Clone)]
pub struct CommandReviewer {
    command: String,
    cwd: PathBuf,
}

impl CommandReviewer {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
        }
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(
        &self,
        patch: &Patch,
        failing: &[FailingTest],
    ) -> Result<ReviewVerdict, CollaboratorError> {
        let request = serde_json::to_vec(&ReviewRequest {
            patch: patch.to_string(),
            failing,
        })
        .map_err(|e| CollaboratorError::Other(format!("encode request: {e}")))?;
        let output = run_with_input(&self.command, &self.cwd, Some(request)).await?;
        ensure_success(&self.command, &output)?;

        match serde_json::from_slice::<ReviewResponse>(&output.stdout) {
            Ok(r) => Ok(ReviewVerdict {
                approved: r.approved,
                reason: r.reason,
            }),
            Err(e) => Ok(ReviewVerdict::reject(format!(
                "unparsable reviewer response: {e}"
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn cwd() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        (dir, path)
    }

    #[tokio::test]
    async fn test_runner_success_means_no_failures() {
        let (_dir, path) = cwd();
        let run = CommandTestRunner::new("echo 'test a ... ok'", path).run().await.unwrap();
        assert!(run.passed());
        assert!(String::from_utf8_lossy(&run.report).contains("test a ... ok"));
    }

    #[tokio::test]
    async fn test_runner_parses_failures() {
        let (_dir, path) = cwd();
        let cmd = "printf 'test a ... FAILED\\ntest b ... FAILED\\n'; exit 101";
        let run = CommandTestRunner::new(cmd, path).run().await.unwrap();
        let ids: Vec<_> = run.failing.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_runner_synthesizes_failure_for_unknown_output() {
        let (_dir, path) = cwd();
        let run = CommandTestRunner::new("echo boom >&2; exit 3", path).run().await.unwrap();
        assert_eq!(run.failing.len(), 1);
        assert!(run.failing[0].detail.contains("exited"));
        assert!(String::from_utf8_lossy(&run.report).contains("boom"));
    }

    #[tokio::test]
    async fn test_proposer_reads_json_or_raw_patch() {
        let (_dir, path) = cwd();
        let json = CommandProposer::new(
            r#"cat >/dev/null; printf '%s' '{"plan":"fix","patch":"--- a/x\n+++ b/x\n"}'"#,
            path.clone(),
        );
        let proposal = json.propose(&[FailingTest::new("t")], &[]).await.unwrap();
        assert_eq!(proposal.plan, "fix");
        assert!(proposal.patch.starts_with("--- a/x"));

        let raw = CommandProposer::new("cat >/dev/null; printf -- '--- a/y\\n+++ b/y\\n'", path);
        let proposal = raw.propose(&[], &[]).await.unwrap();
        assert_eq!(proposal.plan, "");
        assert_eq!(proposal.patch, "--- a/y\n+++ b/y\n");
    }

    #[tokio::test]
    async fn test_proposer_receives_request_on_stdin() {
        let (_dir, path) = cwd();
        let check = CommandProposer::new(
            r#"grep -q 'suite::t' && printf '%s' '{"plan":"saw request","patch":""}'"#,
            path,
        );
        let proposal = check.propose(&[FailingTest::new("suite::t")], &[]).await.unwrap();
        assert_eq!(proposal.plan, "saw request");
    }

    #[tokio::test]
    async fn test_reviewer_garbage_is_rejection() {
        let (_dir, path) = cwd();
        let verdict = CommandReviewer::new("cat >/dev/null; echo LGTM", path.clone())
            .review(&Patch::default(), &[])
            .await
            .unwrap();
        assert!(!verdict.approved);

        let verdict = CommandReviewer::new(
            r#"cat >/dev/null; printf '%s' '{"approved":true,"reason":"small"}'"#,
            path,
        )
        .review(&Patch::default(), &[])
        .await
        .unwrap();
        assert!(verdict.approved);
        assert_eq!(verdict.reason, "small");
    }

    #[tokio::test]
    async fn test_spawn_failure_in_missing_dir() {
        let runner = CommandTestRunner::new("true", "/nonexistent/mendloop/dir");
        assert!(matches!(
            runner.run().await,
            Err(CollaboratorError::Spawn { .. })
        ));
    }
}
