//! Run-level data: identity, per-iteration records, outcomes and metrics.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collab::{FailingTest, ReviewVerdict};
use crate::repair::RepairOutcome;
use crate::safety::ValidationReport;

/// `YYYYMMDDTHHMMSSZ-<8 hex>`: sortable by start time, unique per process.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Identity and budgets of one recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub max_iterations: u32,
    pub deadline: DateTime<Utc>,
    pub root: PathBuf,
}

/// How a single iteration ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Failures strictly decreased; the change was committed.
    Improved { before: usize, after: usize },
    /// Applied and tested, but failures did not decrease; rolled back.
    NoImprovement { before: usize, after: usize },
    /// Stopped by the validator, the repair engine or the Reviewer.
    Rejected { reason: String },
    /// The applier could not apply the patch; rolled back.
    ApplyFailed { reason: String },
    /// The Proposer's text was not a parsable patch.
    MalformedPatch { reason: String },
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Improved { .. } => "improved",
            AttemptOutcome::NoImprovement { .. } => "no_improvement",
            AttemptOutcome::Rejected { .. } => "rejected",
            AttemptOutcome::ApplyFailed { .. } => "apply_failed",
            AttemptOutcome::MalformedPatch { .. } => "malformed_patch",
        }
    }

    pub fn improved(&self) -> bool {
        matches!(self, AttemptOutcome::Improved { .. })
    }
}

/// Immutable record of one completed iteration.
///
/// The full history is handed to the Proposer as prior context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub number: u32,
    pub failing_before: Vec<FailingTest>,
    pub plan: String,
    pub raw_patch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_after: Option<Vec<FailingTest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub outcome: AttemptOutcome,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoPatchProduced,
    TestExecutionError,
    NoProgress,
    Workspace,
    Telemetry,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoPatchProduced => "no_patch_produced",
            FailureKind::TestExecutionError => "test_execution_error",
            FailureKind::NoProgress => "no_progress",
            FailureKind::Workspace => "workspace",
            FailureKind::Telemetry => "telemetry",
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed { kind: FailureKind, reason: String },
    TimedOut,
    MaxIterationsExceeded,
    Interrupted,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::TimedOut => "timed_out",
            RunOutcome::MaxIterationsExceeded => "max_iterations_exceeded",
            RunOutcome::Interrupted => "interrupted",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Failed { kind, reason } => {
                write!(f, "failed ({}): {reason}", kind.as_str())
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Summary written to `metrics.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub tests_failing_initially: usize,
    /// Initially failing tests no longer failing at the end.
    pub tests_fixed: usize,
    pub tests_remaining: usize,
    pub iterations_used: u32,
    pub iterations_improved: u32,
    pub attempts_rejected: u32,
    pub attempts_rolled_back: u32,
    pub elapsed_ms: u64,
    pub success: bool,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Counters the orchestrator keeps while running.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tally {
    pub iterations_used: u32,
    pub improved: u32,
    pub rejected: u32,
    pub rolled_back: u32,
    pub stalled: u32,
}

impl RunMetrics {
    pub(crate) fn build(
        run_id: &str,
        initial: &[FailingTest],
        remaining: &[FailingTest],
        tally: &Tally,
        elapsed_ms: u64,
        outcome: &RunOutcome,
    ) -> Self {
        let still: HashSet<&str> = remaining.iter().map(|t| t.id.as_str()).collect();
        let fixed = initial.iter().filter(|t| !still.contains(t.id.as_str())).count();
        let (failure_kind, failure_reason) = match outcome {
            RunOutcome::Failed { kind, reason } => (Some(*kind), Some(reason.clone())),
            _ => (None, None),
        };
        Self {
            run_id: run_id.to_string(),
            tests_failing_initially: initial.len(),
            tests_fixed: fixed,
            tests_remaining: remaining.len(),
            iterations_used: tally.iterations_used,
            iterations_improved: tally.improved,
            attempts_rejected: tally.rejected,
            attempts_rolled_back: tally.rolled_back,
            elapsed_ms,
            success: outcome.is_success(),
            outcome: outcome.label().to_string(),
            failure_kind,
            failure_reason,
        }
    }
}

/// Everything a caller learns from a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: Run,
    pub outcome: RunOutcome,
    pub metrics: RunMetrics,
    pub iterations: Vec<IterationRecord>,
    pub run_dir: PathBuf,
}
