//! The recovery state machine.
//!
//! ```text
//! Start -> Discover -> Plan -> Act -> Review -> Apply -> Test -> Reflect
//!                        ^                                         |
//!                        +-----------------------------------------+
//! ```
//!
//! Terminal states are the [`RunOutcome`] variants. Stages report through
//! tagged values: an iteration ends with an [`AttemptOutcome`], and anything
//! that must stop the run short-circuits as a `Halt`. Only this module
//! decides when a run ends.

pub mod budget;
pub mod state;

use serde_json::json;
use tracing::{debug, info, warn, Instrument};

pub use budget::InterruptSignal;
pub use state::{
    new_run_id, AttemptOutcome, FailureKind, IterationRecord, Run, RunMetrics, RunOutcome,
    RunReport,
};

use budget::{Budget, CallStop};
use state::Tally;

use crate::apply::apply_patch;
use crate::collab::{Collaborators, FailingTest, Proposal, TestRun};
use crate::config::RecoveryConfig;
use crate::error::{MendError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::patch::{parse_patch, Patch};
use crate::recorder::{ArtifactKind, EventKind, RecorderError, RunRecorder};
use crate::repair::{DirSource, Repairer};
use crate::safety::{validate, SafetyPolicy};
use crate::workspace::{Workspace, WorkspaceError};

/// A stage result that ends the run.
#[derive(Debug)]
struct Halt(RunOutcome);

impl Halt {
    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Halt(RunOutcome::Failed {
            kind,
            reason: reason.into(),
        })
    }
}

impl From<RecorderError> for Halt {
    fn from(e: RecorderError) -> Self {
        Halt::failed(FailureKind::Telemetry, e.to_string())
    }
}

impl From<WorkspaceError> for Halt {
    fn from(e: WorkspaceError) -> Self {
        Halt::failed(FailureKind::Workspace, e.to_string())
    }
}

impl From<CallStop> for Halt {
    fn from(stop: CallStop) -> Self {
        match stop {
            CallStop::Deadline => Halt(RunOutcome::TimedOut),
            CallStop::Interrupted => Halt(RunOutcome::Interrupted),
            // Callers turn a per-call timeout into a stage-specific result
            // before it can get here; if one slips through it is a timeout.
            CallStop::CallTimeout(_) => Halt(RunOutcome::TimedOut),
        }
    }
}

type Step<T> = std::result::Result<T, Halt>;

/// Drives one recovery run to a terminal state.
pub struct Orchestrator {
    config: RecoveryConfig,
    policy: SafetyPolicy,
    repairer: Repairer,
    collab: Collaborators,
    workspace: Box<dyn Workspace>,
    recorder: RunRecorder,
    run: Run,
    budget: Budget,
    initial: Vec<FailingTest>,
    /// Failures of the last known-good tree.
    failing: Vec<FailingTest>,
    history: Vec<IterationRecord>,
    tally: Tally,
    /// The tree differs from the last known-good state.
    dirty: bool,
}

impl Orchestrator {
    /// Validate `config` and bind the run to `workspace` and `recorder`.
    ///
    /// The run id is the recorder's.
    pub fn new(
        config: RecoveryConfig,
        collab: Collaborators,
        workspace: Box<dyn Workspace>,
        recorder: RunRecorder,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.safety_policy()?;
        let started_at = chrono::Utc::now();
        let deadline = chrono::Duration::from_std(config.timeout())
            .ok()
            .and_then(|timeout| started_at.checked_add_signed(timeout))
            .ok_or_else(|| {
                MendError::InvalidConfig(format!("timeout_secs {} is out of range", config.timeout_secs))
            })?;
        let run = Run {
            id: recorder.run_id().to_string(),
            started_at,
            max_iterations: config.max_iterations,
            deadline,
            root: workspace.root().to_path_buf(),
        };
        Ok(Self {
            repairer: Repairer::new(config.repair.clone()),
            budget: Budget::start(config.timeout(), config.call_timeout()),
            policy,
            collab,
            workspace,
            recorder,
            run,
            config,
            initial: Vec::new(),
            failing: Vec::new(),
            history: Vec::new(),
            tally: Tally::default(),
            dirty: false,
        })
    }

    pub fn run_info(&self) -> &Run {
        &self.run
    }

    /// Execute the run until a terminal state.
    pub async fn run(self, interrupt: InterruptSignal) -> RunReport {
        let span = obs::run_span(&self.run.id);
        self.execute(interrupt).instrument(span).await
    }

    async fn execute(mut self, interrupt: InterruptSignal) -> RunReport {
        let run_id = self.run.id.clone();
        obs::emit_run_started(&run_id, self.config.max_iterations, self.config.timeout_secs);

        let mut outcome = match self.drive(&interrupt).await {
            Ok(Halt(outcome)) | Err(Halt(outcome)) => outcome,
        };

        // Every non-success ending resets to the last commit, even a clean tree.
        if self.dirty || !outcome.is_success() {
            let cause = format!("run ended: {}", outcome.label());
            if let Err(Halt(failure)) = self.rollback(None, &cause) {
                if !matches!(outcome, RunOutcome::Failed { .. }) {
                    outcome = failure;
                }
            }
        }

        let elapsed_ms = self.budget.elapsed().as_millis() as u64;
        let mut metrics = self.metrics(&outcome, elapsed_ms);
        if let Err(e) = self.finish(&outcome, &metrics) {
            obs::emit_telemetry_error(&run_id, &e);
            if !matches!(outcome, RunOutcome::Failed { .. }) {
                outcome = Halt::from(e).0;
                metrics = self.metrics(&outcome, elapsed_ms);
            }
        }

        METRICS.flush();
        obs::emit_run_finished(&run_id, outcome.label(), self.tally.iterations_used, elapsed_ms);

        RunReport {
            run_dir: self.recorder.dir().to_path_buf(),
            run: self.run,
            outcome,
            metrics,
            iterations: self.history,
        }
    }

    fn metrics(&self, outcome: &RunOutcome, elapsed_ms: u64) -> RunMetrics {
        RunMetrics::build(
            &self.run.id,
            &self.initial,
            &self.failing,
            &self.tally,
            elapsed_ms,
            outcome,
        )
    }

    fn finish(&mut self, outcome: &RunOutcome, metrics: &RunMetrics) -> std::result::Result<(), RecorderError> {
        self.recorder.record(
            EventKind::RunEnd,
            json!({ "outcome": outcome, "metrics": metrics }),
        )?;
        self.recorder.write_metrics(metrics)?;
        Ok(())
    }

    fn event(&mut self, kind: EventKind, payload: serde_json::Value) -> Step<()> {
        self.recorder.record(kind, payload)?;
        Ok(())
    }

    /// `Ok` carries a decision made at Reflect; `Err` an early stop.
    async fn drive(&mut self, interrupt: &InterruptSignal) -> Step<Halt> {
        self.event(
            EventKind::RunStart,
            json!({
                "run": &self.run,
                "max_iterations": self.config.max_iterations,
                "timeout_secs": self.config.timeout_secs,
            }),
        )?;

        // Discover
        self.event(EventKind::Discovery, json!({ "iteration": 0 }))?;
        let baseline = self.run_tests(0, interrupt).await?;
        self.initial = baseline.failing.clone();
        self.failing = baseline.failing;
        obs::emit_baseline(&self.run.id, self.failing.len());
        if self.failing.is_empty() {
            info!("no failing tests at baseline");
            return Ok(Halt(RunOutcome::Success));
        }

        let mut number = 0u32;
        loop {
            number += 1;
            self.budget.checkpoint(interrupt)?;
            self.tally.iterations_used = number;
            METRICS.inc_iterations();

            let record = self.iterate(number, interrupt).await?;
            obs::emit_iteration_finished(
                &self.run.id,
                number,
                record.outcome.label(),
                record.failing_after.as_ref().map(Vec::len),
            );
            if record.outcome.improved() {
                self.tally.stalled = 0;
            } else {
                self.tally.stalled += 1;
            }
            self.history.push(record);

            // Reflect
            self.event(EventKind::ReflectStart, json!({ "iteration": number }))?;
            let decision = self.reflect(number);
            self.event(
                EventKind::ReflectComplete,
                json!({
                    "iteration": number,
                    "failing": self.failing.len(),
                    "decision": decision.as_ref().map(|h| h.0.label()).unwrap_or("continue"),
                }),
            )?;
            if let Some(halt) = decision {
                return Ok(halt);
            }
        }
    }

    fn reflect(&self, number: u32) -> Option<Halt> {
        if self.failing.is_empty() {
            return Some(Halt(RunOutcome::Success));
        }
        if number >= self.config.max_iterations {
            return Some(Halt(RunOutcome::MaxIterationsExceeded));
        }
        if self.budget.expired() {
            return Some(Halt(RunOutcome::TimedOut));
        }
        if let Some(limit) = self.config.max_stalled_iterations {
            if self.tally.stalled >= limit {
                return Some(Halt::failed(
                    FailureKind::NoProgress,
                    format!("no improvement in {limit} consecutive iterations"),
                ));
            }
        }
        None
    }

    /// Plan, Act, Review, Apply and Test for one iteration.
    async fn iterate(&mut self, number: u32, interrupt: &InterruptSignal) -> Step<IterationRecord> {
        let failing_before = self.failing.clone();
        self.event(
            EventKind::Discovery,
            json!({
                "iteration": number,
                "failing": failing_before.len(),
                "tests": failing_before.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            }),
        )?;

        // Plan + Act
        self.event(EventKind::PlanStart, json!({ "iteration": number }))?;
        let proposal = self.propose(interrupt).await?;
        self.event(
            EventKind::PlanComplete,
            json!({ "iteration": number, "plan": &proposal.plan }),
        )?;
        self.event(EventKind::ActStart, json!({ "iteration": number }))?;
        let artifact = self
            .recorder
            .save_artifact(ArtifactKind::Patch, number, proposal.patch.as_bytes())?;
        self.event(
            EventKind::ActComplete,
            json!({ "iteration": number, "patch": artifact }),
        )?;

        let mut record = IterationRecord {
            number,
            failing_before,
            plan: proposal.plan,
            raw_patch: proposal.patch,
            validation: None,
            repair: None,
            revalidation: None,
            review: None,
            failing_after: None,
            commit: None,
            outcome: AttemptOutcome::Rejected {
                reason: String::new(),
            },
        };

        // Review
        self.event(EventKind::ReviewStart, json!({ "iteration": number }))?;
        let patch = match self.review(&mut record, interrupt).await? {
            Ok(patch) => {
                self.event(
                    EventKind::ReviewApproved,
                    json!({
                        "iteration": number,
                        "files": patch.files.len(),
                        "hunks": patch.hunk_count(),
                        "partial_repair": record.repair.as_ref().is_some_and(|r| r.is_partial()),
                    }),
                )?;
                patch
            }
            Err(outcome) => {
                let reason = match &outcome {
                    AttemptOutcome::Rejected { reason } | AttemptOutcome::MalformedPatch { reason } => {
                        reason.clone()
                    }
                    _ => String::new(),
                };
                self.event(
                    EventKind::ReviewRejected,
                    json!({ "iteration": number, "outcome": &outcome, "reason": &reason }),
                )?;
                obs::emit_patch_rejected(&self.run.id, number, &reason);
                METRICS.inc_patches_rejected();
                self.tally.rejected += 1;
                record.outcome = outcome;
                return Ok(record);
            }
        };

        // Apply
        self.event(
            EventKind::ApplyAttempted,
            json!({ "iteration": number, "files": patch.files.len(), "hunks": patch.hunk_count() }),
        )?;
        self.dirty = true;
        match apply_patch(&patch, self.workspace.root()) {
            Ok(report) => {
                METRICS.inc_patches_applied();
                self.event(
                    EventKind::Applied,
                    json!({ "iteration": number, "result": report }),
                )?;
            }
            Err(e) => {
                let reason = e.to_string();
                self.rollback(Some(number), &reason)?;
                record.outcome = AttemptOutcome::ApplyFailed { reason };
                return Ok(record);
            }
        }

        // Test
        let run = match self.run_tests(number, interrupt).await {
            Ok(run) => run,
            Err(halt) => {
                self.rollback(Some(number), halt.0.label())?;
                return Err(halt);
            }
        };

        let before = self.failing.len();
        let after = run.failing.len();
        record.failing_after = Some(run.failing.clone());
        if after < before {
            let mut touched: Vec<String> = patch
                .files
                .iter()
                .flat_map(|change| change.touched_paths())
                .map(str::to_string)
                .collect();
            touched.sort();
            touched.dedup();
            let sha = self.workspace.commit(
                &format!("mendloop: iteration {number} ({before} -> {after} failing)"),
                &touched,
            )?;
            self.dirty = false;
            debug!(iteration = number, %sha, "improvement committed");
            self.tally.improved += 1;
            self.failing = run.failing;
            record.commit = Some(sha);
            record.outcome = AttemptOutcome::Improved { before, after };
        } else {
            self.rollback(Some(number), "no improvement")?;
            record.outcome = AttemptOutcome::NoImprovement { before, after };
        }
        Ok(record)
    }

    /// Ask the Proposer, retrying on errors and empty patches.
    async fn propose(&mut self, interrupt: &InterruptSignal) -> Step<Proposal> {
        let attempts = 1 + self.config.proposer_retries;
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            let call = self.collab.proposer.propose(&self.failing, &self.history);
            last_reason = match self.budget.guard(interrupt, call).await {
                Ok(Ok(proposal)) if !proposal.patch.trim().is_empty() => return Ok(proposal),
                Ok(Ok(_)) => "proposer returned an empty patch".to_string(),
                Ok(Err(e)) => format!("proposer error: {e}"),
                Err(CallStop::CallTimeout(limit)) => {
                    format!("proposer timed out after {}s", limit.as_secs())
                }
                Err(stop) => return Err(stop.into()),
            };
            warn!(attempt, attempts, reason = %last_reason, "no usable proposal");
        }

        Err(Halt::failed(FailureKind::NoPatchProduced, last_reason))
    }

    /// Parse, validate, repair, re-validate and ask the Reviewer.
    ///
    /// The inner `Err` is a non-fatal rejection of this attempt.
    async fn review(
        &mut self,
        record: &mut IterationRecord,
        interrupt: &InterruptSignal,
    ) -> Step<std::result::Result<Patch, AttemptOutcome>> {
        let parsed = match parse_patch(&record.raw_patch) {
            Ok(p) => p,
            Err(e) => {
                return Ok(Err(AttemptOutcome::MalformedPatch {
                    reason: e.to_string(),
                }))
            }
        };
        if parsed.is_empty() {
            return Ok(Err(AttemptOutcome::Rejected {
                reason: "patch contains no file changes".to_string(),
            }));
        }

        let report = validate(&parsed, &self.policy);
        let ok = report.ok;
        let summary = report.summary();
        record.validation = Some(report);
        if !ok {
            return Ok(Err(AttemptOutcome::Rejected {
                reason: format!("validator: {summary}"),
            }));
        }

        let source = DirSource::new(self.workspace.root());
        let repaired = self.repairer.repair(&parsed, &source);
        METRICS.add_hunks_repaired(repaired.actions.len() as u64);
        let patch = repaired.patch.clone();
        let emptied = patch.hunk_count() == 0 && parsed.hunk_count() > 0;
        record.repair = Some(repaired);
        if patch.is_empty() || emptied {
            return Ok(Err(AttemptOutcome::Rejected {
                reason: "repair could not place any hunk".to_string(),
            }));
        }

        let report = validate(&patch, &self.policy);
        let ok = report.ok;
        let summary = report.summary();
        record.revalidation = Some(report);
        if !ok {
            return Ok(Err(AttemptOutcome::Rejected {
                reason: format!("validator after repair: {summary}"),
            }));
        }

        let call = self.collab.reviewer.review(&patch, &self.failing);
        let verdict = match self.budget.guard(interrupt, call).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => crate::collab::ReviewVerdict::reject(format!("reviewer error: {e}")),
            Err(CallStop::CallTimeout(limit)) => crate::collab::ReviewVerdict::reject(format!(
                "reviewer timed out after {}s",
                limit.as_secs()
            )),
            Err(stop) => return Err(stop.into()),
        };
        let approved = verdict.approved;
        let reason = verdict.reason.clone();
        record.review = Some(verdict);
        if !approved {
            return Ok(Err(AttemptOutcome::Rejected {
                reason: format!("reviewer: {reason}"),
            }));
        }
        Ok(Ok(patch))
    }

    /// Run the suite and store its report as artifact `iteration`.
    async fn run_tests(&mut self, iteration: u32, interrupt: &InterruptSignal) -> Step<TestRun> {
        self.event(EventKind::TestStart, json!({ "iteration": iteration }))?;
        let call = self.collab.test_runner.run();
        let run = match self.budget.guard(interrupt, call).await {
            Ok(Ok(run)) => run,
            Ok(Err(e)) => return Err(Halt::failed(FailureKind::TestExecutionError, e.to_string())),
            Err(CallStop::CallTimeout(limit)) => {
                return Err(Halt::failed(
                    FailureKind::TestExecutionError,
                    format!("test run timed out after {}s", limit.as_secs()),
                ))
            }
            Err(stop) => return Err(stop.into()),
        };

        let artifact = self
            .recorder
            .save_artifact(ArtifactKind::TestReport, iteration, &run.report)?;
        self.event(
            EventKind::TestComplete,
            json!({
                "iteration": iteration,
                "failing": run.failing.len(),
                "tests": run.failing.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
                "report": artifact,
            }),
        )?;
        Ok(run)
    }

    /// Return the tree to the last known-good state and log it.
    /// Reset to the last commit. Only a reset that discards an applied patch
    /// counts as a rolled-back attempt.
    fn rollback(&mut self, iteration: Option<u32>, cause: &str) -> Step<()> {
        let dirty = self.dirty;
        self.workspace.reset()?;
        self.dirty = false;
        if dirty {
            self.tally.rolled_back += 1;
            METRICS.inc_rollbacks();
        }
        obs::emit_rollback(&self.run.id, iteration.unwrap_or(0), cause);
        self.event(
            EventKind::RolledBack,
            json!({ "iteration": iteration, "cause": cause, "dirty": dirty }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_call_stops_map_to_outcomes() {
        assert_eq!(Halt::from(CallStop::Deadline).0, RunOutcome::TimedOut);
        assert_eq!(Halt::from(CallStop::Interrupted).0, RunOutcome::Interrupted);
        assert_eq!(
            Halt::from(CallStop::CallTimeout(Duration::from_secs(1))).0,
            RunOutcome::TimedOut
        );
    }

    #[test]
    fn test_workspace_error_is_workspace_failure() {
        let halt = Halt::from(WorkspaceError::Dirty("M src/lib.rs".to_string()));
        assert!(matches!(
            halt.0,
            RunOutcome::Failed {
                kind: FailureKind::Workspace,
                ..
            }
        ));
    }
}
