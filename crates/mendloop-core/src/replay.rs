//! Reconstruct a run from its event log.
//!
//! `summarize` is pure over the events; `replay_run` also loads them and
//! checks every referenced artifact against its recorded digest.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::RunOutcome;
use crate::recorder::{load_events, read_artifact, ArtifactRef, EventKind, RecorderError, TelemetryEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected { reason: String },
}

/// What the log says about one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub number: u32,
    /// Event kinds in the order they were recorded.
    pub stages: Vec<EventKind>,
    pub review: Option<ReviewDecision>,
    /// `None` if no apply was attempted, `Some(false)` if it failed.
    pub applied: Option<bool>,
    pub rolled_back: bool,
    pub failing_before: Option<usize>,
    pub failing_after: Option<usize>,
    /// Reflect decision: `continue` or a terminal outcome label.
    pub decision: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Option<String>,
    pub baseline_failing: Option<usize>,
    pub iterations: Vec<IterationSummary>,
    /// The run ended with uncommitted changes that were discarded.
    pub final_rollback: bool,
    pub outcome: Option<RunOutcome>,
    pub artifacts: Vec<ArtifactRef>,
}

impl RunSummary {
    /// A `run_end` event was recorded.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }
}

fn iteration_of(payload: &Value) -> Option<u32> {
    payload
        .get("iteration")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

fn count(payload: &Value, key: &str) -> Option<usize> {
    payload.get(key).and_then(Value::as_u64).map(|n| n as usize)
}

fn artifact(payload: &Value, key: &str) -> Option<ArtifactRef> {
    payload
        .get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Fold an event log into a per-iteration summary.
///
/// Unknown or out-of-place events are kept in the stage list and otherwise
/// ignored.
pub fn summarize(events: &[TelemetryEvent]) -> RunSummary {
    let mut summary = RunSummary::default();

    for event in events {
        let payload = &event.payload;
        for key in ["patch", "report"] {
            if let Some(a) = artifact(payload, key) {
                summary.artifacts.push(a);
            }
        }

        match (event.kind, iteration_of(payload)) {
            (EventKind::RunStart, _) => {
                summary.run_id = payload
                    .pointer("/run/id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            (EventKind::RunEnd, _) => {
                summary.outcome = payload
                    .get("outcome")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
            }
            (EventKind::RolledBack, None) => summary.final_rollback = true,
            (EventKind::TestComplete, Some(0)) => {
                summary.baseline_failing = count(payload, "failing");
            }
            (_, None) | (_, Some(0)) => {}
            (kind, Some(number)) => {
                let idx = match summary.iterations.iter().position(|i| i.number == number) {
                    Some(idx) => idx,
                    None => {
                        summary.iterations.push(IterationSummary {
                            number,
                            ..Default::default()
                        });
                        summary.iterations.len() - 1
                    }
                };
                let it = &mut summary.iterations[idx];
                it.stages.push(kind);
                match kind {
                    EventKind::Discovery => it.failing_before = count(payload, "failing"),
                    EventKind::ReviewApproved => it.review = Some(ReviewDecision::Approved),
                    EventKind::ReviewRejected => {
                        let reason = payload
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        it.review = Some(ReviewDecision::Rejected { reason });
                    }
                    EventKind::ApplyAttempted => it.applied = Some(false),
                    EventKind::Applied => it.applied = Some(true),
                    EventKind::RolledBack => it.rolled_back = true,
                    EventKind::TestComplete => it.failing_after = count(payload, "failing"),
                    EventKind::ReflectComplete => {
                        it.decision = payload
                            .get("decision")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                    _ => {}
                }
            }
        }
    }

    summary
}

/// Load, summarize and verify the artifacts of the run in `run_dir`.
pub fn replay_run(run_dir: &Path) -> Result<RunSummary, RecorderError> {
    let events = load_events(run_dir)?;
    let summary = summarize(&events);
    for artifact in &summary.artifacts {
        read_artifact(run_dir, artifact)?;
    }
    Ok(summary)
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run       {}", self.run_id.as_deref().unwrap_or("<unknown>"))?;
        match self.baseline_failing {
            Some(n) => writeln!(f, "baseline  {n} failing")?,
            None => writeln!(f, "baseline  <not recorded>")?,
        }
        for it in &self.iterations {
            let review = match &it.review {
                Some(ReviewDecision::Approved) => "approved".to_string(),
                Some(ReviewDecision::Rejected { reason }) => format!("rejected ({reason})"),
                None => "-".to_string(),
            };
            let applied = match it.applied {
                Some(true) => "applied",
                Some(false) => "apply failed",
                None => "not applied",
            };
            let after = it
                .failing_after
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string());
            write!(f, "#{:<3} review {review}; {applied}; failing after {after}", it.number)?;
            if it.rolled_back {
                write!(f, "; rolled back")?;
            }
            if let Some(d) = &it.decision {
                write!(f, "; {d}")?;
            }
            writeln!(f)?;
        }
        match &self.outcome {
            Some(outcome) => writeln!(f, "outcome   {outcome}"),
            None => writeln!(f, "outcome   <incomplete: no run_end event>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn ev(kind: EventKind, payload: Value) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    #[test]
    fn test_summarize_rejected_then_improved() {
        let events = vec![
            ev(EventKind::RunStart, json!({ "run": { "id": "r1" } })),
            ev(EventKind::Discovery, json!({ "iteration": 0 })),
            ev(EventKind::TestComplete, json!({ "iteration": 0, "failing": 2 })),
            ev(EventKind::Discovery, json!({ "iteration": 1, "failing": 2 })),
            ev(EventKind::ReviewStart, json!({ "iteration": 1 })),
            ev(EventKind::ReviewRejected, json!({ "iteration": 1, "reason": "too big" })),
            ev(EventKind::ReflectComplete, json!({ "iteration": 1, "decision": "continue" })),
            ev(EventKind::Discovery, json!({ "iteration": 2, "failing": 2 })),
            ev(EventKind::ReviewApproved, json!({ "iteration": 2 })),
            ev(EventKind::ApplyAttempted, json!({ "iteration": 2 })),
            ev(EventKind::Applied, json!({ "iteration": 2 })),
            ev(EventKind::TestComplete, json!({ "iteration": 2, "failing": 0 })),
            ev(EventKind::ReflectComplete, json!({ "iteration": 2, "decision": "success" })),
            ev(EventKind::RunEnd, json!({ "outcome": { "status": "success" } })),
        ];
        let s = summarize(&events);
        assert_eq!(s.run_id.as_deref(), Some("r1"));
        assert_eq!(s.baseline_failing, Some(2));
        assert_eq!(s.iterations.len(), 2);
        assert_eq!(
            s.iterations[0].review,
            Some(ReviewDecision::Rejected {
                reason: "too big".to_string()
            })
        );
        assert_eq!(s.iterations[0].applied, None);
        assert_eq!(s.iterations[1].applied, Some(true));
        assert_eq!(s.iterations[1].failing_after, Some(0));
        assert_eq!(s.outcome, Some(RunOutcome::Success));
        assert!(s.to_string().contains("outcome   success"));
    }

    #[test]
    fn test_apply_failure_and_incomplete_log() {
        let events = vec![
            ev(EventKind::ApplyAttempted, json!({ "iteration": 1 })),
            ev(EventKind::RolledBack, json!({ "iteration": 1, "cause": "mismatch" })),
            ev(EventKind::RolledBack, json!({ "iteration": null, "cause": "run ended" })),
        ];
        let s = summarize(&events);
        assert_eq!(s.iterations[0].applied, Some(false));
        assert!(s.iterations[0].rolled_back);
        assert!(s.final_rollback);
        assert!(!s.is_complete());
    }
}
