//! Structured lifecycle logging for recovery runs.
//!
//! Every event is an `info!` (or `warn!`) record with a stable `event` field
//! so log pipelines can follow a run without reading `events.jsonl`.

use tracing::{info, warn};

/// Run-scoped span. Attach it to the run future with
/// [`tracing::Instrument`] so it stays current across await points.
///
/// ```ignore
/// drive().instrument(run_span("20260101T000000Z-1a2b3c4d")).await;
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("mendloop.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, max_iterations: u32, timeout_secs: u64) {
    info!(
        event = "run.started",
        run_id = %run_id,
        max_iterations = max_iterations,
        timeout_secs = timeout_secs,
    );
}

pub fn emit_baseline(run_id: &str, failing: usize) {
    info!(event = "run.baseline", run_id = %run_id, failing = failing);
}

/// Emitted when an iteration reaches its verdict.
pub fn emit_iteration_finished(run_id: &str, iteration: u32, outcome: &str, failing: Option<usize>) {
    info!(
        event = "iteration.finished",
        run_id = %run_id,
        iteration = iteration,
        outcome = %outcome,
        failing = ?failing,
    );
}

pub fn emit_patch_rejected(run_id: &str, iteration: u32, reason: &str) {
    info!(
        event = "patch.rejected",
        run_id = %run_id,
        iteration = iteration,
        reason = %reason,
    );
}

pub fn emit_rollback(run_id: &str, iteration: u32, cause: &str) {
    warn!(
        event = "workspace.rolled_back",
        run_id = %run_id,
        iteration = iteration,
        cause = %cause,
    );
}

pub fn emit_run_finished(run_id: &str, outcome: &str, iterations: u32, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        iterations = iterations,
        duration_ms = duration_ms,
    );
}

/// Telemetry could not be written; the run is about to stop.
pub fn emit_telemetry_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "telemetry.error", run_id = %run_id, error = %error);
}
