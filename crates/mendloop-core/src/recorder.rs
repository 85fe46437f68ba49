//! Append-only run telemetry.
//!
//! Layout of one run directory:
//!
//! ```text
//! <runs_dir>/<run_id>/
//!     events.jsonl      one {"timestamp","kind","payload"} object per line
//!     patches/<n>.diff  patch proposed in iteration n
//!     reports/<n>.log   test report after iteration n (0 = baseline)
//!     metrics.json      final RunMetrics
//!     metrics.digest    sha256 of metrics.json
//! ```
//!
//! The recorder is the single writer for its directory; every event line is
//! flushed before `record` returns.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::digest::Digest;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const METRICS_FILE: &str = "metrics.json";
pub const METRICS_DIGEST_FILE: &str = "metrics.digest";

/// Lifecycle event kinds, in the order a normal iteration emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    Discovery,
    PlanStart,
    PlanComplete,
    ActStart,
    ActComplete,
    ReviewStart,
    ReviewApproved,
    ReviewRejected,
    ApplyAttempted,
    Applied,
    RolledBack,
    TestStart,
    TestComplete,
    ReflectStart,
    ReflectComplete,
    RunEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStart => "run_start",
            EventKind::Discovery => "discovery",
            EventKind::PlanStart => "plan_start",
            EventKind::PlanComplete => "plan_complete",
            EventKind::ActStart => "act_start",
            EventKind::ActComplete => "act_complete",
            EventKind::ReviewStart => "review_start",
            EventKind::ReviewApproved => "review_approved",
            EventKind::ReviewRejected => "review_rejected",
            EventKind::ApplyAttempted => "apply_attempted",
            EventKind::Applied => "applied",
            EventKind::RolledBack => "rolled_back",
            EventKind::TestStart => "test_start",
            EventKind::TestComplete => "test_complete",
            EventKind::ReflectStart => "reflect_start",
            EventKind::ReflectComplete => "reflect_complete",
            EventKind::RunEnd => "run_end",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Patch,
    TestReport,
}

impl ArtifactKind {
    fn relative_path(&self, iteration: u32) -> String {
        match self {
            ArtifactKind::Patch => format!("patches/{iteration}.diff"),
            ArtifactKind::TestReport => format!("reports/{iteration}.log"),
        }
    }
}

/// Pointer to a stored artifact, embedded in event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub iteration: u32,
    /// Path relative to the run directory.
    pub path: String,
    pub digest: Digest,
}

/// Telemetry failures. Any of these stops the run.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid event at {path}:{line}: {reason}")]
    InvalidEvent {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RecorderError + '_ {
    move |source| RecorderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Single-writer recorder for one run directory.
pub struct RunRecorder {
    run_id: String,
    dir: PathBuf,
    events: BufWriter<File>,
    recorded: u64,
}

impl std::fmt::Debug for RunRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRecorder")
            .field("run_id", &self.run_id)
            .field("dir", &self.dir)
            .field("recorded", &self.recorded)
            .finish()
    }
}

impl RunRecorder {
    /// Create `<runs_dir>/<run_id>/` and open its event log.
    ///
    /// Fails if the run directory already exists.
    pub fn create(runs_dir: &Path, run_id: &str) -> Result<Self, RecorderError> {
        fs::create_dir_all(runs_dir).map_err(io_err(runs_dir))?;
        let dir = runs_dir.join(run_id);
        fs::create_dir(&dir).map_err(io_err(&dir))?;
        for sub in ["patches", "reports"] {
            let path = dir.join(sub);
            fs::create_dir(&path).map_err(io_err(&path))?;
        }

        let events_path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&events_path)
            .map_err(io_err(&events_path))?;

        debug!(run_id, dir = %dir.display(), "run directory created");
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
            events: BufWriter::new(file),
            recorded: 0,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of events written so far.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Append one event and flush it to disk.
    pub fn record(&mut self, kind: EventKind, payload: serde_json::Value) -> Result<(), RecorderError> {
        let event = TelemetryEvent {
            timestamp: Utc::now(),
            kind,
            payload,
        };
        let path = self.dir.join(EVENTS_FILE);
        serde_json::to_writer(&mut self.events, &event)?;
        self.events.write_all(b"\n").map_err(io_err(&path))?;
        self.events.flush().map_err(io_err(&path))?;
        self.recorded += 1;
        debug!(run_id = %self.run_id, kind = %kind, "event recorded");
        Ok(())
    }

    /// Store an artifact blob and return a reference to it.
    pub fn save_artifact(
        &mut self,
        kind: ArtifactKind,
        iteration: u32,
        bytes: &[u8],
    ) -> Result<ArtifactRef, RecorderError> {
        let rel = kind.relative_path(iteration);
        let path = self.dir.join(&rel);
        fs::write(&path, bytes).map_err(io_err(&path))?;
        Ok(ArtifactRef {
            kind,
            iteration,
            path: rel,
            digest: Digest::compute(bytes),
        })
    }

    /// Write `metrics.json` and its digest sidecar.
    pub fn write_metrics<T: Serialize>(&self, metrics: &T) -> Result<PathBuf, RecorderError> {
        let json = serde_json::to_vec_pretty(metrics)?;
        let metrics_path = self.dir.join(METRICS_FILE);
        let digest_path = self.dir.join(METRICS_DIGEST_FILE);
        fs::write(&metrics_path, &json).map_err(io_err(&metrics_path))?;
        fs::write(&digest_path, Digest::compute(&json).to_hex()).map_err(io_err(&digest_path))?;
        Ok(metrics_path)
    }
}

/// Read every event of a run directory in order.
pub fn load_events(run_dir: &Path) -> Result<Vec<TelemetryEvent>, RecorderError> {
    let path = run_dir.join(EVENTS_FILE);
    let file = File::open(&path).map_err(io_err(&path))?;
    let mut events = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err(&path))?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|e| RecorderError::InvalidEvent {
            path: path.clone(),
            line: idx + 1,
            reason: e.to_string(),
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Read `metrics.json`, refusing it if the digest sidecar disagrees.
pub fn read_metrics<T: DeserializeOwned>(run_dir: &Path) -> Result<T, RecorderError> {
    let metrics_path = run_dir.join(METRICS_FILE);
    let digest_path = run_dir.join(METRICS_DIGEST_FILE);
    let json = fs::read(&metrics_path).map_err(io_err(&metrics_path))?;
    let expected = fs::read_to_string(&digest_path).map_err(io_err(&digest_path))?;
    let actual = Digest::compute(&json).to_hex();
    if expected.trim() != actual {
        return Err(RecorderError::DigestMismatch {
            path: metrics_path,
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

/// Read an artifact back and check it against its recorded digest.
pub fn read_artifact(run_dir: &Path, artifact: &ArtifactRef) -> Result<Vec<u8>, RecorderError> {
    let path = run_dir.join(&artifact.path);
    let bytes = fs::read(&path).map_err(io_err(&path))?;
    let actual = Digest::compute(&bytes);
    if actual != artifact.digest {
        return Err(RecorderError::DigestMismatch {
            path,
            expected: artifact.digest.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layout_created() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RunRecorder::create(dir.path(), "run-1").unwrap();
        assert!(rec.dir().join(EVENTS_FILE).exists());
        assert!(rec.dir().join("patches").is_dir());
        assert!(rec.dir().join("reports").is_dir());
    }

    #[test]
    fn test_duplicate_run_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _first = RunRecorder::create(dir.path(), "run-1").unwrap();
        assert!(RunRecorder::create(dir.path(), "run-1").is_err());
    }

    #[test]
    fn test_events_are_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RunRecorder::create(dir.path(), "run-1").unwrap();
        rec.record(EventKind::RunStart, json!({"max_iterations": 3})).unwrap();
        rec.record(EventKind::RunEnd, json!({"outcome": "success"})).unwrap();

        let raw = fs::read_to_string(rec.dir().join(EVENTS_FILE)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        let keys: Vec<&String> = first.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(first["kind"], "run_start");

        let events = load_events(rec.dir()).unwrap();
        assert_eq!(events[1].kind, EventKind::RunEnd);
        assert_eq!(rec.recorded(), 2);
    }

    #[test]
    fn test_artifact_paths_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RunRecorder::create(dir.path(), "run-1").unwrap();
        let patch = rec.save_artifact(ArtifactKind::Patch, 2, b"--- a/x\n").unwrap();
        let report = rec.save_artifact(ArtifactKind::TestReport, 0, b"ok").unwrap();
        assert_eq!(patch.path, "patches/2.diff");
        assert_eq!(report.path, "reports/0.log");
        assert_eq!(read_artifact(rec.dir(), &report).unwrap(), b"ok");

        fs::write(rec.dir().join(&patch.path), b"tampered").unwrap();
        assert!(matches!(
            read_artifact(rec.dir(), &patch),
            Err(RecorderError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_metrics_digest_verified() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RunRecorder::create(dir.path(), "run-1").unwrap();
        rec.write_metrics(&json!({"success": true})).unwrap();
        let back: serde_json::Value = read_metrics(rec.dir()).unwrap();
        assert_eq!(back["success"], true);

        fs::write(rec.dir().join(METRICS_FILE), b"{\"success\": false}").unwrap();
        let err = read_metrics::<serde_json::Value>(rec.dir()).unwrap_err();
        assert!(matches!(err, RecorderError::DigestMismatch { .. }));
    }

    #[test]
    fn test_corrupt_event_line_reported() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RunRecorder::create(dir.path(), "run-1").unwrap();
        fs::write(rec.dir().join(EVENTS_FILE), "{not json}\n").unwrap();
        let err = load_events(rec.dir()).unwrap_err();
        assert!(matches!(err, RecorderError::InvalidEvent { line: 1, .. }));
    }
}
