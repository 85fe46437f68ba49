//! mendloop core library
//!
//! A bounded, auditable loop that drives a working tree from "tests fail"
//! towards "tests pass": an external Proposer suggests a unified diff, the
//! patch is validated, repaired against the real files, reviewed, applied
//! with rollback, and kept only if it reduces the number of failing tests.
//! Every step is written to a per-run event log.

pub mod apply;
pub mod collab;
pub mod config;
pub mod digest;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod patch;
pub mod recorder;
pub mod repair;
pub mod replay;
pub mod safety;
pub mod telemetry;
pub mod workspace;

pub use apply::{apply_patch, ApplyError, ApplyErrorKind, ApplyReport};
pub use collab::{
    ApproveAll, CollaboratorError, Collaborators, CommandProposer, CommandReviewer,
    CommandTestRunner, FailingTest, Proposal, Proposer, ReviewVerdict, Reviewer, TestRun,
    TestRunner,
};
pub use config::RecoveryConfig;
pub use digest::Digest;
pub use error::{MendError, Result};
pub use orchestrator::{
    new_run_id, AttemptOutcome, FailureKind, InterruptSignal, IterationRecord, Orchestrator, Run,
    RunMetrics, RunOutcome, RunReport,
};
pub use patch::{parse_patch, ChangeKind, FileChange, Hunk, HunkLine, Patch, PatchError};
pub use recorder::{
    load_events, read_artifact, read_metrics, ArtifactKind, ArtifactRef, EventKind,
    RecorderError, RunRecorder, TelemetryEvent,
};
pub use repair::{
    repair, DirSource, MemorySource, RepairAction, RepairConfig, RepairOutcome, Repairer,
    SourceView,
};
pub use replay::{replay_run, summarize, RunSummary};
pub use safety::{
    validate, SafetyConfig, SafetyPolicy, ValidationReport, Violation, ViolationKind,
};
pub use telemetry::init_tracing;
pub use workspace::{GitWorkspace, SnapshotWorkspace, Workspace, WorkspaceError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
