//! External collaborators: the Proposer, Reviewer and TestRunner.
//!
//! The orchestrator only sees these fixed-shape traits. Subprocess-backed
//! implementations live in [`command`]; tests supply scripted fakes.

pub mod command;
pub mod report;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::orchestrator::IterationRecord;
use crate::patch::Patch;

pub use command::{CommandProposer, CommandReviewer, CommandTestRunner};

/// A test that currently fails, as reported by the TestRunner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailingTest {
    /// Suite-qualified identifier, e.g. `tests/test_api.py::test_login`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub detail: String,
}

impl FailingTest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: None,
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// What the Proposer returns: a plan and raw patch text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub patch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
}

impl ReviewVerdict {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// Result of one test-suite execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRun {
    pub failing: Vec<FailingTest>,
    /// Opaque report blob, stored verbatim as an artifact.
    pub report: Vec<u8>,
}

impl TestRun {
    pub fn passed(&self) -> bool {
        self.failing.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Proposer: Send + Sync {
    /// Propose a change for `failing`, given every earlier iteration.
    async fn propose(
        &self,
        failing: &[FailingTest],
        history: &[IterationRecord],
    ) -> Result<Proposal, CollaboratorError>;
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        patch: &Patch,
        failing: &[FailingTest],
    ) -> Result<ReviewVerdict, CollaboratorError>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self) -> Result<TestRun, CollaboratorError>;
}

/// The three collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub proposer: Arc<dyn Proposer>,
    pub reviewer: Arc<dyn Reviewer>,
    pub test_runner: Arc<dyn TestRunner>,
}

impl Collaborators {
    pub fn new(
        proposer: Arc<dyn Proposer>,
        reviewer: Arc<dyn Reviewer>,
        test_runner: Arc<dyn TestRunner>,
    ) -> Self {
        Self {
            proposer,
            reviewer,
            test_runner,
        }
    }
}

/// Reviewer that approves every patch the validator let through.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

#[async_trait]
impl Reviewer for ApproveAll {
    async fn review(
        &self,
        _patch: &Patch,
        _failing: &[FailingTest],
    ) -> Result<ReviewVerdict, CollaboratorError> {
        Ok(ReviewVerdict::approve("automatic approval"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failing_test_serde_defaults() {
        let t: FailingTest = serde_json::from_str(r#"{"id":"a::b"}"#).unwrap();
        assert_eq!(t, FailingTest::new("a::b"));
        let json = serde_json::to_value(&t).unwrap();
        assert!(json.get("location").is_none());
    }

    #[test]
    fn test_verdict_constructors() {
        assert!(ReviewVerdict::approve("ok").approved);
        assert!(!ReviewVerdict::reject("no").approved);
    }

    #[tokio::test]
    async fn test_approve_all() {
        let verdict = ApproveAll.review(&Patch::default(), &[]).await.unwrap();
        assert!(verdict.approved);
    }
}
