//! Crate-level error taxonomy for mendloop.
//!
//! Stage-specific failures (patch parsing, application, collaborator calls,
//! workspace operations, telemetry writes) have their own enums next to the
//! code that produces them; `MendError` folds them together for callers that
//! only need to propagate.

use crate::apply::ApplyError;
use crate::collab::CollaboratorError;
use crate::patch::PatchError;
use crate::recorder::RecorderError;
use crate::workspace::WorkspaceError;

/// Top-level mendloop errors.
#[derive(Debug, thiserror::Error)]
pub enum MendError {
    #[error("malformed patch: {0}")]
    Patch(#[from] PatchError),

    #[error("patch application failed: {0}")]
    Apply(#[from] ApplyError),

    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("telemetry error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mendloop operations.
pub type Result<T> = std::result::Result<T, MendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = MendError::InvalidConfig("max_iterations must be at least 1".to_string());
        assert!(err.to_string().contains("invalid configuration"));
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = MendError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }

    #[test]
    fn test_patch_error_converts() {
        let err: MendError = PatchError::Malformed {
            line: 3,
            reason: "bad hunk header".to_string(),
        }
        .into();
        assert!(err.to_string().contains("bad hunk header"));
    }
}
