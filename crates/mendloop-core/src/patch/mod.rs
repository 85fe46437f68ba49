//! Unified-diff patch model and parser.
//!
//! # Modules
//!
//! - [`model`] — `Patch`, `FileChange`, `Hunk`, `HunkLine`, rendering and inversion
//! - [`parse`] — `parse_patch()`, a strict grammar that records declared counts verbatim

pub mod model;
pub mod parse;

pub use model::{ChangeKind, FileChange, Hunk, HunkLine, Patch};
pub use parse::parse_patch;

/// Errors produced while tokenizing patch text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}
