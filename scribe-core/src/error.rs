//! Error taxonomy for operations, transforms and document application.
//!
//! Every variant is local to a single operation: it rejects that operation
//! and never leaves a [`DocumentState`](crate::DocumentState) half-applied.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an operation could not be lined up against a document state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mismatch {
    /// The operation's base length differs from the length it is applied or
    /// rebased against.
    Length { expected: usize, actual: usize },
    /// The operation was authored against a version that has already been
    /// evicted from the bounded history.
    Truncated { base_version: u64, oldest: u64 },
    /// The operation claims a version the authority has not reached yet.
    Future { base_version: u64, current: u64 },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::Length { expected, actual } => {
                write!(f, "base length {actual} does not match document length {expected}")
            }
            Mismatch::Truncated { base_version, oldest } => {
                write!(f, "base version {base_version} predates retained history (oldest {oldest})")
            }
            Mismatch::Future { base_version, current } => {
                write!(f, "base version {base_version} is ahead of current version {current}")
            }
        }
    }
}

/// Errors raised by the operational-transform core.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OtError {
    /// The operation is internally inconsistent.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    /// The operation cannot be resolved against the state it targets.
    #[error("version mismatch: {0}")]
    VersionMismatch(Mismatch),

    /// `DocumentState::apply` was handed an operation that was not rebased
    /// onto the current version first.
    #[error("out of order operation: expected base version {expected}, got {actual}")]
    OutOfOrderOperation { expected: u64, actual: u64 },
}

impl OtError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        OtError::MalformedOperation(reason.into())
    }

    pub(crate) fn length(expected: usize, actual: usize) -> Self {
        OtError::VersionMismatch(Mismatch::Length { expected, actual })
    }

    /// Whether the author has to fetch a fresh snapshot before retrying.
    pub fn requires_resync(&self) -> bool {
        matches!(self, OtError::VersionMismatch(_))
    }
}

pub type Result<T> = std::result::Result<T, OtError>;
