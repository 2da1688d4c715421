//! Error types for branch versioning operations.

use thiserror::Error;

use crate::model::Timepoint;

/// Typed failure kinds surfaced by the branch service.
///
/// Service APIs return `anyhow::Result`; callers that need to react to a
/// specific kind recover it with `err.downcast_ref::<BranchError>()`.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("Branch '{0}' does not exist.")]
    NotFound(String),

    #[error("Branch '{path}' does not exist at timepoint {timepoint}.")]
    NotFoundAtTimepoint { path: String, timepoint: Timepoint },

    #[error("Branch '{0}' already exists.")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Branch '{0}' is already locked.")]
    Locked(String),

    #[error("{0}")]
    InvariantViolation(String),

    #[error("Commit on branch '{0}' was already completed or rolled back.")]
    AlreadyConsumed(String),

    #[error("Commit listener aborted commit on branch '{path}': {reason}")]
    ListenerAborted { path: String, reason: String },
}
