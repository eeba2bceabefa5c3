//! Error types for the runtime.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced at the entry points in [`crate::run`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime is past shutdown and rejects new work.
    #[error("runtime has been shut down")]
    Shutdown,

    /// Admission refused: a configuration/programmer-error precondition
    /// was violated (e.g. spawning on a scope with admission closed).
    #[error("failed to spawn task: {0}")]
    SpawnFailed(String),

    /// A fiber's task-level error, propagated through a scope boundary.
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// A bounded-resource failure surfaced to the caller of an Op, not a
    /// scope fault (e.g. a non-blocking channel probe on a full channel).
    #[error("channel error: {0}")]
    Channel(String),
}

/// The classified outcome of a fiber's top-level computation.
///
/// `Cancelled` is the cancellation sentinel of the error taxonomy: it is
/// produced exclusively by scope cancellation and is never constructed by
/// user code. Every other variant is a [`Fault`](TaskError::is_fault).
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    /// The fiber observed its scope becoming not-ok. Carries the
    /// cancellation reason recorded on the scope, so a cancelled
    /// performance can be told apart from an outright failure without
    /// losing why it was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The fiber's computation raised an unrecoverable error.
    #[error("{0}")]
    Faulted(String),

    /// The fiber panicked; the payload is the panic message when recoverable.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The fiber's OS thread could not be joined. A host-level defect,
    /// not a scope fault.
    #[error("failed to join fiber: {0}")]
    JoinError(String),

    /// Convenience for callers racing `sleep_op` who want a typed result.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    /// True for every variant except the cancellation sentinel.
    pub fn is_fault(&self) -> bool {
        !matches!(self, TaskError::Cancelled(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_a_fault() {
        let err = TaskError::Cancelled("scope cancelled".to_string());
        assert!(!err.is_fault());
        assert!(err.is_cancelled());
    }

    #[test]
    fn faulted_is_a_fault() {
        let err = TaskError::Faulted("boom".to_string());
        assert!(err.is_fault());
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn display_variants() {
        assert_eq!(
            TaskError::Cancelled("sibling fault".to_string()).to_string(),
            "cancelled: sibling fault"
        );
        assert_eq!(
            TaskError::Panicked("x".into()).to_string(),
            "panicked: x"
        );
    }
}
