//! Error taxonomy for the engine and its ports.

use serde_json::Value;
use thiserror::Error;

use crate::domain::Context;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// `Validation`, `StateConflict` and `NotFound` never mutate instance state.
/// `StepFailed` always follows a transition to `Failed` and a compensation walk.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    StepFailed(Box<StepFailure>),

    #[error("Rollback of step {step} failed: {message}")]
    RollbackFailed {
        step: usize,
        message: String,
        compensated: Context,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// The step failure details, if this is a step or expression failure
    pub fn step_failure(&self) -> Option<&StepFailure> {
        match self {
            Self::StepFailed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// What made a step fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The forward function returned an error
    Step,

    /// The branch predicate did not evaluate to a boolean
    Expression,
}

/// A failed step together with the outcome of the compensation it triggered
#[derive(Debug, Error)]
#[error("Step {step} ('{name}') of '{tag}' failed: {message}")]
pub struct StepFailure {
    pub tag: String,
    pub instance_id: String,
    pub step: usize,
    pub name: String,
    pub kind: FailureKind,
    pub message: String,

    /// Merged contexts returned by the compensations that ran
    pub compensated: Context,

    /// Compensation error, if the unwind did not complete cleanly
    pub rollback_error: Option<String>,
}

/// Errors from a persistence backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the notification bus
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No async runtime available to drive subscription on '{0}'")]
    NoRuntime(String),
}

/// Errors from predicate evaluation
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Expression '{expression}' did not evaluate to a boolean: got {result}")]
    NotBoolean { expression: String, result: Value },
}
