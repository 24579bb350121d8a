//! Error types for the executor crate.

use std::time::Duration;

use breakfix_core::{CoreError, ExerciseId, StoreError, StudentId, TaskId};

/// Errors from the hypervisor control plane. Every variant carries the
/// upstream message where one exists.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HypervisorError {
    /// Credentials are missing or were rejected.
    #[error("hypervisor authentication failed: {0}")]
    Authentication(String),

    /// A task finished with a non-OK exit status.
    #[error("task {task_id} failed: {exit_status}")]
    TaskFailed { task_id: TaskId, exit_status: String },

    /// A task did not finish within the wait budget.
    #[error("task {task_id} did not finish within {}s", .waited.as_secs())]
    TaskTimeout { task_id: TaskId, waited: Duration },

    /// Control-plane API request failed.
    #[error("hypervisor API request failed: {0}")]
    Api(String),

    /// The response did not have the expected shape.
    #[error("unexpected hypervisor response: {0}")]
    InvalidResponse(String),
}

/// Errors from remote script execution.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ScriptError {
    /// No VM IP is known or no transport credential is configured.
    #[error("no connection available for student {student}: {reason}")]
    ConnectionUnavailable { student: StudentId, reason: String },

    /// The transport failed before the script produced a result.
    #[error("script execution failed: {0}")]
    Execution(String),
}

/// Errors returned to the submitter of a queue unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The unit panicked or the queue worker went away before it finished.
    #[error("queued unit aborted before producing a result")]
    UnitAborted,
}

/// Errors while reading configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Errors surfaced by the session orchestrator.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Hypervisor operation failed.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A hard script failure (only under the fail-fast unreachable policy).
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// A queued unit was aborted.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The requested step is illegal in the current session state.
    #[error(transparent)]
    Transition(#[from] CoreError),

    /// No enabled exercise exists.
    #[error("no enabled exercises are configured")]
    NoExercises,

    /// The referenced exercise does not exist.
    #[error("exercise not found: {0}")]
    ExerciseNotFound(ExerciseId),

    /// `next()` was called before the current exercise passed verification.
    #[error("current exercise not passed: {0}")]
    NotPassed(ExerciseId),

    /// The student has no VM yet.
    #[error("no VM assigned to student {0}")]
    NoVm(StudentId),
}
