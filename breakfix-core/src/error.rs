use crate::id::{ExerciseId, StudentId};
use crate::session::{SessionEvent, SessionState};

/// Errors produced by the `breakfix-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A session event is not valid in the current state.
    #[error("invalid session transition: {event:?} while {state:?}")]
    InvalidTransition {
        state: SessionState,
        event: SessionEvent,
    },

    /// The session has not been started yet.
    #[error("session not started")]
    NotStarted,

    /// An advance was requested from an exercise that is not the current one.
    #[error("exercise {requested} is not the current exercise {current}")]
    ExerciseMismatch {
        current: ExerciseId,
        requested: ExerciseId,
    },
}

/// Errors produced by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A VM assignment already exists for this student.
    #[error("student {0} already has a VM assignment")]
    DuplicateAssignment(StudentId),

    /// The referenced exercise does not exist.
    #[error("exercise not found: {0}")]
    ExerciseNotFound(ExerciseId),

    /// Backend failure (connection, query, serialization).
    #[error("storage backend error: {0}")]
    Backend(String),
}
