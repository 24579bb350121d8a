//! Per-trainee session records and the pure session state machine.
//!
//! The state machine here performs no I/O. The executor crate consults
//! [`transition`] before every hypervisor or script side effect, so an
//! illegal step is rejected before anything touches a VM.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{ExerciseId, StudentId, Vmid};

/// The VM provisioned for one student. Created exactly once per student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmAssignment {
    pub student_id: StudentId,
    /// Never changes after creation.
    pub vmid: Vmid,
    pub vm_name: String,
    /// May stay unknown indefinitely.
    pub vm_ip: Option<Ipv4Addr>,
    /// Checkpoint restored before every exercise.
    pub snapshot_name: String,
}

impl VmAssignment {
    #[must_use]
    pub fn new(
        student_id: StudentId,
        vmid: Vmid,
        vm_name: impl Into<String>,
        vm_ip: Option<Ipv4Addr>,
        snapshot_name: impl Into<String>,
    ) -> Self {
        Self {
            student_id,
            vmid,
            vm_name: vm_name.into(),
            vm_ip,
            snapshot_name: snapshot_name.into(),
        }
    }
}

/// Where a student currently is in the exercise progression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Progress {
    pub student_id: StudentId,
    pub current: ExerciseId,
    pub started: bool,
    /// When the current exercise's fault was last injected successfully.
    #[serde(default)]
    pub injected_at: Option<DateTime<Utc>>,
}

impl Progress {
    #[must_use]
    pub fn new(student_id: StudentId, current: ExerciseId, started: bool) -> Self {
        Self {
            student_id,
            current,
            started,
            injected_at: None,
        }
    }

    /// Whole seconds between the last injection and `now`, never negative.
    #[must_use]
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.injected_at
            .map(|at| now.signed_duration_since(at).num_seconds().max(0))
    }
}

/// One verification run. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Attempt {
    pub student_id: StudentId,
    pub exercise_id: ExerciseId,
    pub passed: bool,
    pub stdout: String,
    pub stderr: String,
    /// stdout followed by stderr.
    pub output: String,
    pub recorded_at: DateTime<Utc>,
}

impl Attempt {
    #[must_use]
    pub fn new(
        student_id: StudentId,
        exercise_id: ExerciseId,
        passed: bool,
        stdout: String,
        stderr: String,
    ) -> Self {
        let output = format!("{stdout}{stderr}");
        Self {
            student_id,
            exercise_id,
            passed,
            stdout,
            stderr,
            output,
            recorded_at: Utc::now(),
        }
    }
}

/// Outcome of the latest attempt for a (student, exercise) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseStatus {
    Passed,
    Failed,
    Untried,
}

impl fmt::Display for ExerciseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => f.write_str("passed"),
            Self::Failed => f.write_str("failed"),
            Self::Untried => f.write_str("untried"),
        }
    }
}

/// Lifecycle of one trainee session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Provisioning,
    Active { exercise: ExerciseId },
    Completed,
}

impl SessionState {
    /// Derive the persisted part of the state from a progress row.
    ///
    /// `Provisioning` and `Completed` are never persisted; callers overlay
    /// them from in-flight and exercise-status information.
    #[must_use]
    pub fn from_progress(progress: Option<&Progress>) -> Self {
        match progress {
            Some(p) if p.started => Self::Active {
                exercise: p.current,
            },
            _ => Self::Unstarted,
        }
    }

    /// The current exercise, if the session is active.
    #[must_use]
    pub fn current_exercise(&self) -> Option<ExerciseId> {
        match self {
            Self::Active { exercise } => Some(*exercise),
            _ => None,
        }
    }
}

/// Inputs to [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// `start()` was called.
    Begin,
    /// The VM is ready and the first exercise was selected.
    Ready { first: ExerciseId },
    /// Rolled back and moved from `from` to `to`.
    Advance { from: ExerciseId, to: ExerciseId },
    /// `next()` found no further enabled exercise.
    Exhausted { from: ExerciseId },
}

/// Apply `event` to `state`.
///
/// `Begin` is accepted from every state: restarting a session is allowed and
/// overlapping starts are not rejected here.
///
/// # Errors
/// Returns [`CoreError::NotStarted`] when advancing an unstarted session,
/// [`CoreError::ExerciseMismatch`] when `from` is not the current exercise,
/// and [`CoreError::InvalidTransition`] for every other illegal pair.
pub fn transition(state: SessionState, event: SessionEvent) -> Result<SessionState, CoreError> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (_, E::Begin) => Ok(S::Provisioning),
        (S::Provisioning, E::Ready { first }) => Ok(S::Active { exercise: first }),
        (S::Unstarted, E::Advance { .. } | E::Exhausted { .. }) => Err(CoreError::NotStarted),
        (S::Active { exercise }, E::Advance { from, to }) => {
            if exercise == from {
                Ok(S::Active { exercise: to })
            } else {
                Err(CoreError::ExerciseMismatch {
                    current: exercise,
                    requested: from,
                })
            }
        }
        (S::Active { exercise }, E::Exhausted { from }) => {
            if exercise == from {
                Ok(S::Completed)
            } else {
                Err(CoreError::ExerciseMismatch {
                    current: exercise,
                    requested: from,
                })
            }
        }
        (state, event) => Err(CoreError::InvalidTransition { state, event }),
    }
}
