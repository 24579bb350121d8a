//! Core types for the breakfix fault-injection training orchestrator.
//!
//! Defines the domain records (exercises, VM assignments, progress,
//! attempts), the persistence interface, and the pure session state machine.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod examples;
pub mod exercise;
pub mod id;
pub mod session;
pub mod store;

pub use error::{CoreError, StoreError};
pub use exercise::{first_enabled, next_enabled, Difficulty, Exercise, ScriptKind, ScriptSource};
pub use id::{ExerciseId, StudentId, TaskId, Vmid};
pub use session::{
    transition, Attempt, ExerciseStatus, Progress, SessionEvent, SessionState, VmAssignment,
};
pub use store::{MemoryStore, Store};
