//! Persistence interface consumed by the session orchestrator.
//!
//! The relational implementation lives outside this workspace. [`MemoryStore`]
//! is the reference implementation used by tests and the demo gateway.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::exercise::{sort_exercises, Exercise};
use crate::id::{ExerciseId, StudentId, Vmid};
use crate::session::{Attempt, ExerciseStatus, Progress, VmAssignment};

/// Storage for assignments, progress, exercises, and the attempt log.
#[async_trait]
pub trait Store: Send + Sync {
    /// The student's VM, if one was provisioned.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn vm_assignment(&self, student: &StudentId) -> Result<Option<VmAssignment>, StoreError>;

    /// Persist a new assignment.
    ///
    /// # Errors
    /// Returns [`StoreError::DuplicateAssignment`] if the student already has one.
    async fn create_vm_assignment(
        &self,
        student: &StudentId,
        vmid: Vmid,
        vm_name: &str,
        vm_ip: Option<Ipv4Addr>,
        snapshot_name: &str,
    ) -> Result<VmAssignment, StoreError>;

    /// The student's progress row.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn progress(&self, student: &StudentId) -> Result<Option<Progress>, StoreError>;

    /// Upsert the student's progress row.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn update_progress(
        &self,
        student: &StudentId,
        exercise: ExerciseId,
        started: bool,
    ) -> Result<(), StoreError>;

    /// Stamp the student's progress with the time `exercise`'s fault was
    /// injected. A no-op unless `exercise` is the current one.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn record_injection(
        &self,
        student: &StudentId,
        exercise: ExerciseId,
    ) -> Result<(), StoreError>;

    /// Exercises in progression order.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn exercises(&self, only_enabled: bool) -> Result<Vec<Exercise>, StoreError>;

    /// A single exercise by id.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn exercise(&self, id: ExerciseId) -> Result<Option<Exercise>, StoreError>;

    /// Append an attempt to the log.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn record_attempt(&self, attempt: Attempt) -> Result<(), StoreError>;

    /// Status derived from the latest attempt for this pair.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn exercise_status(
        &self,
        student: &StudentId,
        exercise: ExerciseId,
    ) -> Result<ExerciseStatus, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    exercises: Vec<Exercise>,
    assignments: HashMap<StudentId, VmAssignment>,
    progress: HashMap<StudentId, Progress>,
    attempts: Vec<Attempt>,
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store preloaded with authored exercises.
    #[must_use]
    pub fn with_exercises(mut exercises: Vec<Exercise>) -> Self {
        sort_exercises(&mut exercises);
        Self {
            tables: RwLock::new(Tables {
                exercises,
                ..Tables::default()
            }),
        }
    }

    /// Every attempt recorded so far, oldest first.
    pub async fn attempts(&self) -> Vec<Attempt> {
        self.tables.read().await.attempts.clone()
    }

    /// Number of VM assignments.
    pub async fn assignment_count(&self) -> usize {
        self.tables.read().await.assignments.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn vm_assignment(&self, student: &StudentId) -> Result<Option<VmAssignment>, StoreError> {
        Ok(self.tables.read().await.assignments.get(student).cloned())
    }

    async fn create_vm_assignment(
        &self,
        student: &StudentId,
        vmid: Vmid,
        vm_name: &str,
        vm_ip: Option<Ipv4Addr>,
        snapshot_name: &str,
    ) -> Result<VmAssignment, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.assignments.contains_key(student) {
            return Err(StoreError::DuplicateAssignment(student.clone()));
        }
        let assignment = VmAssignment::new(student.clone(), vmid, vm_name, vm_ip, snapshot_name);
        tables.assignments.insert(student.clone(), assignment.clone());
        Ok(assignment)
    }

    async fn progress(&self, student: &StudentId) -> Result<Option<Progress>, StoreError> {
        Ok(self.tables.read().await.progress.get(student).cloned())
    }

    async fn update_progress(
        &self,
        student: &StudentId,
        exercise: ExerciseId,
        started: bool,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.exercises.iter().any(|e| e.id == exercise) {
            return Err(StoreError::ExerciseNotFound(exercise));
        }
        tables.progress.insert(
            student.clone(),
            Progress::new(student.clone(), exercise, started),
        );
        Ok(())
    }

    async fn record_injection(
        &self,
        student: &StudentId,
        exercise: ExerciseId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(progress) = tables.progress.get_mut(student) {
            if progress.current == exercise {
                progress.injected_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn exercises(&self, only_enabled: bool) -> Result<Vec<Exercise>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .exercises
            .iter()
            .filter(|e| e.enabled || !only_enabled)
            .cloned()
            .collect())
    }

    async fn exercise(&self, id: ExerciseId) -> Result<Option<Exercise>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.exercises.iter().find(|e| e.id == id).cloned())
    }

    async fn record_attempt(&self, attempt: Attempt) -> Result<(), StoreError> {
        self.tables.write().await.attempts.push(attempt);
        Ok(())
    }

    async fn exercise_status(
        &self,
        student: &StudentId,
        exercise: ExerciseId,
    ) -> Result<ExerciseStatus, StoreError> {
        let tables = self.tables.read().await;
        let latest = tables
            .attempts
            .iter()
            .rev()
            .find(|a| &a.student_id == student && a.exercise_id == exercise);
        Ok(match latest {
            Some(a) if a.passed => ExerciseStatus::Passed,
            Some(_) => ExerciseStatus::Failed,
            None => ExerciseStatus::Untried,
        })
    }
}
