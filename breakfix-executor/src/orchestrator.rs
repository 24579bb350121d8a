//! Per-student session orchestration.
//!
//! Ties exercise progress to VM snapshot state: provisions a VM on first
//! start, injects faults, records verification attempts, and rolls the VM
//! back to the clean-start checkpoint before each new exercise. Every
//! hypervisor mutation runs inside a [`TaskQueue`] unit.
//!
//! Calls for the same student are not mutually excluded; overlapping
//! `start`/`next` calls for one student are the caller's responsibility.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use breakfix_core::{
    first_enabled, next_enabled, transition, Attempt, CoreError, Difficulty, Exercise,
    ExerciseId, ExerciseStatus, ScriptKind, SessionEvent, SessionState, Store, StudentId,
    VmAssignment, Vmid,
};
use chrono::Utc;
use serde::Serialize;

use crate::config::{SessionConfig, UnreachablePolicy};
use crate::hypervisor::Hypervisor;
use crate::queue::TaskQueue;
use crate::remote::{ScriptRunner, SshTarget};
use crate::{ScriptError, SessionError};

/// Trainee-facing view of an exercise. Fault and check scripts stay hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExerciseSummary {
    pub id: ExerciseId,
    pub title: String,
    pub body: String,
    pub difficulty: Difficulty,
    pub hint_count: usize,
}

impl From<&Exercise> for ExerciseSummary {
    fn from(e: &Exercise) -> Self {
        Self {
            id: e.id,
            title: e.title.clone(),
            body: e.body.clone(),
            difficulty: e.difficulty,
            hint_count: e.hints.len(),
        }
    }
}

/// Result of [`SessionOrchestrator::start`].
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub vm: VmAssignment,
    /// `true` if this call created the VM.
    pub provisioned: bool,
    pub exercise: ExerciseSummary,
    /// Set when fault injection failed softly.
    pub injection_warning: Option<String>,
}

/// Result of [`SessionOrchestrator::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub exercise_id: ExerciseId,
    pub passed: bool,
    /// `None` when the check never ran.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Why the check could not run.
    pub error: Option<String>,
}

/// Result of [`SessionOrchestrator::next`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextReport {
    /// Rolled back and moved on.
    Advanced {
        exercise: ExerciseSummary,
        injection_warning: Option<String>,
    },
    /// No further enabled exercise; the VM was not touched.
    Done,
}

/// Result of [`SessionOrchestrator::hint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HintReport {
    Hint {
        exercise_id: ExerciseId,
        step: usize,
        text: String,
        has_more: bool,
    },
    /// `step` is past the last hint.
    Done { exercise_id: ExerciseId },
}

/// How to reach a student's VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub vmid: Vmid,
    pub vm_name: String,
    pub vm_ip: Option<Ipv4Addr>,
    pub snapshot_name: String,
    pub ssh_port: Option<u16>,
    pub ssh_username: Option<String>,
}

/// Snapshot of a student's session for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub exercise: Option<ExerciseSummary>,
    pub exercise_status: Option<ExerciseStatus>,
    pub vm: Option<VmAssignment>,
    /// Live power state; `None` if the control plane could not be asked.
    pub power_state: Option<String>,
    /// Seconds since the current fault was injected.
    pub elapsed_secs: Option<i64>,
}

/// Session state machine driving the hypervisor, script runner and store.
///
/// Construct once at startup and share behind an `Arc`.
pub struct SessionOrchestrator<H, R, S> {
    hypervisor: Arc<H>,
    runner: Arc<R>,
    store: Arc<S>,
    queue: TaskQueue,
    config: SessionConfig,
    provisioning: Arc<Mutex<BTreeSet<StudentId>>>,
}

/// Marks a student as provisioning until dropped.
struct ProvisioningGuard {
    set: Arc<Mutex<BTreeSet<StudentId>>>,
    student: StudentId,
}

impl ProvisioningGuard {
    fn enter(set: &Arc<Mutex<BTreeSet<StudentId>>>, student: &StudentId) -> Self {
        set.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(student.clone());
        Self {
            set: Arc::clone(set),
            student: student.clone(),
        }
    }
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.student);
    }
}

impl<H, R, S> SessionOrchestrator<H, R, S>
where
    H: Hypervisor + 'static,
    R: ScriptRunner + 'static,
    S: Store + 'static,
{
    /// Create an orchestrator. `queue` must be the process-wide queue shared
    /// by everything that mutates the hypervisor.
    #[must_use]
    pub fn new(
        hypervisor: Arc<H>,
        runner: Arc<R>,
        store: Arc<S>,
        queue: TaskQueue,
        config: SessionConfig,
    ) -> Self {
        Self {
            hypervisor,
            runner,
            store,
            queue,
            config,
            provisioning: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// The shared task queue.
    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// The persistence backend.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Provision the student's VM if needed, move to the first enabled
    /// exercise, and inject its fault.
    ///
    /// # Errors
    /// Returns [`SessionError::NoExercises`] if nothing is enabled,
    /// [`SessionError::Hypervisor`] / [`SessionError::Queue`] if provisioning
    /// fails, and [`SessionError::Script`] only under
    /// [`UnreachablePolicy::FailFast`].
    pub async fn start(&self, student: &StudentId) -> Result<StartReport, SessionError> {
        let state = self.persisted_state(student).await?;
        let state = transition(state, SessionEvent::Begin)?;

        let exercises = self.store.exercises(true).await?;
        let first = first_enabled(&exercises)
            .ok_or(SessionError::NoExercises)?
            .clone();

        let (vm, provisioned) = match self.store.vm_assignment(student).await? {
            Some(vm) => (vm, false),
            None => self.provision(student).await?,
        };

        transition(state, SessionEvent::Ready { first: first.id })?;
        self.store.update_progress(student, first.id, true).await?;
        tracing::info!(student = %student, exercise = %first.id, vmid = %vm.vmid, "session started");

        let injection_warning = self.inject(student, &vm, &first).await?;

        Ok(StartReport {
            vm,
            provisioned,
            exercise: ExerciseSummary::from(&first),
            injection_warning,
        })
    }

    /// Run the check script for the current exercise and record the attempt.
    ///
    /// Script and connection failures are recorded as a failed attempt and
    /// reported in [`VerifyReport::error`], never returned as errors.
    ///
    /// # Errors
    /// Returns [`SessionError::Transition`] if the session is not started or
    /// `exercise_id` is not the current exercise.
    pub async fn verify(
        &self,
        student: &StudentId,
        exercise_id: ExerciseId,
    ) -> Result<VerifyReport, SessionError> {
        let state = self.persisted_state(student).await?;
        let current = state.current_exercise().ok_or(CoreError::NotStarted)?;
        if current != exercise_id {
            return Err(CoreError::ExerciseMismatch {
                current,
                requested: exercise_id,
            }
            .into());
        }

        let exercise = self
            .store
            .exercise(exercise_id)
            .await?
            .ok_or(SessionError::ExerciseNotFound(exercise_id))?;
        let vm = self.store.vm_assignment(student).await?;

        let outcome = match self.resolve_target(student, vm.as_ref()).await {
            Ok(target) => {
                self.runner
                    .execute_script(&target, &exercise.check, ScriptKind::Check)
                    .await
            }
            Err(e) => Err(e),
        };

        let (attempt, report) = match outcome {
            Ok(out) => {
                let passed = out.success();
                let attempt = Attempt::new(
                    student.clone(),
                    exercise_id,
                    passed,
                    out.stdout.clone(),
                    out.stderr.clone(),
                );
                let report = VerifyReport {
                    exercise_id,
                    passed,
                    exit_code: Some(out.exit_code),
                    stdout: out.stdout,
                    stderr: out.stderr,
                    error: None,
                };
                (attempt, report)
            }
            Err(e) => {
                tracing::warn!(student = %student, exercise = %exercise_id, error = %e, "check could not run");
                let attempt =
                    Attempt::new(student.clone(), exercise_id, false, String::new(), String::new());
                let report = VerifyReport {
                    exercise_id,
                    passed: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(e.to_string()),
                };
                (attempt, report)
            }
        };

        self.store.record_attempt(attempt).await?;
        tracing::info!(student = %student, exercise = %exercise_id, passed = report.passed, "attempt recorded");
        Ok(report)
    }

    /// Roll the VM back to the clean-start checkpoint and move to the next
    /// enabled exercise. The current exercise's latest attempt must have
    /// passed.
    ///
    /// # Errors
    /// Returns [`SessionError::NotPassed`] if the current exercise has not
    /// passed, [`SessionError::Transition`] if the session is not started,
    /// and hypervisor or queue errors if the rollback fails (progress is
    /// then left unchanged).
    pub async fn next(&self, student: &StudentId) -> Result<NextReport, SessionError> {
        let state = self.persisted_state(student).await?;
        let current = state.current_exercise().ok_or(CoreError::NotStarted)?;

        let status = self.store.exercise_status(student, current).await?;
        if status != ExerciseStatus::Passed {
            return Err(SessionError::NotPassed(current));
        }

        let current_exercise = self
            .store
            .exercise(current)
            .await?
            .ok_or(SessionError::ExerciseNotFound(current))?;
        let exercises = self.store.exercises(true).await?;

        let Some(next) = next_enabled(&exercises, &current_exercise).cloned() else {
            transition(state, SessionEvent::Exhausted { from: current })?;
            tracing::info!(student = %student, "all exercises completed");
            return Ok(NextReport::Done);
        };
        transition(
            state,
            SessionEvent::Advance {
                from: current,
                to: next.id,
            },
        )?;

        let vm = self
            .store
            .vm_assignment(student)
            .await?
            .ok_or_else(|| SessionError::NoVm(student.clone()))?;
        self.reset_vm(&vm).await?;

        self.store.update_progress(student, next.id, true).await?;
        tracing::info!(student = %student, from = %current, to = %next.id, "advanced to next exercise");

        let injection_warning = self.inject(student, &vm, &next).await?;
        Ok(NextReport::Advanced {
            exercise: ExerciseSummary::from(&next),
            injection_warning,
        })
    }

    /// Hint number `step` for the student's current exercise.
    ///
    /// # Errors
    /// Returns [`SessionError::Transition`] if the session is not started.
    pub async fn hint(
        &self,
        student: &StudentId,
        step: usize,
    ) -> Result<HintReport, SessionError> {
        let state = self.persisted_state(student).await?;
        let current = state.current_exercise().ok_or(CoreError::NotStarted)?;
        let exercise = self
            .store
            .exercise(current)
            .await?
            .ok_or(SessionError::ExerciseNotFound(current))?;

        let report = match exercise.hint(step) {
            Some(text) => HintReport::Hint {
                exercise_id: current,
                step,
                text: text.to_owned(),
                has_more: step + 1 < exercise.hints.len(),
            },
            None => HintReport::Done {
                exercise_id: current,
            },
        };
        tracing::debug!(student = %student, exercise = %current, step, "hint requested");
        Ok(report)
    }

    /// Where and how to connect to the student's VM.
    ///
    /// # Errors
    /// Returns [`SessionError::NoVm`] if the student has no VM.
    pub async fn connection_info(&self, student: &StudentId) -> Result<ConnectionInfo, SessionError> {
        let vm = self
            .store
            .vm_assignment(student)
            .await?
            .ok_or_else(|| SessionError::NoVm(student.clone()))?;
        let vm_ip = self.resolve_ip(&vm).await;
        Ok(ConnectionInfo {
            vmid: vm.vmid,
            vm_name: vm.vm_name,
            vm_ip,
            snapshot_name: vm.snapshot_name,
            ssh_port: self.config.ssh.as_ref().map(|s| s.port),
            ssh_username: self.config.ssh.as_ref().map(|s| s.username.clone()),
        })
    }

    /// Derived session state, current exercise, live VM power state and
    /// time since the fault was injected.
    ///
    /// # Errors
    /// Returns [`SessionError::Store`] on persistence failure.
    pub async fn status(&self, student: &StudentId) -> Result<SessionStatus, SessionError> {
        let progress = self.store.progress(student).await?;
        let mut state = SessionState::from_progress(progress.as_ref());
        let elapsed_secs = progress
            .as_ref()
            .filter(|p| p.started)
            .and_then(|p| p.elapsed_secs(Utc::now()));
        let in_flight = self
            .provisioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(student);
        if in_flight {
            state = SessionState::Provisioning;
        }

        let mut exercise = None;
        let mut exercise_status = None;
        if let SessionState::Active { exercise: current } = state {
            let status = self.store.exercise_status(student, current).await?;
            if let Some(ex) = self.store.exercise(current).await? {
                if status == ExerciseStatus::Passed {
                    let exercises = self.store.exercises(true).await?;
                    if next_enabled(&exercises, &ex).is_none() {
                        state = transition(state, SessionEvent::Exhausted { from: current })?;
                    }
                }
                exercise = Some(ExerciseSummary::from(&ex));
            }
            exercise_status = Some(status);
        }

        let vm = self.store.vm_assignment(student).await?;
        let power_state = match &vm {
            Some(vm) => match self.hypervisor.status(vm.vmid).await {
                Ok(s) => Some(s.status),
                Err(e) => {
                    tracing::debug!(vmid = %vm.vmid, error = %e, "power state unavailable");
                    None
                }
            },
            None => None,
        };

        Ok(SessionStatus {
            state,
            exercise,
            exercise_status,
            vm,
            power_state,
            elapsed_secs,
        })
    }

    async fn persisted_state(&self, student: &StudentId) -> Result<SessionState, SessionError> {
        let progress = self.store.progress(student).await?;
        Ok(SessionState::from_progress(progress.as_ref()))
    }

    /// Clone, boot, settle, resolve IP, snapshot, persist. Runs as one queue
    /// unit. Re-checks for an existing assignment inside the unit, so a
    /// second start queued behind the first reuses its VM. A clone that fails
    /// any later step is destroyed before the unit returns.
    async fn provision(&self, student: &StudentId) -> Result<(VmAssignment, bool), SessionError> {
        let _guard = ProvisioningGuard::enter(&self.provisioning, student);

        let hypervisor = Arc::clone(&self.hypervisor);
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let student = student.clone();

        let unit = async move {
            if let Some(vm) = store.vm_assignment(&student).await? {
                return Ok((vm, false));
            }

            let name = config.vm_name(student.as_str());
            tracing::info!(student = %student, vm_name = %name, "provisioning VM");

            let clone = hypervisor.clone_from_template(None, &name).await?;
            let vmid = clone.vmid;

            let prepared = async {
                hypervisor.wait_for_task(&clone.task).await?;

                let task = hypervisor.start(vmid).await?;
                hypervisor.wait_for_task(&task).await?;

                tokio::time::sleep(config.settle_delay).await;

                let vm_ip = match hypervisor.ip_address(vmid).await {
                    Some(ip) => Some(ip),
                    None => config.templated_ip(vmid),
                };
                if vm_ip.is_none() {
                    tracing::warn!(student = %student, %vmid, "VM IP unknown after provisioning");
                }

                let task = hypervisor.create_snapshot(vmid, &config.snapshot_name).await?;
                hypervisor.wait_for_task(&task).await?;

                let vm = store
                    .create_vm_assignment(&student, vmid, &name, vm_ip, &config.snapshot_name)
                    .await?;
                Ok::<_, SessionError>(vm)
            }
            .await;

            match prepared {
                Ok(vm) => {
                    tracing::info!(student = %student, %vmid, ip = ?vm.vm_ip, "VM provisioned");
                    Ok((vm, true))
                }
                Err(e) => {
                    tracing::warn!(student = %student, %vmid, error = %e, "provisioning failed");
                    discard_clone(hypervisor.as_ref(), vmid).await;
                    Err(e)
                }
            }
        };

        self.queue.add(unit).await?
    }

    /// Roll back to the clean-start checkpoint and make sure the VM runs.
    /// One queue unit.
    async fn reset_vm(&self, vm: &VmAssignment) -> Result<(), SessionError> {
        let hypervisor = Arc::clone(&self.hypervisor);
        let vmid = vm.vmid;
        let snapshot = vm.snapshot_name.clone();

        let unit = async move {
            let task = hypervisor.rollback_to_snapshot(vmid, &snapshot).await?;
            hypervisor.wait_for_task(&task).await?;

            // A disk-only snapshot leaves the VM stopped after rollback.
            let running = match hypervisor.status(vmid).await {
                Ok(status) => status.is_running(),
                Err(e) => {
                    tracing::debug!(%vmid, error = %e, "status after rollback unavailable");
                    false
                }
            };
            if !running {
                let task = hypervisor.start(vmid).await?;
                hypervisor.wait_for_task(&task).await?;
            }
            tracing::info!(%vmid, snapshot = %snapshot, "VM reset to checkpoint");
            Ok::<_, SessionError>(())
        };

        self.queue.add(unit).await?
    }

    /// Run the exercise's fault script. Failures become a warning string,
    /// except connection failures under the fail-fast policy.
    async fn inject(
        &self,
        student: &StudentId,
        vm: &VmAssignment,
        exercise: &Exercise,
    ) -> Result<Option<String>, SessionError> {
        let outcome = match self.resolve_target(student, Some(vm)).await {
            Ok(target) => {
                self.runner
                    .execute_script(&target, &exercise.fault, ScriptKind::Fault)
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(out) if out.success() => {
                self.store.record_injection(student, exercise.id).await?;
                tracing::info!(student = %student, exercise = %exercise.id, "fault injected");
                Ok(None)
            }
            Ok(out) => {
                let warning = format!(
                    "fault script exited with status {}: {}",
                    out.exit_code,
                    out.stderr.trim()
                );
                tracing::warn!(student = %student, exercise = %exercise.id, %warning, "fault injection failed");
                Ok(Some(warning))
            }
            Err(e @ ScriptError::ConnectionUnavailable { .. })
                if self.config.unreachable == UnreachablePolicy::FailFast =>
            {
                Err(e.into())
            }
            Err(e) => {
                tracing::warn!(student = %student, exercise = %exercise.id, error = %e, "fault injection failed");
                Ok(Some(e.to_string()))
            }
        }
    }

    /// Stored IP, else a fresh guest-agent reading, else the IP template.
    async fn resolve_ip(&self, vm: &VmAssignment) -> Option<Ipv4Addr> {
        if let Some(ip) = vm.vm_ip {
            return Some(ip);
        }
        match self.hypervisor.ip_address(vm.vmid).await {
            Some(ip) => Some(ip),
            None => self.config.templated_ip(vm.vmid),
        }
    }

    async fn resolve_target(
        &self,
        student: &StudentId,
        vm: Option<&VmAssignment>,
    ) -> Result<SshTarget, ScriptError> {
        let unavailable = |reason: &str| ScriptError::ConnectionUnavailable {
            student: student.clone(),
            reason: reason.to_owned(),
        };

        let credentials = self
            .config
            .ssh
            .as_ref()
            .ok_or_else(|| unavailable("no SSH credential configured"))?;
        let vm = vm.ok_or_else(|| unavailable("no VM assigned"))?;
        let host = self
            .resolve_ip(vm)
            .await
            .ok_or_else(|| unavailable("VM IP address unknown"))?;
        Ok(SshTarget::new(host, credentials))
    }
}

/// Best-effort removal of a clone that never became an assignment.
async fn discard_clone<H: Hypervisor + ?Sized>(hypervisor: &H, vmid: Vmid) {
    let destroyed = match hypervisor.destroy(vmid).await {
        Ok(task) => hypervisor.wait_for_task(&task).await,
        Err(e) => Err(e),
    };
    match destroyed {
        Ok(()) => tracing::info!(%vmid, "discarded unfinished VM"),
        Err(e) => tracing::warn!(%vmid, error = %e, "could not discard unfinished VM"),
    }
}
