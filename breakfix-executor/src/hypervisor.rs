//! Hypervisor control-plane abstraction.
//!
//! The session orchestrator only talks to this trait, so tests can swap in
//! an in-process fake instead of a real control plane.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use breakfix_core::{TaskId, Vmid};
use serde::{Deserialize, Serialize};

use crate::HypervisorError;

/// Result of a clone request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    /// Id of the new VM.
    pub vmid: Vmid,
    /// Task to wait on before the clone is usable.
    pub task: TaskId,
}

/// Power state and basic facts about a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    /// `running`, `stopped`, ...
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Seconds since boot.
    #[serde(default)]
    pub uptime: Option<u64>,
}

impl VmStatus {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Typed access to the control plane.
///
/// Mutating methods return a task id as soon as the request is accepted;
/// callers wait with [`Hypervisor::wait_for_task`]. Mutating calls must be
/// admitted through a [`TaskQueue`](crate::TaskQueue).
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Next free VM id in the cluster. Read-only.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] on API failure.
    async fn next_free_id(&self) -> Result<Vmid, HypervisorError>;

    /// Full clone of the configured template. Allocates an id with
    /// [`Hypervisor::next_free_id`] when `target` is `None`.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] on API failure.
    async fn clone_from_template(
        &self,
        target: Option<Vmid>,
        name: &str,
    ) -> Result<CloneOutcome, HypervisorError>;

    /// Take a named snapshot.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] on API failure.
    async fn create_snapshot(&self, vmid: Vmid, name: &str) -> Result<TaskId, HypervisorError>;

    /// Roll back to a named snapshot.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] on API failure.
    async fn rollback_to_snapshot(&self, vmid: Vmid, name: &str)
        -> Result<TaskId, HypervisorError>;

    /// Power on.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] on API failure.
    async fn start(&self, vmid: Vmid) -> Result<TaskId, HypervisorError>;

    /// Power off (hard stop).
    ///
    /// # Errors
    /// Returns [`HypervisorError`] on API failure.
    async fn stop(&self, vmid: Vmid) -> Result<TaskId, HypervisorError>;

    /// Stop, tolerating a VM that is already stopped, then delete.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] if the delete request fails.
    async fn destroy(&self, vmid: Vmid) -> Result<TaskId, HypervisorError>;

    /// Current power state. Read-only.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] on API failure.
    async fn status(&self, vmid: Vmid) -> Result<VmStatus, HypervisorError>;

    /// First non-loopback IPv4 reported by the guest agent. `None` when the
    /// agent is not running or reports nothing; never an error.
    async fn ip_address(&self, vmid: Vmid) -> Option<Ipv4Addr>;

    /// Block until `task` stops.
    ///
    /// # Errors
    /// Returns [`HypervisorError::TaskFailed`] for a non-OK exit status and
    /// [`HypervisorError::TaskTimeout`] past the configured budget.
    async fn wait_for_task(&self, task: &TaskId) -> Result<(), HypervisorError>;
}
