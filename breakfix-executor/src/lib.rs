//! VM lifecycle and session orchestration for the breakfix trainer.
//!
//! Talks to a Proxmox VE control plane over HTTPS, serializes every
//! hypervisor mutation through one FIFO queue, runs fault and check scripts
//! in student VMs over SSH, and drives each student's session through
//! provision, inject, verify and advance.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod api_client;
pub mod auth;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod orchestrator;
pub mod proxmox;
pub mod queue;
pub mod remote;
pub mod task;

pub use config::{
    Credentials, HypervisorConfig, SessionConfig, SshCredentials, UnreachablePolicy,
};
pub use error::{ConfigError, HypervisorError, QueueError, ScriptError, SessionError};
pub use hypervisor::{CloneOutcome, Hypervisor, VmStatus};
pub use orchestrator::{
    ConnectionInfo, ExerciseSummary, HintReport, NextReport, SessionOrchestrator,
    SessionStatus, StartReport, VerifyReport,
};
pub use proxmox::ProxmoxClient;
pub use queue::{TaskQueue, UnitHandle};
pub use remote::{ScriptOutput, ScriptRunner, SshExecutor, SshTarget};
pub use task::{Clock, ManualClock, TokioClock};
