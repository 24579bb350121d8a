//! In-process fakes for the hypervisor and script runner.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use breakfix_core::{
    Difficulty, Exercise, ExerciseId, MemoryStore, ScriptKind, ScriptSource, StudentId, TaskId,
    Vmid,
};
use breakfix_executor::{
    CloneOutcome, Hypervisor, HypervisorError, ScriptError, ScriptOutput, ScriptRunner,
    SessionConfig, SessionOrchestrator, SshCredentials, SshTarget, TaskQueue, VmStatus,
};

/// Hypervisor call as recorded by [`FakeHypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Clone { vmid: Vmid, name: String },
    Start(Vmid),
    Stop(Vmid),
    Snapshot { vmid: Vmid, name: String },
    Rollback { vmid: Vmid, name: String },
    Destroy(Vmid),
    Wait(TaskId),
}

/// Records every mutating call; every task succeeds immediately.
#[derive(Debug)]
pub struct FakeHypervisor {
    calls: Mutex<Vec<Call>>,
    next_vmid: AtomicU32,
    ip: Mutex<Option<Ipv4Addr>>,
    fail_rollback: AtomicBool,
    fail_snapshot: AtomicBool,
    power: Mutex<String>,
}

impl FakeHypervisor {
    pub fn new(ip: Option<Ipv4Addr>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_vmid: AtomicU32::new(200),
            ip: Mutex::new(ip),
            fail_rollback: AtomicBool::new(false),
            fail_snapshot: AtomicBool::new(false),
            power: Mutex::new("running".to_owned()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn clones(&self) -> usize {
        self.count(|c| matches!(c, Call::Clone { .. }))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|c| matches!(c, Call::Rollback { .. }))
    }

    pub fn destroys(&self) -> usize {
        self.count(|c| matches!(c, Call::Destroy(_)))
    }

    pub fn set_fail_snapshot(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn set_power(&self, state: &str) {
        if let Ok(mut p) = self.power.lock() {
            *p = state.to_owned();
        }
    }

    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn task(kind: &str, vmid: Vmid) -> TaskId {
        TaskId::new(format!("UPID:pve1:{kind}:{vmid}:root@pam:"))
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn next_free_id(&self) -> Result<Vmid, HypervisorError> {
        Ok(Vmid::new(self.next_vmid.load(Ordering::SeqCst)))
    }

    async fn clone_from_template(
        &self,
        target: Option<Vmid>,
        name: &str,
    ) -> Result<CloneOutcome, HypervisorError> {
        let vmid = match target {
            Some(v) => v,
            None => Vmid::new(self.next_vmid.fetch_add(1, Ordering::SeqCst)),
        };
        self.record(Call::Clone {
            vmid,
            name: name.to_owned(),
        });
        Ok(CloneOutcome {
            vmid,
            task: Self::task("qmclone", vmid),
        })
    }

    async fn create_snapshot(&self, vmid: Vmid, name: &str) -> Result<TaskId, HypervisorError> {
        self.record(Call::Snapshot {
            vmid,
            name: name.to_owned(),
        });
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(HypervisorError::TaskFailed {
                task_id: Self::task("qmsnapshot", vmid),
                exit_status: "storage 'local-lvm' does not support snapshots".to_owned(),
            });
        }
        Ok(Self::task("qmsnapshot", vmid))
    }

    async fn rollback_to_snapshot(
        &self,
        vmid: Vmid,
        name: &str,
    ) -> Result<TaskId, HypervisorError> {
        self.record(Call::Rollback {
            vmid,
            name: name.to_owned(),
        });
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(HypervisorError::TaskFailed {
                task_id: Self::task("qmrollback", vmid),
                exit_status: "snapshot 'clean-start' does not exist".to_owned(),
            });
        }
        Ok(Self::task("qmrollback", vmid))
    }

    async fn start(&self, vmid: Vmid) -> Result<TaskId, HypervisorError> {
        self.record(Call::Start(vmid));
        self.set_power("running");
        Ok(Self::task("qmstart", vmid))
    }

    async fn stop(&self, vmid: Vmid) -> Result<TaskId, HypervisorError> {
        self.record(Call::Stop(vmid));
        self.set_power("stopped");
        Ok(Self::task("qmstop", vmid))
    }

    async fn destroy(&self, vmid: Vmid) -> Result<TaskId, HypervisorError> {
        self.record(Call::Destroy(vmid));
        Ok(Self::task("qmdestroy", vmid))
    }

    async fn status(&self, _vmid: Vmid) -> Result<VmStatus, HypervisorError> {
        let status = self
            .power
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|_| "unknown".to_owned());
        Ok(VmStatus {
            status,
            name: None,
            uptime: None,
        })
    }

    async fn ip_address(&self, _vmid: Vmid) -> Option<Ipv4Addr> {
        self.ip.lock().ok().and_then(|ip| *ip)
    }

    async fn wait_for_task(&self, task: &TaskId) -> Result<(), HypervisorError> {
        self.record(Call::Wait(task.clone()));
        Ok(())
    }
}

/// One script run as recorded by [`FakeRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub host: Ipv4Addr,
    pub kind: ScriptKind,
    pub script: ScriptSource,
}

/// Scripted exit codes per kind; can simulate a broken transport.
#[derive(Debug)]
pub struct FakeRunner {
    runs: Mutex<Vec<Run>>,
    fault_exit: AtomicI32,
    check_exit: AtomicI32,
    transport_down: AtomicBool,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            fault_exit: AtomicI32::new(0),
            check_exit: AtomicI32::new(0),
            transport_down: AtomicBool::new(false),
        }
    }
}

impl FakeRunner {
    pub fn runs(&self) -> Vec<Run> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn runs_of(&self, kind: ScriptKind) -> Vec<Run> {
        self.runs().into_iter().filter(|r| r.kind == kind).collect()
    }

    pub fn set_check_exit(&self, code: i32) {
        self.check_exit.store(code, Ordering::SeqCst);
    }

    pub fn set_fault_exit(&self, code: i32) {
        self.fault_exit.store(code, Ordering::SeqCst);
    }

    pub fn set_transport_down(&self, down: bool) {
        self.transport_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScriptRunner for FakeRunner {
    async fn execute_script(
        &self,
        target: &SshTarget,
        script: &ScriptSource,
        kind: ScriptKind,
    ) -> Result<ScriptOutput, ScriptError> {
        if self.transport_down.load(Ordering::SeqCst) {
            return Err(ScriptError::Execution(format!(
                "ssh: connect to host {} port 22: Connection refused",
                target.host
            )));
        }
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(Run {
                host: target.host,
                kind,
                script: script.clone(),
            });
        }
        let exit_code = match kind {
            ScriptKind::Fault => self.fault_exit.load(Ordering::SeqCst),
            ScriptKind::Check => self.check_exit.load(Ordering::SeqCst),
        };
        Ok(ScriptOutput {
            exit_code,
            stdout: format!("{kind} ran\n"),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{kind} failed\n")
            },
        })
    }
}

/// Two enabled exercises and one disabled one between them.
pub fn two_exercises() -> Vec<Exercise> {
    vec![
        Exercise::new(
            ExerciseId::new(1),
            "E1",
            10,
            ScriptSource::inline("#!/bin/sh\necho f1\n"),
            ScriptSource::inline("#!/bin/sh\necho c1\n"),
        )
        .with_hints(["first hint", "second hint"]),
        Exercise::new(
            ExerciseId::new(5),
            "draft",
            15,
            ScriptSource::inline("#!/bin/sh\necho draft\n"),
            ScriptSource::inline("#!/bin/sh\ntrue\n"),
        )
        .with_enabled(false),
        Exercise::new(
            ExerciseId::new(2),
            "E2",
            20,
            ScriptSource::path("/opt/breakfix/faults/f2.sh"),
            ScriptSource::path("/opt/breakfix/checks/c2.sh"),
        )
        .with_difficulty(Difficulty::Hard),
    ]
}

pub fn session_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.settle_delay = Duration::ZERO;
    config.ssh = Some(SshCredentials::new("ops", "/etc/breakfix/id_ed25519"));
    config
}

pub type TestOrchestrator = SessionOrchestrator<FakeHypervisor, FakeRunner, MemoryStore>;

pub struct Harness {
    pub hypervisor: Arc<FakeHypervisor>,
    pub runner: Arc<FakeRunner>,
    pub store: Arc<MemoryStore>,
    pub orchestrator: TestOrchestrator,
}

pub fn harness(ip: Option<Ipv4Addr>, config: SessionConfig) -> Harness {
    let hypervisor = Arc::new(FakeHypervisor::new(ip));
    let runner = Arc::new(FakeRunner::default());
    let store = Arc::new(MemoryStore::with_exercises(two_exercises()));
    let orchestrator = SessionOrchestrator::new(
        Arc::clone(&hypervisor),
        Arc::clone(&runner),
        Arc::clone(&store),
        TaskQueue::new(),
        config,
    );
    Harness {
        hypervisor,
        runner,
        store,
        orchestrator,
    }
}

/// Stand-in `ssh` binary: uploads succeed, every other remote command
/// prints `stderr` and exits with `exit`.
pub struct FakeSsh {
    _dir: tempfile::TempDir,
    pub binary: PathBuf,
}

pub fn fake_ssh(exit: i32, stderr: &str) -> FakeSsh {
    use std::os::unix::fs::PermissionsExt;

    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir: {e}"),
    };
    let script = format!(
        r#"#!/bin/sh
for last; do :; done
case "$last" in
  *"cat > "*) cat > /dev/null ;;
  *) printf '%s' '{stderr}' >&2; exit {exit} ;;
esac
"#
    );
    let binary = dir.path().join("ssh");
    if let Err(e) = std::fs::write(&binary, script) {
        panic!("write fake ssh: {e}");
    }
    if let Err(e) = std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)) {
        panic!("chmod fake ssh: {e}");
    }
    FakeSsh { _dir: dir, binary }
}

pub fn student(name: &str) -> StudentId {
    StudentId::new(name)
}

pub const VM_IP: Ipv4Addr = Ipv4Addr::new(10, 20, 0, 200);
