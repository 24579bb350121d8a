//! Fault and check script execution inside student VMs.
//!
//! Uses the system OpenSSH client through `tokio::process::Command`, so the
//! caller stays async and no SSH implementation is linked in.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use breakfix_core::{ScriptKind, ScriptSource};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SshCredentials;
use crate::ScriptError;

/// Options shared by every ssh invocation.
///
/// Student VMs are clones of one template and get rolled back constantly, so
/// host keys are neither checked nor recorded. `BatchMode` makes a missing key
/// fail instead of prompting.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

/// ssh exits with 255 when the connection itself failed.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Everything needed to reach one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshTarget {
    pub host: Ipv4Addr,
    pub port: u16,
    pub username: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    #[must_use]
    pub fn new(host: Ipv4Addr, credentials: &SshCredentials) -> Self {
        Self {
            host,
            port: credentials.port,
            username: credentials.username.clone(),
            key_path: credentials.key_path.clone(),
        }
    }
}

/// Captured result of one script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one script on one VM.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `script` on `target` with elevated privilege.
    ///
    /// # Errors
    /// Returns [`ScriptError::Execution`] when the transport fails, including
    /// ssh's own exit status 255. A script that runs and exits non-zero is
    /// not an error.
    async fn execute_script(
        &self,
        target: &SshTarget,
        script: &ScriptSource,
        kind: ScriptKind,
    ) -> Result<ScriptOutput, ScriptError>;
}

/// [`ScriptRunner`] over the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    binary: PathBuf,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
        }
    }
}

impl SshExecutor {
    /// Use a specific `ssh` binary.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn ssh(
        &self,
        target: &SshTarget,
        remote_command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Output, ScriptError> {
        let mut child = Command::new(&self.binary)
            .args(ssh_args(target, remote_command))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScriptError::Execution(format!("spawn {}: {e}", self.binary.display())))?;

        if let Some(bytes) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| ScriptError::Execution("ssh stdin not piped".to_owned()))?;
            pipe.write_all(bytes)
                .await
                .map_err(|e| ScriptError::Execution(format!("stream script to {}: {e}", target.host)))?;
            // Close stdin so the remote `cat` sees EOF.
            drop(pipe);
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| ScriptError::Execution(format!("wait for ssh: {e}")))
    }
}

#[async_trait]
impl ScriptRunner for SshExecutor {
    async fn execute_script(
        &self,
        target: &SshTarget,
        script: &ScriptSource,
        kind: ScriptKind,
    ) -> Result<ScriptOutput, ScriptError> {
        let elevate = elevation_prefix(&target.username);

        let output = match script {
            ScriptSource::Path(path) => {
                tracing::info!(host = %target.host, %kind, path, "running installed script");
                self.ssh(target, &format!("{elevate}{}", shell_quote(path)), None)
                    .await?
            }
            ScriptSource::Inline(content) => {
                let remote_path = temp_script_path(kind);
                let quoted = shell_quote(&remote_path);

                tracing::info!(host = %target.host, %kind, path = %remote_path, "uploading script");
                let upload = self
                    .ssh(
                        target,
                        &format!("umask 077 && cat > {quoted} && chmod 700 {quoted}"),
                        Some(content.as_bytes()),
                    )
                    .await?;
                if !upload.status.success() {
                    return Err(ScriptError::Execution(format!(
                        "upload to {} failed ({}): {}",
                        target.host,
                        upload.status,
                        String::from_utf8_lossy(&upload.stderr).trim()
                    )));
                }

                let run = self.ssh(target, &format!("{elevate}{quoted}"), None).await;

                match self.ssh(target, &format!("{elevate}rm -f {quoted}"), None).await {
                    Ok(out) if out.status.success() => {}
                    Ok(out) => tracing::debug!(path = %remote_path, status = %out.status, "temp script cleanup failed"),
                    Err(e) => tracing::debug!(path = %remote_path, error = %e, "temp script cleanup failed"),
                }

                run?
            }
        };

        let result = script_output(target, &output)?;
        tracing::info!(host = %target.host, %kind, exit_code = result.exit_code, "script finished");
        Ok(result)
    }
}

/// Captured output of the run step, or the transport failure ssh reported.
fn script_output(target: &SshTarget, output: &Output) -> Result<ScriptOutput, ScriptError> {
    let exit_code = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if exit_code == SSH_TRANSPORT_FAILURE {
        return Err(ScriptError::Execution(format!(
            "ssh to {} failed: {}",
            target.host,
            stderr.trim()
        )));
    }
    Ok(ScriptOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
    })
}

/// Argument vector for one ssh invocation.
fn ssh_args(target: &SshTarget, remote_command: &str) -> Vec<String> {
    let mut args: Vec<String> = SSH_OPTS.iter().map(|s| (*s).to_owned()).collect();
    args.push("-i".to_owned());
    args.push(target.key_path.display().to_string());
    args.push("-p".to_owned());
    args.push(target.port.to_string());
    args.push(format!("{}@{}", target.username, target.host));
    args.push(remote_command.to_owned());
    args
}

/// `root` runs scripts directly; anyone else goes through non-interactive sudo.
fn elevation_prefix(username: &str) -> &'static str {
    if username == "root" {
        ""
    } else {
        "sudo -n "
    }
}

/// Fresh, unique path for an uploaded script.
fn temp_script_path(kind: ScriptKind) -> String {
    format!("/tmp/breakfix-{kind}-{}.sh", Uuid::new_v4().simple())
}

/// Quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
