//! Hypervisor, transport, and session configuration.
//!
//! Every setting comes from a `BREAKFIX_*` environment variable. Loading goes
//! through an injectable lookup so tests never touch the process environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use breakfix_core::Vmid;

use crate::ConfigError;

/// Default budget for a single control-plane task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between task status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default pause between powering on a fresh clone and querying its IP.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Name of the checkpoint taken right after provisioning.
pub const CLEAN_START_SNAPSHOT: &str = "clean-start";

/// Connection settings for the hypervisor control plane.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HypervisorConfig {
    /// Base URL, e.g. `https://pve.lab:8006`.
    pub base_url: String,

    /// Node that owns the template and the clones.
    pub node: String,

    /// VM template cloned for every student.
    pub template: Vmid,

    /// Credential mode; `None` fails client construction.
    pub credentials: Option<Credentials>,

    /// Accept self-signed control-plane certificates.
    pub insecure_tls: bool,

    /// Budget for [`crate::Hypervisor::wait_for_task`].
    pub task_timeout: Duration,

    /// Interval between task status polls.
    pub poll_interval: Duration,
}

impl HypervisorConfig {
    /// Create a config with default timings and no credentials.
    #[must_use]
    pub fn new(base_url: impl Into<String>, node: impl Into<String>, template: Vmid) -> Self {
        Self {
            base_url: base_url.into(),
            node: node.into(),
            template,
            credentials: None,
            insecure_tls: false,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Builder-style setter for the credential mode.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Load from an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] for absent required variables and
    /// [`ConfigError::Invalid`] for unparsable ones.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = require(&lookup, "BREAKFIX_PVE_URL")?;
        let node = require(&lookup, "BREAKFIX_PVE_NODE")?;
        let template = Vmid::new(parse_var(&lookup, "BREAKFIX_PVE_TEMPLATE_VMID")?.ok_or(
            ConfigError::Missing("BREAKFIX_PVE_TEMPLATE_VMID"),
        )?);

        let mut config = Self::new(base_url.trim_end_matches('/'), node, template);
        config.credentials = Credentials::from_lookup(&lookup);
        config.insecure_tls = parse_var(&lookup, "BREAKFIX_PVE_INSECURE_TLS")?.unwrap_or(false);
        if let Some(secs) = parse_var::<u64, _>(&lookup, "BREAKFIX_TASK_TIMEOUT_SECS")? {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "BREAKFIX_TASK_POLL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "BREAKFIX_TASK_POLL_SECS",
                    reason: "poll interval must be at least one second".to_owned(),
                });
            }
            config.poll_interval = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Load from the process environment.
    ///
    /// # Errors
    /// See [`HypervisorConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }
}

/// The two supported control-plane credential modes.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Credentials {
    /// Static API token, e.g. `root@pam!breakfix` plus its secret.
    ApiToken { token_id: String, secret: String },

    /// Username/password exchanged for a ticket on every logical call.
    Ticket { username: String, password: String },
}

impl Credentials {
    /// API token mode wins when both modes are configured.
    fn from_lookup<F>(lookup: &F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |k: &str| lookup(k).filter(|v| !v.is_empty());
        if let (Some(token_id), Some(secret)) = (
            non_empty("BREAKFIX_PVE_TOKEN_ID"),
            non_empty("BREAKFIX_PVE_TOKEN_SECRET"),
        ) {
            return Some(Self::ApiToken { token_id, secret });
        }
        if let (Some(username), Some(password)) = (
            non_empty("BREAKFIX_PVE_USER"),
            non_empty("BREAKFIX_PVE_PASSWORD"),
        ) {
            return Some(Self::Ticket { username, password });
        }
        None
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiToken { token_id, .. } => f
                .debug_struct("ApiToken")
                .field("token_id", token_id)
                .field("secret", &"<redacted>")
                .finish(),
            Self::Ticket { username, .. } => f
                .debug_struct("Ticket")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// SSH credential used to reach student VMs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SshCredentials {
    pub username: String,
    pub key_path: PathBuf,
    pub port: u16,
}

impl SshCredentials {
    #[must_use]
    pub fn new(username: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            key_path: key_path.into(),
            port: 22,
        }
    }
}

/// What to do when a student VM cannot be reached for script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum UnreachablePolicy {
    /// Report a warning and keep going.
    #[default]
    Degrade,
    /// Return the connection error to the caller.
    FailFast,
}

impl FromStr for UnreachablePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "fail-fast" | "fail_fast" | "failfast" => Ok(Self::FailFast),
            other => Err(format!("expected 'degrade' or 'fail-fast', got '{other}'")),
        }
    }
}

/// Settings for the session orchestrator.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Checkpoint restored before every exercise.
    pub snapshot_name: String,

    /// Pause after powering on a fresh clone.
    pub settle_delay: Duration,

    /// Fallback IP with `{vmid}` substituted, used when the guest agent
    /// reports nothing.
    pub ip_template: Option<String>,

    /// Prefix for generated VM names.
    pub vm_name_prefix: String,

    /// Unreachable-VM handling.
    pub unreachable: UnreachablePolicy,

    /// Transport credential; `None` makes every connection unavailable.
    pub ssh: Option<SshCredentials>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            snapshot_name: CLEAN_START_SNAPSHOT.to_owned(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            ip_template: None,
            vm_name_prefix: "breakfix".to_owned(),
            unreachable: UnreachablePolicy::Degrade,
            ssh: None,
        }
    }
}

impl SessionConfig {
    /// Load from an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(name) = lookup("BREAKFIX_SNAPSHOT_NAME").filter(|v| !v.is_empty()) {
            config.snapshot_name = name;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "BREAKFIX_SETTLE_SECS")? {
            config.settle_delay = Duration::from_secs(secs);
        }
        config.ip_template = lookup("BREAKFIX_VM_IP_TEMPLATE").filter(|v| !v.is_empty());
        if let Some(prefix) = lookup("BREAKFIX_VM_PREFIX").filter(|v| !v.is_empty()) {
            config.vm_name_prefix = prefix;
        }
        if let Some(policy) = lookup("BREAKFIX_UNREACHABLE_POLICY") {
            config.unreachable = policy.parse().map_err(|reason| ConfigError::Invalid {
                var: "BREAKFIX_UNREACHABLE_POLICY",
                reason,
            })?;
        }
        if let Some(key_path) = lookup("BREAKFIX_SSH_KEY").filter(|v| !v.is_empty()) {
            let username = lookup("BREAKFIX_SSH_USER")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "root".to_owned());
            let mut ssh = SshCredentials::new(username, key_path);
            if let Some(port) = parse_var(&lookup, "BREAKFIX_SSH_PORT")? {
                ssh.port = port;
            }
            config.ssh = Some(ssh);
        }
        Ok(config)
    }

    /// Load from the process environment.
    ///
    /// # Errors
    /// See [`SessionConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// VM name for a student: `<prefix>-<student>`, restricted to
    /// `[A-Za-z0-9-]` as the control plane requires DNS-safe names.
    #[must_use]
    pub fn vm_name(&self, student: &str) -> String {
        let sanitized: String = student
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("{}-{sanitized}", self.vm_name_prefix)
    }

    /// Apply the IP template for `vmid`, if one is configured and the result
    /// parses as an IPv4 address.
    #[must_use]
    pub fn templated_ip(&self, vmid: Vmid) -> Option<std::net::Ipv4Addr> {
        let template = self.ip_template.as_deref()?;
        template.replace("{vmid}", &vmid.to_string()).parse().ok()
    }
}

fn require<F>(lookup: &F, var: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(var))
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |k| map.get(k).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("BREAKFIX_PVE_URL", "https://pve.lab:8006/"),
        ("BREAKFIX_PVE_NODE", "pve1"),
        ("BREAKFIX_PVE_TEMPLATE_VMID", "9000"),
    ];

    #[test]
    fn hypervisor_config_missing_url_is_reported() {
        let result = HypervisorConfig::from_lookup(lookup_from(&[]));
        assert!(matches!(result, Err(ConfigError::Missing("BREAKFIX_PVE_URL"))));
    }

    #[test]
    fn hypervisor_config_prefers_api_token_over_ticket() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("BREAKFIX_PVE_TOKEN_ID", "root@pam!breakfix"),
            ("BREAKFIX_PVE_TOKEN_SECRET", "s3cr3t"),
            ("BREAKFIX_PVE_USER", "root@pam"),
            ("BREAKFIX_PVE_PASSWORD", "hunter2"),
        ]);
        let config = match HypervisorConfig::from_lookup(lookup_from(&pairs)) {
            Ok(c) => c,
            Err(e) => panic!("config should load: {e}"),
        };
        assert!(matches!(config.credentials, Some(Credentials::ApiToken { .. })));
        assert_eq!(config.base_url, "https://pve.lab:8006", "trailing slash trimmed");
        assert_eq!(config.template, Vmid::new(9000));
        assert_eq!(config.task_timeout, DEFAULT_TASK_TIMEOUT);
    }

    #[test]
    fn hypervisor_config_invalid_template_is_reported() {
        let pairs = [
            ("BREAKFIX_PVE_URL", "https://pve"),
            ("BREAKFIX_PVE_NODE", "pve1"),
            ("BREAKFIX_PVE_TEMPLATE_VMID", "nine-thousand"),
        ];
        let result = HypervisorConfig::from_lookup(lookup_from(&pairs));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { var: "BREAKFIX_PVE_TEMPLATE_VMID", .. })
        ));
    }

    #[test]
    fn hypervisor_config_rejects_zero_poll_interval() {
        let mut pairs = BASE.to_vec();
        pairs.push(("BREAKFIX_TASK_POLL_SECS", "0"));
        let result = HypervisorConfig::from_lookup(lookup_from(&pairs));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { var: "BREAKFIX_TASK_POLL_SECS", .. })
        ));

        let mut pairs = BASE.to_vec();
        pairs.push(("BREAKFIX_TASK_POLL_SECS", "5"));
        let config = match HypervisorConfig::from_lookup(lookup_from(&pairs)) {
            Ok(c) => c,
            Err(e) => panic!("config should load: {e}"),
        };
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials::Ticket {
            username: "root@pam".to_owned(),
            password: "hunter2".to_owned(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"), "password must not be printed");
        assert!(rendered.contains("root@pam"));
    }

    #[test]
    fn session_config_defaults_without_variables() {
        let config = match SessionConfig::from_lookup(lookup_from(&[])) {
            Ok(c) => c,
            Err(e) => panic!("defaults should load: {e}"),
        };
        assert_eq!(config.snapshot_name, CLEAN_START_SNAPSHOT);
        assert_eq!(config.settle_delay, DEFAULT_SETTLE_DELAY);
        assert_eq!(config.unreachable, UnreachablePolicy::Degrade);
        assert!(config.ssh.is_none());
    }

    #[test]
    fn session_config_reads_ssh_and_policy() {
        let config = match SessionConfig::from_lookup(lookup_from(&[
            ("BREAKFIX_SSH_KEY", "/etc/breakfix/id_ed25519"),
            ("BREAKFIX_SSH_PORT", "2222"),
            ("BREAKFIX_UNREACHABLE_POLICY", "fail-fast"),
        ])) {
            Ok(c) => c,
            Err(e) => panic!("config should load: {e}"),
        };
        let ssh = config.ssh.as_ref().map(|s| (s.username.as_str(), s.port));
        assert_eq!(ssh, Some(("root", 2222)));
        assert_eq!(config.unreachable, UnreachablePolicy::FailFast);
    }

    #[test]
    fn session_config_rejects_unknown_policy() {
        let result =
            SessionConfig::from_lookup(lookup_from(&[("BREAKFIX_UNREACHABLE_POLICY", "panic")]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn vm_name_replaces_unsafe_characters() {
        let config = SessionConfig::default();
        assert_eq!(config.vm_name("jane.doe@uni"), "breakfix-jane-doe-uni");
    }

    #[test]
    fn templated_ip_substitutes_vmid() {
        let config = SessionConfig {
            ip_template: Some("10.20.0.{vmid}".to_owned()),
            ..SessionConfig::default()
        };
        assert_eq!(
            config.templated_ip(Vmid::new(105)),
            Some(std::net::Ipv4Addr::new(10, 20, 0, 105))
        );
        assert_eq!(config.templated_ip(Vmid::new(1050)), None, "not a valid octet");
    }
}
